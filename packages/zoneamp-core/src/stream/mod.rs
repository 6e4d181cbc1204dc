//! Stream driver abstraction.
//!
//! A [`StreamDriver`] wraps one external audio producer (a Pandora session,
//! an AirPlay endpoint, an internet radio player). Drivers are created
//! lazily when a stream is first bound to a source and torn down when
//! unbound or deleted; the [`StreamRegistry`](registry::StreamRegistry)
//! owns every live instance.

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::model::StreamKind;

pub mod drivers;
pub mod registry;

pub use drivers::{LoopbackDriver, LoopbackFactory, PlayerFactory};
pub use registry::StreamRegistry;

/// Commands accepted by stream drivers.
///
/// Which commands a driver honors depends on its kind; see
/// [`StreamKind::supports`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamCommand {
    Play,
    Pause,
    Next,
    Stop,
    Love,
    Ban,
    Shelve,
    /// Pandora station select by station id.
    Station(u64),
}

impl FromStr for StreamCommand {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "play" => Ok(Self::Play),
            "pause" => Ok(Self::Pause),
            "next" => Ok(Self::Next),
            "stop" => Ok(Self::Stop),
            "love" => Ok(Self::Love),
            "ban" => Ok(Self::Ban),
            "shelve" => Ok(Self::Shelve),
            other => {
                if let Some(id) = other.strip_prefix("station=") {
                    id.parse()
                        .map(Self::Station)
                        .map_err(|_| format!("invalid station id in {:?}", other))
                } else {
                    Err(format!("unknown stream command {:?}", other))
                }
            }
        }
    }
}

impl fmt::Display for StreamCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Play => write!(f, "play"),
            Self::Pause => write!(f, "pause"),
            Self::Next => write!(f, "next"),
            Self::Stop => write!(f, "stop"),
            Self::Love => write!(f, "love"),
            Self::Ban => write!(f, "ban"),
            Self::Shelve => write!(f, "shelve"),
            Self::Station(id) => write!(f, "station={}", id),
        }
    }
}

/// Playback state reported by a driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DriverStatus {
    Playing,
    Paused,
    Stopped,
    Connected,
    #[default]
    Disconnected,
}

/// Now-playing metadata reported by a driver.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StreamInfo {
    #[serde(default)]
    pub artist: String,
    #[serde(default)]
    pub album: String,
    #[serde(default)]
    pub track: String,
    #[serde(default)]
    pub img_url: String,
    #[serde(default)]
    pub status: DriverStatus,
}

/// Errors surfaced by a stream driver.
#[derive(Debug, Error)]
pub enum DriverError {
    /// The driver's kind does not implement the command.
    #[error("unsupported command")]
    Unsupported,

    /// The underlying player failed.
    #[error("{0}")]
    Failed(String),
}

pub type DriverResult<T> = Result<T, DriverError>;

/// One external audio producer bound to at most one source.
///
/// Implementations must return within the registry's timeout bound; a
/// hung player is surfaced to the controller as a timeout, not a hang.
#[async_trait]
pub trait StreamDriver: Send + Sync {
    /// Attaches the producer's output to a source's digital input.
    async fn connect(&self, source_id: usize) -> DriverResult<()>;

    /// Detaches from the current source and stops producing audio.
    async fn disconnect(&self) -> DriverResult<()>;

    /// Dispatches a playback command.
    async fn command(&self, cmd: &StreamCommand) -> DriverResult<()>;

    /// Reports now-playing metadata and playback state.
    async fn info(&self) -> StreamInfo;
}

/// Creates driver instances for streams; selected by the `mock_streams`
/// startup flag.
pub trait DriverFactory: Send + Sync {
    fn create(&self, stream: &crate::model::Stream) -> std::sync::Arc<dyn StreamDriver>;
}

/// Command support matrix per stream kind.
///
/// Pandora is fully controllable; internet radio can be started and
/// stopped; the remaining kinds are controlled from the producing device
/// and accept no commands here.
pub fn kind_supports(kind: StreamKind, cmd: &StreamCommand) -> bool {
    match kind {
        StreamKind::Pandora => true,
        StreamKind::InternetRadio => matches!(
            cmd,
            StreamCommand::Play | StreamCommand::Pause | StreamCommand::Stop
        ),
        StreamKind::Airplay | StreamKind::Shairport | StreamKind::Dlna | StreamKind::Spotify => {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commands_parse_from_path_segments() {
        assert_eq!("play".parse::<StreamCommand>().unwrap(), StreamCommand::Play);
        assert_eq!(
            "station=4610303469018478727".parse::<StreamCommand>().unwrap(),
            StreamCommand::Station(4610303469018478727)
        );
        assert!("rewind".parse::<StreamCommand>().is_err());
        assert!("station=abc".parse::<StreamCommand>().is_err());
    }

    #[test]
    fn command_display_round_trips() {
        for cmd in [
            StreamCommand::Play,
            StreamCommand::Ban,
            StreamCommand::Station(42),
        ] {
            assert_eq!(cmd.to_string().parse::<StreamCommand>().unwrap(), cmd);
        }
    }

    #[test]
    fn ban_is_pandora_only() {
        assert!(kind_supports(StreamKind::Pandora, &StreamCommand::Ban));
        assert!(!kind_supports(StreamKind::InternetRadio, &StreamCommand::Ban));
        assert!(!kind_supports(StreamKind::Airplay, &StreamCommand::Play));
    }
}
