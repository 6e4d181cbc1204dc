//! Stream driver implementations.
//!
//! [`LoopbackDriver`] is the in-process mock used when `mock_streams` is
//! set: it records every call, transitions its status like a real player,
//! and never touches the system. [`ProcessDriver`] spawns the external
//! player program for the stream's kind and controls it through the
//! player's FIFO and status files.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::process::{Child, Command};

use crate::model::{Stream, StreamKind};
use crate::stream::{
    kind_supports, DriverError, DriverFactory, DriverResult, DriverStatus, StreamCommand,
    StreamDriver, StreamInfo,
};

// ─────────────────────────────────────────────────────────────────────────────
// Loopback (mock) driver
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Default)]
struct LoopbackState {
    status: DriverStatus,
    source: Option<usize>,
    /// Every call in order, for test assertions.
    calls: Vec<String>,
}

/// Mock driver: honors the kind's command set, records calls, always
/// succeeds.
pub struct LoopbackDriver {
    kind: StreamKind,
    name: String,
    state: Mutex<LoopbackState>,
}

impl LoopbackDriver {
    pub fn new(stream: &Stream) -> LoopbackDriver {
        LoopbackDriver {
            kind: stream.kind,
            name: stream.name.clone(),
            state: Mutex::new(LoopbackState::default()),
        }
    }

    /// Calls recorded so far, e.g. `["connect(0)", "disconnect"]`.
    pub fn calls(&self) -> Vec<String> {
        self.state.lock().calls.clone()
    }

    pub fn current_source(&self) -> Option<usize> {
        self.state.lock().source
    }
}

#[async_trait]
impl StreamDriver for LoopbackDriver {
    async fn connect(&self, source_id: usize) -> DriverResult<()> {
        let mut state = self.state.lock();
        state.calls.push(format!("connect({})", source_id));
        state.source = Some(source_id);
        state.status = DriverStatus::Connected;
        Ok(())
    }

    async fn disconnect(&self) -> DriverResult<()> {
        let mut state = self.state.lock();
        state.calls.push("disconnect".to_string());
        state.source = None;
        state.status = DriverStatus::Disconnected;
        Ok(())
    }

    async fn command(&self, cmd: &StreamCommand) -> DriverResult<()> {
        if !kind_supports(self.kind, cmd) {
            return Err(DriverError::Unsupported);
        }
        let mut state = self.state.lock();
        state.calls.push(cmd.to_string());
        match cmd {
            StreamCommand::Play | StreamCommand::Next => state.status = DriverStatus::Playing,
            StreamCommand::Pause => state.status = DriverStatus::Paused,
            StreamCommand::Stop => state.status = DriverStatus::Stopped,
            StreamCommand::Station(_) => state.status = DriverStatus::Playing,
            StreamCommand::Love | StreamCommand::Ban | StreamCommand::Shelve => {}
        }
        Ok(())
    }

    async fn info(&self) -> StreamInfo {
        let state = self.state.lock();
        StreamInfo {
            artist: "Loopback".to_string(),
            album: self.kind.as_str().to_string(),
            track: self.name.clone(),
            img_url: String::new(),
            status: state.status,
        }
    }
}

/// Factory producing [`LoopbackDriver`]s for every kind.
pub struct LoopbackFactory;

impl DriverFactory for LoopbackFactory {
    fn create(&self, stream: &Stream) -> Arc<dyn StreamDriver> {
        Arc::new(LoopbackDriver::new(stream))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Process-backed driver
// ─────────────────────────────────────────────────────────────────────────────

/// Driver that runs the external player program for its stream kind.
///
/// Each instance gets a private runtime directory holding the player's
/// config, control FIFO, and now-playing file. Pandora is driven through
/// pianobar's control FIFO; the other kinds are start/stop only.
pub struct ProcessDriver {
    kind: StreamKind,
    name: String,
    url: Option<String>,
    user: Option<String>,
    password: Option<String>,
    station: Option<String>,
    dir: PathBuf,
    child: Mutex<Option<Child>>,
    status: Mutex<DriverStatus>,
    source: Mutex<Option<usize>>,
}

impl ProcessDriver {
    pub fn new(stream: &Stream, base_dir: &std::path::Path) -> ProcessDriver {
        ProcessDriver {
            kind: stream.kind,
            name: stream.name.clone(),
            url: stream.url.clone(),
            user: stream.user.clone(),
            password: stream.password.clone(),
            station: stream.station.clone(),
            dir: base_dir.join(format!("stream_{}", stream.id)),
            child: Mutex::new(None),
            status: Mutex::new(DriverStatus::Disconnected),
            source: Mutex::new(None),
        }
    }

    fn ctl_path(&self) -> PathBuf {
        self.dir.join("ctl")
    }

    fn now_playing_path(&self) -> PathBuf {
        self.dir.join("currentSong")
    }

    /// Builds the player invocation for this kind. `source_id` selects the
    /// ALSA output the preamp exposes per digital input.
    fn player_command(&self, source_id: usize) -> Command {
        let output = format!("ch{}", source_id);
        let mut cmd = match self.kind {
            StreamKind::Pandora => {
                let mut c = Command::new("pianobar");
                c.env("XDG_CONFIG_HOME", &self.dir);
                c
            }
            StreamKind::Airplay | StreamKind::Shairport => {
                let mut c = Command::new("shairport-sync");
                c.arg("-a")
                    .arg(&self.name)
                    .args(["-o", "alsa", "--", "-d"])
                    .arg(&output);
                c
            }
            StreamKind::Spotify => {
                let mut c = Command::new("librespot");
                c.arg("--name").arg(&self.name).arg("--device").arg(&output);
                c
            }
            StreamKind::InternetRadio | StreamKind::Dlna => {
                let mut c = Command::new("cvlc");
                c.arg(self.url.as_deref().unwrap_or_default())
                    .arg("--aout=alsa")
                    .arg(format!("--alsa-audio-device={}", output));
                c
            }
        };
        cmd.stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        cmd
    }

    /// Writes pianobar's config (credentials, FIFO, event script) into the
    /// driver directory before first spawn.
    async fn write_pandora_config(&self) -> DriverResult<()> {
        let cfg_dir = self.dir.join("pianobar");
        tokio::fs::create_dir_all(&cfg_dir)
            .await
            .map_err(|e| DriverError::Failed(e.to_string()))?;
        let mut config = format!(
            "user = {}\npassword = {}\nfifo = {}\n",
            self.user.as_deref().unwrap_or_default(),
            self.password.as_deref().unwrap_or_default(),
            self.ctl_path().display()
        );
        if let Some(station) = &self.station {
            config.push_str(&format!("autostart_station = {}\n", station));
        }
        tokio::fs::write(cfg_dir.join("config"), config)
            .await
            .map_err(|e| DriverError::Failed(e.to_string()))?;
        make_fifo(&self.ctl_path())?;
        Ok(())
    }

    /// Sends a control character to the player's FIFO.
    async fn write_ctl(&self, data: &str) -> DriverResult<()> {
        tokio::fs::write(self.ctl_path(), data)
            .await
            .map_err(|e| DriverError::Failed(format!("ctl write: {}", e)))
    }
}

#[cfg(target_os = "linux")]
fn make_fifo(path: &std::path::Path) -> DriverResult<()> {
    use std::os::unix::ffi::OsStrExt;
    if path.exists() {
        return Ok(());
    }
    let cpath = std::ffi::CString::new(path.as_os_str().as_bytes())
        .map_err(|e| DriverError::Failed(e.to_string()))?;
    let rc = unsafe { libc::mkfifo(cpath.as_ptr(), 0o600) };
    if rc != 0 {
        return Err(DriverError::Failed(format!(
            "mkfifo {}: {}",
            path.display(),
            std::io::Error::last_os_error()
        )));
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn make_fifo(_path: &std::path::Path) -> DriverResult<()> {
    Ok(())
}

#[async_trait]
impl StreamDriver for ProcessDriver {
    async fn connect(&self, source_id: usize) -> DriverResult<()> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| DriverError::Failed(e.to_string()))?;
        if self.kind == StreamKind::Pandora {
            self.write_pandora_config().await?;
        }
        let child = self
            .player_command(source_id)
            .spawn()
            .map_err(|e| DriverError::Failed(format!("spawn {}: {}", self.kind.as_str(), e)))?;
        *self.child.lock() = Some(child);
        *self.status.lock() = DriverStatus::Connected;
        *self.source.lock() = Some(source_id);
        Ok(())
    }

    async fn disconnect(&self) -> DriverResult<()> {
        let child = self.child.lock().take();
        if let Some(mut child) = child {
            if let Err(e) = child.start_kill() {
                log::warn!("[Streams] kill {} failed: {}", self.kind.as_str(), e);
            }
            let _ = child.wait().await;
        }
        *self.status.lock() = DriverStatus::Disconnected;
        *self.source.lock() = None;
        Ok(())
    }

    async fn command(&self, cmd: &StreamCommand) -> DriverResult<()> {
        if !kind_supports(self.kind, cmd) {
            return Err(DriverError::Unsupported);
        }
        match self.kind {
            StreamKind::Pandora => {
                // pianobar control characters.
                let ctl = match cmd {
                    StreamCommand::Play => "P".to_string(),
                    StreamCommand::Pause => "S".to_string(),
                    StreamCommand::Next => "n".to_string(),
                    StreamCommand::Stop => "S".to_string(),
                    StreamCommand::Love => "+".to_string(),
                    StreamCommand::Ban => "-".to_string(),
                    StreamCommand::Shelve => "t".to_string(),
                    StreamCommand::Station(id) => format!("s{}\n", id),
                };
                self.write_ctl(&ctl).await?;
            }
            StreamKind::InternetRadio => {
                // vlc has no FIFO here: stop kills the player, play restarts
                // it on the last connected output.
                match cmd {
                    StreamCommand::Stop | StreamCommand::Pause => {
                        let child = self.child.lock().take();
                        if let Some(mut child) = child {
                            let _ = child.start_kill();
                            let _ = child.wait().await;
                        }
                    }
                    StreamCommand::Play => {
                        let running = self.child.lock().is_some();
                        if !running {
                            if let Some(source_id) = *self.source.lock() {
                                let child = self.player_command(source_id).spawn().map_err(
                                    |e| DriverError::Failed(format!("spawn cvlc: {}", e)),
                                )?;
                                *self.child.lock() = Some(child);
                            }
                        }
                    }
                    _ => {}
                }
            }
            _ => return Err(DriverError::Unsupported),
        }
        let mut status = self.status.lock();
        *status = match cmd {
            StreamCommand::Play | StreamCommand::Next | StreamCommand::Station(_) => {
                DriverStatus::Playing
            }
            StreamCommand::Pause => DriverStatus::Paused,
            StreamCommand::Stop => DriverStatus::Stopped,
            _ => *status,
        };
        Ok(())
    }

    async fn info(&self) -> StreamInfo {
        let status = *self.status.lock();
        // pianobar's event script maintains a JSON now-playing file.
        match tokio::fs::read_to_string(self.now_playing_path()).await {
            Ok(contents) => match serde_json::from_str::<StreamInfo>(&contents) {
                Ok(mut info) => {
                    info.status = status;
                    info
                }
                Err(_) => StreamInfo {
                    status,
                    ..Default::default()
                },
            },
            Err(_) => StreamInfo {
                status,
                ..Default::default()
            },
        }
    }
}

/// Factory producing [`ProcessDriver`]s rooted under `base_dir`.
pub struct PlayerFactory {
    base_dir: PathBuf,
}

impl PlayerFactory {
    pub fn new(base_dir: PathBuf) -> PlayerFactory {
        PlayerFactory { base_dir }
    }
}

impl DriverFactory for PlayerFactory {
    fn create(&self, stream: &Stream) -> Arc<dyn StreamDriver> {
        Arc::new(ProcessDriver::new(stream, &self.base_dir))
    }
}
