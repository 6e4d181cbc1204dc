//! Typed configuration document for the ZoneAmp controller.
//!
//! Provides the entity types ([`Source`], [`Zone`], [`Group`], [`Stream`],
//! [`Preset`]) that make up the system [`Status`], the sparse `*Update`
//! counterparts used by PATCH operations and presets, and the merge and
//! validation primitives the controller builds its transactions on.
//!
//! Serialization follows unset-elision: fields holding their documented
//! default are omitted, so snapshots and presets stay small and diffable.

use std::collections::HashSet;

use serde::{Deserialize, Serialize};

use crate::error::{ApiError, ApiResult};

/// Number of fixed audio sources on the preamp board.
pub const NUM_SOURCES: usize = 4;

/// Zones provided by each 6-channel amplifier unit.
pub const ZONES_PER_UNIT: usize = 6;

/// Maximum number of chainable amplifier units.
pub const MAX_UNITS: usize = 6;

/// Minimum zone attenuation in dB (quietest).
pub const MIN_VOL: i8 = -79;

/// Maximum zone attenuation in dB (loudest).
pub const MAX_VOL: i8 = 0;

/// First id handed out to user-created streams.
pub const FIRST_STREAM_ID: u64 = 1000;

/// First id handed out to user-created presets.
pub const FIRST_PRESET_ID: u64 = 10_000;

/// Reserved preset id holding the configuration captured before the most
/// recent preset load. Loading it reverts that load.
pub const LAST_CONFIG_ID: u64 = 9999;

/// Source input value for the analog RCA connection.
pub const INPUT_LOCAL: &str = "local";

/// Clamps a volume computed in wider arithmetic back into the dB range.
pub fn clamp_vol(vol: i32) -> i8 {
    vol.clamp(MIN_VOL as i32, MAX_VOL as i32) as i8
}

fn is_false(v: &bool) -> bool {
    !*v
}

fn is_zero_i8(v: &i8) -> bool {
    *v == 0
}

fn is_zero_usize(v: &usize) -> bool {
    *v == 0
}

fn default_input() -> String {
    INPUT_LOCAL.to_string()
}

fn is_local_input(v: &String) -> bool {
    v == INPUT_LOCAL
}

// ─────────────────────────────────────────────────────────────────────────────
// Sources
// ─────────────────────────────────────────────────────────────────────────────

/// One of the four fixed audio inputs that can be routed to zones.
///
/// `input` encodes the audio origin: `"local"` for the analog RCA connection
/// or `"stream=<id>"` to bind an existing [`Stream`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Source {
    pub id: usize,
    pub name: String,
    #[serde(default = "default_input", skip_serializing_if = "is_local_input")]
    pub input: String,
}

/// Sparse update for a [`Source`]; absent fields are left unchanged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub input: Option<String>,
}

impl Source {
    /// Parses the bound stream id out of `input`, if any.
    pub fn stream_id(&self) -> Option<u64> {
        self.input.strip_prefix("stream=")?.parse().ok()
    }

    /// A source is digital whenever it is not fed by the local RCA input.
    pub fn is_digital(&self) -> bool {
        self.input != INPUT_LOCAL
    }

    /// Merges `update` over this source and validates the result.
    pub fn apply(&self, update: &SourceUpdate) -> ApiResult<Source> {
        let merged = Source {
            id: self.id,
            name: update.name.clone().unwrap_or_else(|| self.name.clone()),
            input: update.input.clone().unwrap_or_else(|| self.input.clone()),
        };
        merged.validate()?;
        Ok(merged)
    }

    /// Structural validation: id range, non-empty name, well-formed input.
    pub fn validate(&self) -> ApiResult<()> {
        if self.id >= NUM_SOURCES {
            return Err(ApiError::InvalidField(format!(
                "source id {} out of range 0..{}",
                self.id, NUM_SOURCES
            )));
        }
        if self.name.is_empty() {
            return Err(ApiError::InvalidField("source name must not be empty".into()));
        }
        if self.input != INPUT_LOCAL && self.stream_id().is_none() {
            return Err(ApiError::InvalidField(format!(
                "source input must be \"local\" or \"stream=<id>\", got {:?}",
                self.input
            )));
        }
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Zones
// ─────────────────────────────────────────────────────────────────────────────

/// An amplified stereo output (a room), attributable to exactly one source.
///
/// `vol` is attenuation in dB: 0 is max volume, -79 is min.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Zone {
    pub id: usize,
    pub name: String,
    #[serde(default, skip_serializing_if = "is_zero_usize")]
    pub source_id: usize,
    #[serde(default, skip_serializing_if = "is_false")]
    pub mute: bool,
    #[serde(default, skip_serializing_if = "is_false")]
    pub stby: bool,
    #[serde(default, skip_serializing_if = "is_zero_i8")]
    pub vol: i8,
    #[serde(default, skip_serializing_if = "is_false")]
    pub disabled: bool,
}

/// Sparse update for a [`Zone`]; absent fields are left unchanged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ZoneUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_id: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mute: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stby: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vol: Option<i8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disabled: Option<bool>,
}

impl Zone {
    /// Merges `update` over this zone and validates the result.
    pub fn apply(&self, update: &ZoneUpdate) -> ApiResult<Zone> {
        let merged = Zone {
            id: self.id,
            name: update.name.clone().unwrap_or_else(|| self.name.clone()),
            source_id: update.source_id.unwrap_or(self.source_id),
            mute: update.mute.unwrap_or(self.mute),
            stby: update.stby.unwrap_or(self.stby),
            vol: update.vol.unwrap_or(self.vol),
            disabled: update.disabled.unwrap_or(self.disabled),
        };
        merged.validate()?;
        Ok(merged)
    }

    /// Structural validation: source range, volume range, non-empty name.
    pub fn validate(&self) -> ApiResult<()> {
        if self.name.is_empty() {
            return Err(ApiError::InvalidField("zone name must not be empty".into()));
        }
        if self.source_id >= NUM_SOURCES {
            return Err(ApiError::InvalidField(format!(
                "zone {} source_id {} out of range 0..{}",
                self.id, self.source_id, NUM_SOURCES
            )));
        }
        if !(MIN_VOL..=MAX_VOL).contains(&self.vol) {
            return Err(ApiError::InvalidField(format!(
                "zone {} vol {} out of range {}..={}",
                self.id, self.vol, MIN_VOL, MAX_VOL
            )));
        }
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Groups
// ─────────────────────────────────────────────────────────────────────────────

/// A named set of zones controlled together.
///
/// `source_id`, `mute`, and `vol_delta` are derived from the member zones at
/// read time and never stored: `source_id`/`mute` only when every member
/// agrees, `vol_delta` as the average member attenuation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Group {
    pub id: u64,
    pub name: String,
    pub zones: Vec<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_id: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mute: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub vol_delta: Option<i8>,
}

/// Payload for creating a new [`Group`]; the id is assigned by the controller.
#[derive(Debug, Clone, Deserialize)]
pub struct NewGroup {
    pub name: String,
    pub zones: Vec<usize>,
}

/// Sparse update for a [`Group`].
///
/// `name`/`zones` edit the group itself. `source_id`, `mute`, and `vol_delta`
/// are fan-out commands: the controller applies them to every member zone as
/// a single transaction.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GroupUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub zones: Option<Vec<usize>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_id: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mute: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vol_delta: Option<i8>,
}

impl Group {
    /// Fills the derived aggregate fields from the current member zones.
    pub fn derive(&mut self, zones: &[Zone]) {
        let members: Vec<&Zone> = self
            .zones
            .iter()
            .filter_map(|&zid| zones.get(zid))
            .collect();
        if members.is_empty() {
            self.source_id = None;
            self.mute = None;
            self.vol_delta = None;
            return;
        }
        let first = members[0];
        self.source_id = members
            .iter()
            .all(|z| z.source_id == first.source_id)
            .then_some(first.source_id);
        self.mute = members.iter().all(|z| z.mute == first.mute).then_some(first.mute);
        let sum: i32 = members.iter().map(|z| z.vol as i32).sum();
        self.vol_delta = Some(clamp_vol(sum / members.len() as i32));
    }

    /// Normalizes the member set: deduplicated, ascending order.
    pub fn normalize_zones(zones: &[usize]) -> Vec<usize> {
        let mut out: Vec<usize> = zones.to_vec();
        out.sort_unstable();
        out.dedup();
        out
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Streams
// ─────────────────────────────────────────────────────────────────────────────

/// Kind tag selecting a stream driver implementation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StreamKind {
    Pandora,
    Airplay,
    Dlna,
    InternetRadio,
    Shairport,
    Spotify,
}

impl StreamKind {
    /// Short lowercase tag, matching the serialized form.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pandora => "pandora",
            Self::Airplay => "airplay",
            Self::Dlna => "dlna",
            Self::InternetRadio => "internetradio",
            Self::Shairport => "shairport",
            Self::Spotify => "spotify",
        }
    }
}

/// An external audio producer addressable by id.
///
/// Only the fields relevant to the kind are populated: Pandora uses
/// `user`/`password`/`station`, internet radio and DLNA use `url`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stream {
    pub id: u64,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: StreamKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub station: Option<String>,
}

/// Payload for creating a new [`Stream`]; the id is assigned by the controller.
#[derive(Debug, Clone, Deserialize)]
pub struct NewStream {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: StreamKind,
    #[serde(default)]
    pub user: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub station: Option<String>,
}

/// Sparse update for a [`Stream`]. The kind is fixed at creation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StreamUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub station: Option<String>,
}

impl Stream {
    /// Merges `update` over this stream and validates the result.
    pub fn apply(&self, update: &StreamUpdate) -> ApiResult<Stream> {
        let merged = Stream {
            id: self.id,
            name: update.name.clone().unwrap_or_else(|| self.name.clone()),
            kind: self.kind,
            user: update.user.clone().or_else(|| self.user.clone()),
            password: update.password.clone().or_else(|| self.password.clone()),
            url: update.url.clone().or_else(|| self.url.clone()),
            station: update.station.clone().or_else(|| self.station.clone()),
        };
        merged.validate()?;
        Ok(merged)
    }

    /// Required fields per kind: Pandora needs credentials, URL kinds a URL.
    pub fn validate(&self) -> ApiResult<()> {
        if self.name.is_empty() {
            return Err(ApiError::InvalidField("stream name must not be empty".into()));
        }
        let missing = |field: &str| {
            ApiError::InvalidField(format!(
                "{} streams require a non-empty {}",
                self.kind.as_str(),
                field
            ))
        };
        match self.kind {
            StreamKind::Pandora => {
                if self.user.as_deref().unwrap_or("").is_empty() {
                    return Err(missing("user"));
                }
                if self.password.as_deref().unwrap_or("").is_empty() {
                    return Err(missing("password"));
                }
            }
            StreamKind::InternetRadio | StreamKind::Dlna => {
                if self.url.as_deref().unwrap_or("").is_empty() {
                    return Err(missing("url"));
                }
            }
            StreamKind::Airplay | StreamKind::Shairport | StreamKind::Spotify => {}
        }
        Ok(())
    }

    /// True when `other` differs in a field the running driver depends on,
    /// requiring a disconnect/reconnect cycle if the stream is bound.
    pub fn reconnect_needed(&self, other: &Stream) -> bool {
        self.user != other.user
            || self.password != other.password
            || self.url != other.url
            || self.station != other.station
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Presets
// ─────────────────────────────────────────────────────────────────────────────

/// A named partial configuration applied atomically by the controller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Preset {
    pub id: u64,
    pub name: String,
    pub state: PresetState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_used: Option<u64>,
}

/// Payload for creating a new [`Preset`]; the id is assigned by the controller.
#[derive(Debug, Clone, Deserialize)]
pub struct NewPreset {
    pub name: String,
    pub state: PresetState,
}

/// Sparse update for a [`Preset`].
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PresetUpdate {
    pub name: Option<String>,
    pub state: Option<PresetState>,
}

/// Sparse version of the configuration entities carried by a preset.
///
/// Sections are applied in the order streams, sources, zones, groups:
/// streams must exist before sources bind to them, sources must be routed
/// before zones refer to them, and groups derive from zones.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PresetState {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub streams: Option<Vec<StreamPatch>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sources: Option<Vec<SourcePatch>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub zones: Option<Vec<ZonePatch>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub groups: Option<Vec<GroupPatch>>,
}

/// An id-addressed [`StreamUpdate`] inside a preset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamPatch {
    pub id: u64,
    #[serde(flatten)]
    pub update: StreamUpdate,
}

/// An id-addressed [`SourceUpdate`] inside a preset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourcePatch {
    pub id: usize,
    #[serde(flatten)]
    pub update: SourceUpdate,
}

/// An id-addressed [`ZoneUpdate`] inside a preset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ZonePatch {
    pub id: usize,
    #[serde(flatten)]
    pub update: ZoneUpdate,
}

/// An id-addressed [`GroupUpdate`] inside a preset.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupPatch {
    pub id: u64,
    #[serde(flatten)]
    pub update: GroupUpdate,
}

impl PresetState {
    /// Structural validation of every present field, without resolving
    /// references (those are checked against live state at load time).
    pub fn validate(&self) -> ApiResult<()> {
        for patch in self.sources.iter().flatten() {
            if patch.id >= NUM_SOURCES {
                return Err(ApiError::InvalidField(format!(
                    "preset references source {} out of range 0..{}",
                    patch.id, NUM_SOURCES
                )));
            }
        }
        for patch in self.zones.iter().flatten() {
            if let Some(sid) = patch.update.source_id {
                if sid >= NUM_SOURCES {
                    return Err(ApiError::InvalidField(format!(
                        "preset zone {} source_id {} out of range 0..{}",
                        patch.id, sid, NUM_SOURCES
                    )));
                }
            }
            if let Some(vol) = patch.update.vol {
                if !(MIN_VOL..=MAX_VOL).contains(&vol) {
                    return Err(ApiError::InvalidField(format!(
                        "preset zone {} vol {} out of range {}..={}",
                        patch.id, vol, MIN_VOL, MAX_VOL
                    )));
                }
            }
        }
        for patch in self.groups.iter().flatten() {
            if let Some(sid) = patch.update.source_id {
                if sid >= NUM_SOURCES {
                    return Err(ApiError::InvalidField(format!(
                        "preset group {} source_id {} out of range 0..{}",
                        patch.id, sid, NUM_SOURCES
                    )));
                }
            }
        }
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Status document
// ─────────────────────────────────────────────────────────────────────────────

/// Static build and boot metadata reported with every status response.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Info {
    #[serde(default)]
    pub version: String,
    #[serde(default)]
    pub config_file: String,
    #[serde(default)]
    pub mock_ctrl: bool,
    #[serde(default)]
    pub mock_streams: bool,
}

/// The single authoritative state document.
///
/// Unknown top-level fields found in a persisted snapshot are preserved in
/// `extra` and written back verbatim on save.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Status {
    #[serde(default)]
    pub sources: Vec<Source>,
    #[serde(default)]
    pub zones: Vec<Zone>,
    #[serde(default)]
    pub groups: Vec<Group>,
    #[serde(default)]
    pub streams: Vec<Stream>,
    #[serde(default)]
    pub presets: Vec<Preset>,
    #[serde(default)]
    pub info: Info,
    /// Non-fatal warning (e.g. a failed save) attached to responses only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Status {
    /// Builds the factory default document for the detected unit count:
    /// four local sources, six default zones per unit, and a handful of
    /// example groups, streams, and presets to make the API discoverable.
    pub fn factory_default(units: usize, info: Info) -> Status {
        let units = units.clamp(1, MAX_UNITS);
        let sources = (0..NUM_SOURCES)
            .map(|id| Source {
                id,
                name: format!("Source {}", id + 1),
                input: INPUT_LOCAL.to_string(),
            })
            .collect();
        let zones: Vec<Zone> = (0..units * ZONES_PER_UNIT)
            .map(|id| Zone {
                id,
                name: format!("Zone {}", id + 1),
                source_id: 0,
                mute: false,
                stby: false,
                vol: 0,
                disabled: false,
            })
            .collect();
        let groups = vec![
            Group {
                id: 0,
                name: "Downstairs".to_string(),
                zones: vec![0, 1, 2],
                source_id: None,
                mute: None,
                vol_delta: None,
            },
            Group {
                id: 1,
                name: "Upstairs".to_string(),
                zones: vec![3, 4, 5],
                source_id: None,
                mute: None,
                vol_delta: None,
            },
            Group {
                id: 2,
                name: "Whole House".to_string(),
                zones: (0..zones.len()).collect(),
                source_id: None,
                mute: None,
                vol_delta: None,
            },
        ];
        let streams = vec![
            Stream {
                id: FIRST_STREAM_ID,
                name: "Groove Salad".to_string(),
                kind: StreamKind::InternetRadio,
                user: None,
                password: None,
                url: Some("http://ice2.somafm.com/groovesalad-128-mp3".to_string()),
                station: None,
            },
            Stream {
                id: FIRST_STREAM_ID + 1,
                name: "House AirPlay".to_string(),
                kind: StreamKind::Airplay,
                user: None,
                password: None,
                url: None,
                station: None,
            },
        ];
        let presets = vec![
            Preset {
                id: FIRST_PRESET_ID,
                name: "Mute All".to_string(),
                state: PresetState {
                    zones: Some(
                        (0..zones.len())
                            .map(|id| ZonePatch {
                                id,
                                update: ZoneUpdate {
                                    mute: Some(true),
                                    ..Default::default()
                                },
                            })
                            .collect(),
                    ),
                    ..Default::default()
                },
                last_used: None,
            },
            Preset {
                id: FIRST_PRESET_ID + 1,
                name: "Radio Everywhere".to_string(),
                state: PresetState {
                    sources: Some(vec![SourcePatch {
                        id: 0,
                        update: SourceUpdate {
                            input: Some(format!("stream={}", FIRST_STREAM_ID)),
                            ..Default::default()
                        },
                    }]),
                    zones: Some(
                        (0..zones.len())
                            .map(|id| ZonePatch {
                                id,
                                update: ZoneUpdate {
                                    source_id: Some(0),
                                    mute: Some(false),
                                    ..Default::default()
                                },
                            })
                            .collect(),
                    ),
                    ..Default::default()
                },
                last_used: None,
            },
            Preset {
                id: FIRST_PRESET_ID + 2,
                name: "Quiet Evening".to_string(),
                state: PresetState {
                    zones: Some(
                        (0..zones.len())
                            .map(|id| ZonePatch {
                                id,
                                update: ZoneUpdate {
                                    vol: Some(-40),
                                    ..Default::default()
                                },
                            })
                            .collect(),
                    ),
                    ..Default::default()
                },
                last_used: None,
            },
        ];
        Status {
            sources,
            zones,
            groups,
            streams,
            presets,
            info,
            warning: None,
            extra: serde_json::Map::new(),
        }
    }

    pub fn find_group(&self, gid: u64) -> Option<&Group> {
        self.groups.iter().find(|g| g.id == gid)
    }

    pub fn find_group_mut(&mut self, gid: u64) -> Option<&mut Group> {
        self.groups.iter_mut().find(|g| g.id == gid)
    }

    pub fn find_stream(&self, sid: u64) -> Option<&Stream> {
        self.streams.iter().find(|s| s.id == sid)
    }

    pub fn find_stream_mut(&mut self, sid: u64) -> Option<&mut Stream> {
        self.streams.iter_mut().find(|s| s.id == sid)
    }

    pub fn find_preset(&self, pid: u64) -> Option<&Preset> {
        self.presets.iter().find(|p| p.id == pid)
    }

    pub fn find_preset_mut(&mut self, pid: u64) -> Option<&mut Preset> {
        self.presets.iter_mut().find(|p| p.id == pid)
    }

    /// Returns the source currently bound to `stream_id`, if any.
    pub fn source_bound_to(&self, stream_id: u64) -> Option<&Source> {
        self.sources.iter().find(|s| s.stream_id() == Some(stream_id))
    }

    /// Recomputes every group's derived aggregate fields.
    pub fn derive_groups(&mut self) {
        let zones = self.zones.clone();
        for group in &mut self.groups {
            group.derive(&zones);
        }
    }

    /// Re-checks the cross-entity invariants on this document.
    ///
    /// Run on every candidate post-state before the controller commits;
    /// a violation here means the mutation is rejected wholesale.
    pub fn check_invariants(&self) -> ApiResult<()> {
        if self.sources.len() != NUM_SOURCES {
            return Err(ApiError::InvariantViolation(format!(
                "expected {} sources, found {}",
                NUM_SOURCES,
                self.sources.len()
            )));
        }
        // Sources and zones are indexed by id; the document must keep them
        // dense and in order.
        for (i, source) in self.sources.iter().enumerate() {
            if source.id != i {
                return Err(ApiError::InvariantViolation(format!(
                    "source id {} at position {}",
                    source.id, i
                )));
            }
            source.validate()?;
            if let Some(stream_id) = source.stream_id() {
                if self.find_stream(stream_id).is_none() {
                    return Err(ApiError::InvariantViolation(format!(
                        "source {} references missing stream {}",
                        source.id, stream_id
                    )));
                }
            }
        }
        for (i, zone) in self.zones.iter().enumerate() {
            if zone.id != i {
                return Err(ApiError::InvariantViolation(format!(
                    "zone id {} at position {}",
                    zone.id, i
                )));
            }
            zone.validate()?;
        }
        for group in &self.groups {
            let mut seen = HashSet::new();
            for &zid in &group.zones {
                let zone = self.zones.get(zid).ok_or_else(|| {
                    ApiError::InvariantViolation(format!(
                        "group {} references missing zone {}",
                        group.id, zid
                    ))
                })?;
                if zone.disabled {
                    return Err(ApiError::InvariantViolation(format!(
                        "group {} references disabled zone {}",
                        group.id, zid
                    )));
                }
                if !seen.insert(zid) {
                    return Err(ApiError::InvariantViolation(format!(
                        "group {} lists zone {} twice",
                        group.id, zid
                    )));
                }
            }
        }
        // A stream feeds at most one source.
        let mut bound = HashSet::new();
        for source in &self.sources {
            if let Some(stream_id) = source.stream_id() {
                if !bound.insert(stream_id) {
                    return Err(ApiError::InvariantViolation(format!(
                        "stream {} is bound to more than one source",
                        stream_id
                    )));
                }
            }
        }
        unique_ids(self.groups.iter().map(|g| g.id), "group")?;
        unique_ids(self.streams.iter().map(|s| s.id), "stream")?;
        unique_ids(self.presets.iter().map(|p| p.id), "preset")?;
        Ok(())
    }

    /// Captures the full current configuration as a sparse preset state.
    ///
    /// Used to populate the reserved last-config preset before a preset
    /// load, so the load can be reverted exactly.
    pub fn capture(&self) -> PresetState {
        PresetState {
            streams: Some(
                self.streams
                    .iter()
                    .map(|s| StreamPatch {
                        id: s.id,
                        update: StreamUpdate {
                            name: Some(s.name.clone()),
                            user: s.user.clone(),
                            password: s.password.clone(),
                            url: s.url.clone(),
                            station: s.station.clone(),
                        },
                    })
                    .collect(),
            ),
            sources: Some(
                self.sources
                    .iter()
                    .map(|s| SourcePatch {
                        id: s.id,
                        update: SourceUpdate {
                            name: Some(s.name.clone()),
                            input: Some(s.input.clone()),
                        },
                    })
                    .collect(),
            ),
            zones: Some(
                self.zones
                    .iter()
                    .map(|z| ZonePatch {
                        id: z.id,
                        update: ZoneUpdate {
                            name: Some(z.name.clone()),
                            source_id: Some(z.source_id),
                            mute: Some(z.mute),
                            stby: Some(z.stby),
                            vol: Some(z.vol),
                            disabled: Some(z.disabled),
                        },
                    })
                    .collect(),
            ),
            groups: Some(
                self.groups
                    .iter()
                    .map(|g| GroupPatch {
                        id: g.id,
                        update: GroupUpdate {
                            name: Some(g.name.clone()),
                            zones: Some(g.zones.clone()),
                            ..Default::default()
                        },
                    })
                    .collect(),
            ),
        }
    }
}

fn unique_ids(ids: impl Iterator<Item = u64>, kind: &str) -> ApiResult<()> {
    let mut seen = HashSet::new();
    for id in ids {
        if !seen.insert(id) {
            return Err(ApiError::InvariantViolation(format!(
                "duplicate {} id {}",
                kind, id
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn default_status() -> Status {
        Status::factory_default(1, Info::default())
    }

    #[test]
    fn factory_default_satisfies_invariants() {
        let status = default_status();
        assert_eq!(status.sources.len(), 4);
        assert_eq!(status.zones.len(), 6);
        assert_eq!(status.groups.len(), 3);
        assert_eq!(status.streams.len(), 2);
        assert_eq!(status.presets.len(), 3);
        status.check_invariants().unwrap();
    }

    #[test]
    fn factory_default_sources_are_local() {
        let status = default_status();
        for (i, source) in status.sources.iter().enumerate() {
            assert_eq!(source.name, format!("Source {}", i + 1));
            assert_eq!(source.input, "local");
            assert!(!source.is_digital());
        }
    }

    #[test]
    fn zone_apply_merges_sparse_fields() {
        let zone = default_status().zones[0].clone();
        let update = ZoneUpdate {
            source_id: Some(2),
            ..Default::default()
        };
        let merged = zone.apply(&update).unwrap();
        assert_eq!(merged.source_id, 2);
        assert_eq!(merged.name, zone.name);
        assert_eq!(merged.vol, zone.vol);
    }

    #[test]
    fn zone_apply_rejects_out_of_range_source() {
        let zone = default_status().zones[0].clone();
        let update = ZoneUpdate {
            source_id: Some(4),
            ..Default::default()
        };
        assert!(matches!(
            zone.apply(&update),
            Err(ApiError::InvalidField(_))
        ));
    }

    #[test]
    fn zone_apply_rejects_out_of_range_vol() {
        let zone = default_status().zones[0].clone();
        for vol in [-80, 1] {
            let update = ZoneUpdate {
                vol: Some(vol),
                ..Default::default()
            };
            assert!(zone.apply(&update).is_err(), "vol {} should fail", vol);
        }
        for vol in [-79, 0] {
            let update = ZoneUpdate {
                vol: Some(vol),
                ..Default::default()
            };
            assert!(zone.apply(&update).is_ok(), "vol {} should pass", vol);
        }
    }

    #[test]
    fn source_input_parses_stream_binding() {
        let source = Source {
            id: 0,
            name: "TV".into(),
            input: "stream=1000".into(),
        };
        assert_eq!(source.stream_id(), Some(1000));
        assert!(source.is_digital());
        source.validate().unwrap();

        let bad = Source {
            id: 0,
            name: "TV".into(),
            input: "stream=abc".into(),
        };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn pandora_stream_requires_credentials() {
        let stream = Stream {
            id: 1000,
            name: "My Pandora".into(),
            kind: StreamKind::Pandora,
            user: Some("user@example.com".into()),
            password: None,
            url: None,
            station: None,
        };
        assert!(stream.validate().is_err());
    }

    #[test]
    fn stream_reconnect_needed_ignores_name() {
        let stream = default_status().streams[0].clone();
        let renamed = stream
            .apply(&StreamUpdate {
                name: Some("Renamed".into()),
                ..Default::default()
            })
            .unwrap();
        assert!(!stream.reconnect_needed(&renamed));

        let moved = stream
            .apply(&StreamUpdate {
                url: Some("http://ice2.somafm.com/dronezone-128-mp3".into()),
                ..Default::default()
            })
            .unwrap();
        assert!(stream.reconnect_needed(&moved));
    }

    #[test]
    fn group_derivation_requires_agreement() {
        let mut status = default_status();
        status.zones[0].mute = true;
        status.zones[1].mute = true;
        status.zones[2].mute = false;
        status.zones[0].source_id = 1;
        status.zones[1].source_id = 1;
        status.zones[2].source_id = 1;
        status.derive_groups();
        let group = status.find_group(0).unwrap();
        assert_eq!(group.mute, None);
        assert_eq!(group.source_id, Some(1));
    }

    #[test]
    fn group_vol_delta_is_average() {
        let mut status = default_status();
        status.zones[0].vol = -10;
        status.zones[1].vol = -20;
        status.zones[2].vol = -30;
        status.derive_groups();
        assert_eq!(status.find_group(0).unwrap().vol_delta, Some(-20));
    }

    #[test]
    fn invariants_reject_dangling_stream_binding() {
        let mut status = default_status();
        status.sources[0].input = "stream=4242".into();
        assert!(matches!(
            status.check_invariants(),
            Err(ApiError::InvariantViolation(_))
        ));
    }

    #[test]
    fn invariants_reject_double_bound_stream() {
        let mut status = default_status();
        status.sources[0].input = "stream=1000".into();
        status.sources[1].input = "stream=1000".into();
        assert!(status.check_invariants().is_err());
    }

    #[test]
    fn invariants_reject_group_with_disabled_member() {
        let mut status = default_status();
        status.zones[2].disabled = true;
        assert!(status.check_invariants().is_err());
    }

    #[test]
    fn serialization_elides_defaults() {
        let status = default_status();
        let json = serde_json::to_value(&status).unwrap();
        let zone = &json["zones"][0];
        assert!(zone.get("mute").is_none());
        assert!(zone.get("vol").is_none());
        assert!(zone.get("source_id").is_none());
        let source = &json["sources"][0];
        assert!(source.get("input").is_none());
    }

    #[test]
    fn serialization_round_trips() {
        let mut status = default_status();
        status.zones[3].vol = -25;
        status.zones[3].mute = true;
        status.sources[1].input = "stream=1000".into();
        let json = serde_json::to_string(&status).unwrap();
        let back: Status = serde_json::from_str(&json).unwrap();
        assert_eq!(status, back);
    }

    #[test]
    fn serialization_is_deterministic() {
        let status = default_status();
        let a = serde_json::to_string(&status).unwrap();
        let b = serde_json::to_string(&serde_json::from_str::<Status>(&a).unwrap()).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn unknown_fields_round_trip() {
        let json = r#"{"sources":[],"zones":[],"future_field":{"a":1}}"#;
        let status: Status = serde_json::from_str(json).unwrap();
        assert!(status.extra.contains_key("future_field"));
        let out = serde_json::to_string(&status).unwrap();
        assert!(out.contains("future_field"));
    }

    #[test]
    fn capture_round_trips_zone_state() {
        let mut status = default_status();
        status.zones[1].vol = -33;
        status.zones[1].source_id = 3;
        let captured = status.capture();
        let patch = &captured.zones.as_ref().unwrap()[1];
        assert_eq!(patch.update.vol, Some(-33));
        assert_eq!(patch.update.source_id, Some(3));
    }

    #[test]
    fn clamp_vol_saturates_at_bounds() {
        assert_eq!(clamp_vol(-100), MIN_VOL);
        assert_eq!(clamp_vol(5), MAX_VOL);
        assert_eq!(clamp_vol(-79), -79);
        assert_eq!(clamp_vol(0), 0);
        assert_eq!(clamp_vol(-80), -79);
        assert_eq!(clamp_vol(1), 0);
    }

    #[test]
    fn preset_state_validates_ranges() {
        let state = PresetState {
            zones: Some(vec![ZonePatch {
                id: 0,
                update: ZoneUpdate {
                    vol: Some(-90),
                    ..Default::default()
                },
            }]),
            ..Default::default()
        };
        assert!(state.validate().is_err());
    }
}
