//! ZoneAmp Core - control plane for a multi-zone home audio amplifier.
//!
//! This crate provides the state model and command engine behind the
//! ZoneAmp REST API: four routable sources, up to thirty-six amplified
//! zones, user-defined groups, external audio streams, and saved presets,
//! all kept consistent across the in-memory document, the preamp hardware,
//! and the persisted configuration snapshot.
//!
//! # Architecture
//!
//! - [`model`]: Typed entities, sparse updates, validation, serialization
//! - [`store`]: Ownership and crash-safe persistence of the status document
//! - [`runtime`]: Hardware abstraction for the preamp board (mock and i2c)
//! - [`stream`]: Stream driver lifecycle and command dispatch
//! - [`ctrl`]: The command engine tying it all together
//! - [`api`]: Thin Axum handlers over the controller
//! - [`error`]: Centralized error types
//!
//! The controller is polymorphic over [`Runtime`](runtime::Runtime) and
//! [`DriverFactory`](stream::DriverFactory), so the whole system runs
//! against in-process mocks when `mock_ctrl`/`mock_streams` are set.

#![warn(clippy::all)]

pub mod api;
pub mod ctrl;
pub mod error;
pub mod model;
pub mod runtime;
pub mod settings;
pub mod store;
pub mod stream;

// Re-export commonly used types at the crate root
pub use api::{start_server, AppState, ServerError};
pub use ctrl::Controller;
pub use error::{ApiError, ApiResult};
pub use model::{
    Group, GroupUpdate, Info, NewGroup, NewPreset, NewStream, Preset, PresetState, PresetUpdate,
    Source, SourceUpdate, Status, Stream, StreamKind, StreamUpdate, Zone, ZoneUpdate,
};
pub use runtime::{MockRuntime, PreampRuntime, Runtime};
pub use settings::AppSettings;
pub use store::Store;
pub use stream::{
    DriverFactory, DriverStatus, LoopbackFactory, PlayerFactory, StreamCommand, StreamDriver,
    StreamInfo, StreamRegistry,
};
