//! xqbridge: process and protocol bridge for UCI-style Xiangqi engines.
//!
//! [`EngineBridge`] launches an engine (a bundled executable or one linked
//! into the application), performs the handshake, serializes commands into
//! it and turns its output into typed replies and [`EngineEvent`]s.

pub mod bridge;
mod config;
mod error;
mod events;
mod locator;
mod logging;
mod pending;
mod process;
mod pump;
mod request;
mod service;
mod session;
mod version;

#[cfg(test)]
mod testing;

pub use bridge::protocol::{
    Command, CommandClass, CommandId, InfoEvent, OptionDecl, Params, ResponseEvent, Score,
    ScoreBound, ScoreKind, Verb, Wdl,
};
pub use config::BridgeConfig;
pub use error::{BridgeError, Result};
pub use events::{EngineEvent, EventSink, Subscription};
pub use locator::{
    ArtifactLocation, EngineArtifact, EngineLocator, FixedPathLocator, LinkedEngine,
    LinkedLocator, NativeDirLocator, PlatformId,
};
pub use logging::init_tracing;
pub use process::InProcessEngine;
pub use request::{PendingReply, Reply};
pub use service::EngineBridge;
pub use session::{SessionInfo, SessionState, StopOutcome};
pub use version::{BRIDGE_VERSION, EngineIdentity};
