// src/error.rs

use thiserror::Error;

use crate::channel::ChannelId;

/// Errors surfaced by the engine's public API.
///
/// These are contract violations and control-flow failures. Buffer-length
/// mismatches are not represented here; those panic.
#[derive(Debug, Error)]
pub enum EngineError {
    /// A loop task was registered twice.
    #[error("loop task is already registered")]
    DuplicateLoopTask,

    /// A loop task was removed without being registered.
    #[error("loop task is not registered")]
    UnknownLoopTask,

    /// A parameter was bound to a second owning component.
    #[error("parameter '{0}' is already bound to a component")]
    ParameterRebound(String),

    /// A channel operation referenced a channel this engine does not own.
    #[error("channel {0:?} is not owned by this engine")]
    UnknownChannel(ChannelId),

    /// A channel was moved to an index outside the channel list.
    #[error("channel index {index} out of range (len {len})")]
    IndexOutOfRange { index: usize, len: usize },

    /// `start()`/`stop()` used while the host drives the frame loop.
    #[error("engine is host-driven; start/stop is unavailable")]
    HostDriven,

    /// The engine thread could not be spawned.
    #[error("failed to spawn engine thread")]
    ThreadSpawn,

    /// The engine thread could not be joined during a mode transition.
    /// Engine state after this failure is undefined.
    #[error("engine thread failed to join")]
    ThreadJoin,

    /// `ungroup` on a channel that is not in a group.
    #[error("channel {0:?} is not a member of any group")]
    NotGrouped(ChannelId),

    /// Structural operation targeted a group where a leaf channel was
    /// required, or vice versa.
    #[error("channel {0:?} has the wrong kind for this operation")]
    WrongChannelKind(ChannelId),
}
