//! Closed error taxonomy for the controller and its surface boundary.

use thiserror::Error;

/// Errors the tick actor and HTTP surface can produce. Every variant maps to
/// a specific recovery documented alongside it; none of them panics the
/// process on its own.
#[derive(Debug, Error)]
pub enum ControllerError {
    /// A single vehicle or edge query failed. Logged at `warn` and skipped;
    /// never aborts the tick.
    #[error("transient simulator read failure: {0}")]
    TransientSimulatorRead(String),

    /// The simulator connection is gone. Fatal: the tick loop stops and the
    /// adapter is released.
    #[error("simulator connection lost")]
    AdapterLost,

    /// An HTTP request named an unknown command or an out-of-range duration.
    /// Rejected at the surface with `400`; the controller never sees it.
    #[error("invalid command: {0}")]
    InvalidCommand(String),

    /// The memory journal could not be read or written.
    #[error("memory store I/O failure: {0}")]
    MemoryIo(#[from] std::io::Error),

    /// The simulator's traffic-light program had no phase matching either
    /// movement group.
    #[error("could not infer NS/EW phase indices from the simulator's program")]
    PhaseInference,

    /// Startup-time configuration was invalid.
    #[error("invalid configuration field `{field}`: {reason}")]
    InvalidConfig { field: String, reason: String },
}
