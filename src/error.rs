use thiserror::Error;

#[derive(Debug, Error)]
pub enum FunnelError {
    /// The execution environment cannot support this role (no devices,
    /// external library failed to come up). Not recoverable: callers are
    /// expected to terminate the job.
    #[error("environment fault: {0}")]
    Environment(String),

    /// Communicator hierarchy construction failed or produced an
    /// inconsistent process/device layout.
    #[error("topology fault: {0}")]
    Topology(String),

    /// A precondition of the call sequence was violated (solve before
    /// set_operator, structural mismatch in update_operator, ...).
    #[error("usage fault: {0}")]
    Usage(String),

    /// Unknown solver mode string.
    #[error("invalid mode '{0}': expected one of dDDI, dDFI, dFFI, hDDI, hDFI, hFFI")]
    Mode(String),

    /// The configuration resource could not be read or parsed.
    #[error("configuration error: {0}")]
    Config(String),

    /// A collective or point-to-point transport operation failed. The
    /// gather-solve-scatter protocol has no partial-failure recovery, so
    /// this is fatal to the whole group.
    #[error("communication fault: {0}")]
    Comm(String),

    /// The external solver engine reported a failure. Non-convergence is
    /// not reported this way; it is visible through the diagnostics
    /// accessors only.
    #[error("solver engine fault: {0}")]
    Engine(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, FunnelError>;
