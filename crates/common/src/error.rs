use thiserror::Error;

/// Canonical dispatch error taxonomy used across crates.
///
/// Classification guidance:
/// - [`GqdError::Unsupported`]: operation kind or feature the dispatcher does not serve
/// - [`GqdError::Planning`]: payload could not be decoded or rewritten into a traversal
/// - [`GqdError::Metadata`]: schema source unreachable or returned an unusable schema
/// - [`GqdError::Compile`]: traversal cannot be lowered to a physical plan
/// - [`GqdError::MalformedPlan`]: plan bytes do not match the job request wire shape
/// - [`GqdError::Submission`]: cluster channel rejected or could not accept a job
/// - [`GqdError::Stream`]: cluster reported a failure while results were streaming
/// - [`GqdError::Protocol`]: result sink or frame routing contract violated
#[derive(Debug, Error)]
pub enum GqdError {
    /// Invalid or inconsistent configuration.
    ///
    /// Examples:
    /// - empty cluster host list
    /// - zero worker count or batch size
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Front-end decode or strategy failures.
    ///
    /// Examples:
    /// - bytecode payload is not valid JSON
    /// - script text is not a call chain
    #[error("planning error: {0}")]
    Planning(String),

    /// Valid request for an operation kind or shape this dispatcher does not serve.
    #[error("unsupported: {0}")]
    Unsupported(String),

    /// Schema refresh failures. Dispatch aborts before compilation.
    #[error("metadata error: {0}")]
    Metadata(String),

    /// Plan compilation failures carrying compiler-provided detail.
    #[error("compile error: {0}")]
    Compile(String),

    /// Physical plan bytes do not parse into the job request wire shape.
    ///
    /// Indicates a compiler/protocol version mismatch. Never retried:
    /// compilation is deterministic.
    #[error("malformed plan: {0}")]
    MalformedPlan(String),

    /// Synchronous job submission failures (channel unavailable, broadcaster closed).
    #[error("submission error: {0}")]
    Submission(String),

    /// Mid-execution failures reported by the cluster on the result stream.
    #[error("stream error: {0}")]
    Stream(String),

    /// Result delivery contract violations, e.g. a write after the terminal response.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// Session already has a job in flight under the single-flight policy.
    #[error("session busy: {0}")]
    SessionBusy(String),

    /// Runtime failures outside the cluster, e.g. a session channel that went away.
    #[error("execution error: {0}")]
    Execution(String),

    /// Transparent std IO failures.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Standard dispatch result alias.
pub type Result<T> = std::result::Result<T, GqdError>;
