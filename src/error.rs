use thiserror::Error;

/// Errors surfaced by the logging and recovery engines.
///
/// Transient resource errors (`BufferExhausted`) are expected to resolve via
/// backpressure. Protocol-level problems (`UnknownEventType`, the decode
/// variants) indicate a misbehaving peer and are fatal for the operation that
/// observed them.
#[derive(Error, Debug)]
pub enum CausalError {
    /// The buffer pool cannot supply a free segment.
    #[error("buffer pool exhausted")]
    BufferExhausted,

    /// An operation addressed an epoch that reclamation already removed.
    #[error("epoch {requested} was already reclaimed; earliest retained is {earliest}")]
    EpochReclaimed { requested: u64, earliest: u64 },

    /// A log guard was poisoned by a panicking thread. Checkpoint-completion
    /// fan-out logs this per child and keeps going.
    #[error("log state poisoned by a panicked thread")]
    LogPoisoned,

    /// The in-flight listener received something other than a prepare or
    /// request event.
    #[error("unknown event type: {0}")]
    UnknownEventType(&'static str),

    /// A wire frame ended before the expected field.
    #[error("truncated wire data at offset {0}")]
    Truncated(usize),

    /// A wire frame contained a value no encoder produces.
    #[error("invalid wire data: {0}")]
    InvalidWire(&'static str),

    /// The determinant byte stream does not decode to a known variant.
    #[error("malformed determinant stream at offset {0}")]
    DeterminantDecode(usize),
}

impl From<CausalError> for std::io::Error {
    fn from(e: CausalError) -> std::io::Error {
        std::io::Error::new(std::io::ErrorKind::InvalidData, e)
    }
}

/// Why an in-flight replay attempt was abandoned. Both cases return the
/// writer to normal emission; the downstream side retries.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ReplayAbort {
    #[error("no matching replay request arrived in time")]
    Timeout,

    #[error("replay request (sub {got_sub}, checkpoint {got_checkpoint}) does not match prepare (sub {want_sub}, checkpoint {want_checkpoint})")]
    Mismatch {
        want_sub: u32,
        want_checkpoint: u64,
        got_sub: u32,
        got_checkpoint: u64,
    },
}
