use thiserror::Error;

/// Error taxonomy for the operator.
///
/// Transient errors (API reads, runtime disconnects) fail the reconcile so
/// the driver retries with backoff. Invariant errors (bad regex, unknown
/// runtime scheme) are logged and the item is skipped. Fatal errors (probe
/// load, closed ring buffer) stop their component. A missing inode is
/// resolved silently by the caller.
#[derive(Debug, Error)]
pub enum Error {
    #[error("kubernetes api error: {0}")]
    Kube(#[from] kube::Error),

    #[error("probe object error: {0}")]
    Ebpf(#[from] aya::EbpfError),

    #[error("probe program error: {0}")]
    Program(#[from] aya::programs::ProgramError),

    #[error("traced-inode map error: {0}")]
    Map(#[from] aya::maps::MapError),

    #[error("traced-inode map is full")]
    MapFull,

    #[error("probe is not loaded")]
    ProbeNotLoaded,

    #[error("ring buffer closed")]
    BufferClosed,

    #[error("malformed probe record ({0} bytes)")]
    Decode(usize),

    #[error("target not found")]
    NotFound,

    #[error("permission denied")]
    Permission,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("unsupported container runtime {0:?}")]
    UnsupportedRuntime(String),

    #[error("malformed container id {0:?}")]
    MalformedContainerId(String),

    #[error("container runtime error: {0}")]
    Runtime(String),

    #[error("invalid container name pattern {pattern:?}: {source}")]
    Regex {
        pattern: String,
        source: regex::Error,
    },

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
