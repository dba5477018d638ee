/// Core types and structures for the minibox keeper
use crate::utils::env_rules::EnvRule;
use std::ffi::OsString;
use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Open-descriptor cap applied to every sandboxed program.
/// Not user-configurable: callers have never needed to raise it.
pub const DEFAULT_FD_LIMIT: u64 = 64;

/// Process cap used when `--processes` is not given at all.
pub const DEFAULT_PROCESS_LIMIT: u32 = 1;

/// Period of the keeper's timeout poll.
pub const TICK_INTERVAL_SECS: u32 = 1;

/// Longest diagnostic the child may push through the startup pipe.
/// Kept below PIPE_BUF so a single write never blocks or splits.
pub const STARTUP_MESSAGE_MAX: usize = 1023;

/// Resource limits enforced on the sandboxed program
#[derive(Clone, Debug, PartialEq)]
pub struct ResourceLimits {
    /// CPU time limit (user + system); `None` disables the check
    pub cpu_time: Option<Duration>,
    /// Wall clock limit measured from fork
    pub wall_time: Option<Duration>,
    /// Grace period: a CPU-bound program is not killed before it has used
    /// this much CPU time, so its real overshoot can still be reported
    pub extra_time: Duration,
    /// Address space limit in KB
    pub memory_kb: Option<u64>,
    /// Created file size limit in KB
    pub file_size_kb: Option<u64>,
    /// Stack limit in KB; `None` means unlimited
    pub stack_kb: Option<u64>,
    /// Maximum number of processes; `None` means not limited
    pub process_limit: Option<u32>,
    /// Maximum number of open descriptors
    pub fd_limit: u64,
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            cpu_time: None,
            wall_time: None,
            extra_time: Duration::ZERO,
            memory_kb: None,
            file_size_kb: None,
            stack_kb: None,
            process_limit: Some(DEFAULT_PROCESS_LIMIT),
            fd_limit: DEFAULT_FD_LIMIT,
        }
    }
}

/// Where the program's standard error goes
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum StderrTarget {
    /// Keep the keeper's stderr
    #[default]
    Inherit,
    /// Create/truncate the given file
    File(PathBuf),
    /// Duplicate the (possibly redirected) stdout
    Stdout,
}

/// Standard stream redirections for the sandboxed program
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Redirections {
    pub stdin: Option<PathBuf>,
    pub stdout: Option<PathBuf>,
    pub stderr: StderrTarget,
}

/// Destination of the meta report
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum MetaDestination {
    /// No meta report requested
    #[default]
    None,
    /// Write to the keeper's stdout (`--meta=-`)
    Stdout,
    /// Create/truncate the given file
    File(PathBuf),
}

impl MetaDestination {
    pub fn parse(value: &str) -> Self {
        if value == "-" {
            MetaDestination::Stdout
        } else {
            MetaDestination::File(PathBuf::from(value))
        }
    }
}

/// Immutable run configuration, built once from the command line
#[derive(Clone, Debug, Default, PartialEq)]
pub struct SandboxConfig {
    pub limits: ResourceLimits,
    pub redirections: Redirections,
    /// Directory to enter right before exec
    pub workdir: Option<PathBuf>,
    /// User environment rules, in command-line order (built-ins not included)
    pub env_rules: Vec<EnvRule>,
    /// Start from a full copy of the parent environment
    pub inherit_full_env: bool,
    pub meta: MetaDestination,
    /// Number of `-v` flags
    pub verbosity: u8,
    /// Suppress status messages except fatal errors
    pub silent: bool,
    /// Program path followed by its arguments
    pub command: Vec<OsString>,
}

/// Errors of the keeper itself (never of the sandboxed program)
#[derive(Error, Debug)]
pub enum KeeperError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("{0}")]
    Process(String),

    #[error("{0}")]
    ResourceLimit(String),

    #[error("Signal setup error: {0}")]
    Signal(String),

    #[error("{0}")]
    Timing(String),

    #[error("{0}")]
    Meta(String),
}

impl From<nix::errno::Errno> for KeeperError {
    fn from(err: nix::errno::Errno) -> Self {
        KeeperError::Process(err.desc().to_string())
    }
}

/// Result type alias for keeper operations
pub type Result<T> = std::result::Result<T, KeeperError>;
