use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while loading or validating a [`crate::config::Config`].
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required field `{field}` for log type `{log_type}`")]
    MissingField { log_type: String, field: &'static str },

    #[error("log type `{log_type}` pattern {index} has no capture group: `{pattern}`")]
    MissingCaptureGroup {
        log_type: String,
        index: usize,
        pattern: String,
    },

    #[error("log type `{log_type}` pattern {index} failed to compile: {source}")]
    BadRegex {
        log_type: String,
        index: usize,
        #[source]
        source: regex::Error,
    },

    #[error("invalid CIDR `{cidr}`: {source}")]
    BadCidr {
        cidr: String,
        #[source]
        source: ipnet::AddrParseError,
    },

    #[error("failed to read config file `{path}`: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file `{path}`: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
}

/// Errors raised while reading or writing a [`crate::cache::CacheRecord`].
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache file `{path}` is truncated or corrupt: {reason}")]
    Malformed { path: PathBuf, reason: &'static str },

    #[error("cache file `{path}` has unsupported magic/version")]
    BadMagic { path: PathBuf },

    #[error("I/O error on cache file `{path}`: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Errors raised while opening or parsing a raw (or gzip) log file.
#[derive(Debug, Error)]
pub enum LogIoError {
    #[error("cannot open log file `{path}`: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error reading log file `{path}`: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Errors raised by a [`crate::firewall::FirewallAdapter`].
#[derive(Debug, Error)]
pub enum FirewallError {
    #[error("failed to spawn `{tool}`: {source}")]
    Spawn {
        tool: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to read live `{tool}` INPUT chain: {reason}")]
    Read { tool: &'static str, reason: String },

    #[error("`{tool}` exited with status {status}: {stderr}")]
    NonZeroExit {
        tool: &'static str,
        status: i32,
        stderr: String,
    },
}

/// Top-level errors surfaced by [`crate::reconcile::run`].
#[derive(Debug, Error)]
pub enum RunError {
    #[error("another instance holds the lock at `{path}`")]
    LockHeld { path: PathBuf },

    #[error("failed to acquire lock at `{path}`: {source}")]
    Lock {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("this program must run as root (use -t/--test to run unprivileged)")]
    NotRoot,

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Firewall(#[from] FirewallError),

    #[error("failed to create cache root `{path}`: {source}")]
    CacheRoot {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}
