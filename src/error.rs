//! Typed failures for the relay and pool services.
//!
//! Most glue code returns `anyhow::Result`; these enums cover the cases callers are
//! expected to match on (a configuration defect versus a dev server that never came up).

use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("failed to spawn dev server in {dir}: {source}")]
    Spawn {
        dir: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to bind relay socket {path}: {source}")]
    Bind {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("dev server in {dir} exited before it started listening")]
    ExitedBeforeListening { dir: PathBuf },

    #[error("dev server in {dir} did not start listening within {timeout_ms}ms")]
    StartTimeout { dir: PathBuf, timeout_ms: u64 },

    #[error("start of relay for {dir} was cancelled")]
    Cancelled { dir: PathBuf },

    #[error("no relay is running for {dir}")]
    NotRunning { dir: PathBuf },
}

#[derive(Debug, thiserror::Error)]
pub enum PoolError {
    #[error("no free port between {base} and {last}")]
    PortRangeExhausted { base: u16, last: u16 },

    #[error("refusing to delete pool root {path}: {reason}")]
    UnsafePoolRoot { path: PathBuf, reason: &'static str },

    #[error("template project missing at {path}")]
    TemplateMissing { path: PathBuf },

    #[error("scaffolding template failed: {0}")]
    Scaffold(String),
}
