//! Event definitions for relay launches.
//!
//! A relay reports its lifecycle on an optional channel so that a caller can drive a
//! `ProjectLaunch` without polling.

use std::path::PathBuf;

use crate::process::DetectedServer;

/// Lifecycle notification emitted by a relay.
#[derive(Debug, Clone)]
pub enum RelayEvent {
    /// The dev server process was spawned.
    Starting { cwd: PathBuf, pid: u32 },
    /// A new listening port was confirmed under the relay's directory.
    Listening { server: DetectedServer },
    /// The dev server exited (None usually implies signal termination).
    Exited { cwd: PathBuf, code: Option<i32> },
}

/// Signal sent to a dev server's process group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessSignal {
    SigTerm,
    SigKill,
}
