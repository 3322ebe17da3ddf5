//! Data structures for tracking dev servers.
//!
//! A dev server is either `Starting` (a relay spawned it but no port is confirmed) or
//! `Listening` (the inspector saw its socket). `ProjectLaunch` owns the transition
//! between the two for one launch.

use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::events::RelayEvent;

/// Build tool identity of a dev server, determined by HTTP fingerprinting.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum DevServerKind {
    Vite,
    Next,
    WebpackDevServer,
    Unknown,
}

impl DevServerKind {
    pub fn as_str(self) -> &'static str {
        match self {
            DevServerKind::Vite => "vite",
            DevServerKind::Next => "next",
            DevServerKind::WebpackDevServer => "webpack-dev-server",
            DevServerKind::Unknown => "unknown",
        }
    }
}

impl fmt::Display for DevServerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One listening port found under a directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DetectedServer {
    pub port: u16,
    /// Spawning relay pid when a relay marker is present, otherwise the listener's pid.
    pub pid: u32,
    pub cwd: PathBuf,
    pub command: String,
    pub kind: DevServerKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListeningProject {
    pub port: u16,
    pub pid: u32,
    pub cwd: PathBuf,
    pub kind: DevServerKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartingProject {
    pub cwd: PathBuf,
    pub pid: u32,
    pub kind: DevServerKind,
}

/// A dev server that is either confirmed listening or still starting.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "runningKind", rename_all = "lowercase")]
pub enum RunningProject {
    Listening(ListeningProject),
    Starting(StartingProject),
}

impl RunningProject {
    /// Stable key for consumers. Changes when a launch becomes listening.
    pub fn identity(&self) -> String {
        match self {
            RunningProject::Listening(p) => format!("{}-{}", p.cwd.display(), p.port),
            RunningProject::Starting(p) => format!("starting-{}", p.cwd.display()),
        }
    }

    pub fn cwd(&self) -> &Path {
        match self {
            RunningProject::Listening(p) => &p.cwd,
            RunningProject::Starting(p) => &p.cwd,
        }
    }

    pub fn pid(&self) -> u32 {
        match self {
            RunningProject::Listening(p) => p.pid,
            RunningProject::Starting(p) => p.pid,
        }
    }
}

impl From<&DetectedServer> for ListeningProject {
    fn from(server: &DetectedServer) -> Self {
        Self {
            port: server.port,
            pid: server.pid,
            cwd: server.cwd.clone(),
            kind: server.kind,
        }
    }
}

/// Lifecycle of a single relay launch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LaunchState {
    Absent,
    Starting(StartingProject),
    Listening(ListeningProject),
    Stopped { code: Option<i32> },
}

/// Owns the starting → listening → stopped transition for one launch.
#[derive(Debug, Clone)]
pub struct ProjectLaunch {
    state: LaunchState,
}

impl Default for ProjectLaunch {
    fn default() -> Self {
        Self::new()
    }
}

impl ProjectLaunch {
    pub fn new() -> Self {
        Self {
            state: LaunchState::Absent,
        }
    }

    pub fn state(&self) -> &LaunchState {
        &self.state
    }

    /// Applies a relay event. Returns `true` if the state changed.
    ///
    /// Events that would move the launch backwards are ignored, and nothing leaves
    /// `Stopped`.
    pub fn apply(&mut self, event: &RelayEvent) -> bool {
        let next = match (&self.state, event) {
            (LaunchState::Stopped { .. }, _) => return false,
            (LaunchState::Absent, RelayEvent::Starting { cwd, pid }) => {
                LaunchState::Starting(StartingProject {
                    cwd: cwd.clone(),
                    pid: *pid,
                    kind: DevServerKind::Unknown,
                })
            }
            (LaunchState::Absent | LaunchState::Starting(_), RelayEvent::Listening { server }) => {
                LaunchState::Listening(ListeningProject::from(server))
            }
            (_, RelayEvent::Exited { code, .. }) => LaunchState::Stopped { code: *code },
            _ => return false,
        };
        self.state = next;
        true
    }

    /// The running project this launch currently represents, if any.
    pub fn current(&self) -> Option<RunningProject> {
        match &self.state {
            LaunchState::Starting(p) => Some(RunningProject::Starting(p.clone())),
            LaunchState::Listening(p) => Some(RunningProject::Listening(p.clone())),
            LaunchState::Absent | LaunchState::Stopped { .. } => None,
        }
    }
}
