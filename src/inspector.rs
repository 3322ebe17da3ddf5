//! Listening-socket and process inspection.
//!
//! Answers "which dev servers are running under this directory" by joining the OS
//! socket table with process working directories. Every external command is fail-soft:
//! a failure degrades to an empty result for that unit, never an error.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;
use tokio::process::Command;
use tokio::task::JoinSet;

use crate::classify;
use crate::config::ProbeSettings;
use crate::process::{DetectedServer, DevServerKind, ListeningProject};
use crate::relay::RelayMeta;

/// Upper bound on pids per `lsof` cwd query.
pub const CWD_BATCH_SIZE: usize = 64;

/// Listening sockets owned by one process.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ListeningSocket {
    pub command: String,
    pub ports: BTreeSet<u16>,
}

#[derive(Debug, Clone, Copy)]
pub struct DetectOptions {
    /// Classify each port over HTTP; otherwise every kind is `unknown`.
    pub http: bool,
    pub timeout: Duration,
}

impl Default for DetectOptions {
    fn default() -> Self {
        Self {
            http: true,
            timeout: ProbeSettings::default().timeout,
        }
    }
}

/// Stateless OS query front end. Cloning shares the HTTP client.
#[derive(Debug, Clone)]
pub struct Inspector {
    client: reqwest::Client,
}

impl Inspector {
    pub fn new() -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .no_proxy()
            .redirect(reqwest::redirect::Policy::none())
            .build()?;
        Ok(Self { client })
    }

    /// All TCP sockets in LISTEN state, grouped by owning pid.
    pub async fn list_listening_tcp_sockets(&self) -> HashMap<u32, ListeningSocket> {
        if let Some(stdout) = run_capture("lsof", &["-nP", "-iTCP", "-sTCP:LISTEN", "-Fpcn"]).await {
            return parse_lsof_listen(&stdout);
        }
        if cfg!(target_os = "linux") {
            if let Some(stdout) = run_capture("ss", &["-Hltnp"]).await {
                return parse_ss_listen(&stdout);
            }
        }
        tracing::warn!("no socket enumeration tool available; assuming nothing is listening");
        HashMap::new()
    }

    /// Every port currently listening, system-wide.
    pub async fn listening_ports(&self) -> HashSet<u16> {
        self.list_listening_tcp_sockets()
            .await
            .into_values()
            .flat_map(|s| s.ports)
            .collect()
    }

    /// Current working directory of each pid. Pids that cannot be resolved are omitted.
    pub async fn resolve_working_directories(&self, pids: &[u32]) -> HashMap<u32, PathBuf> {
        let mut resolved = HashMap::new();
        let mut remaining = Vec::new();
        for &pid in pids {
            match proc_cwd(pid) {
                Some(cwd) => {
                    resolved.insert(pid, cwd);
                }
                None => remaining.push(pid),
            }
        }
        for batch in remaining.chunks(CWD_BATCH_SIZE) {
            let list = batch
                .iter()
                .map(u32::to_string)
                .collect::<Vec<_>>()
                .join(",");
            let Some(stdout) = run_capture("lsof", &["-a", "-d", "cwd", "-Fn", "-p", &list]).await else {
                continue;
            };
            resolved.extend(parse_lsof_cwd(&stdout));
        }
        resolved
    }

    /// Fingerprints the dev server on `port`. Invalid ports are `unknown` without any request.
    pub async fn classify_port(&self, port: i64, timeout: Duration) -> DevServerKind {
        match classify::valid_port(port) {
            Some(port) => classify::classify(&self.client, port, timeout).await,
            None => DevServerKind::Unknown,
        }
    }

    /// Dev servers whose working directory is `dir` or below it, ascending by port.
    pub async fn detect_servers_for_directory(
        &self,
        dir: &Path,
        options: DetectOptions,
    ) -> Vec<DetectedServer> {
        if cfg!(windows) {
            return Vec::new();
        }
        let Ok(root) = tokio::fs::canonicalize(dir).await else {
            return Vec::new();
        };
        let sockets = self.list_listening_tcp_sockets().await;
        if sockets.is_empty() {
            return Vec::new();
        }
        let pids = sockets.keys().copied().collect::<Vec<_>>();
        let cwds = self.resolve_working_directories(&pids).await;

        let mut by_port: BTreeMap<u16, DetectedServer> = BTreeMap::new();
        for (pid, socket) in &sockets {
            let Some(cwd) = cwds.get(pid) else {
                continue;
            };
            let cwd = std::fs::canonicalize(cwd).unwrap_or_else(|_| cwd.clone());
            if !is_within(&cwd, &root) {
                continue;
            }
            let owner = relay_pid_for(&cwd, &root).unwrap_or(*pid);
            for port in &socket.ports {
                by_port.entry(*port).or_insert_with(|| DetectedServer {
                    port: *port,
                    pid: owner,
                    cwd: cwd.clone(),
                    command: socket.command.clone(),
                    kind: DevServerKind::Unknown,
                });
            }
        }

        if options.http && !by_port.is_empty() {
            let mut probes = JoinSet::new();
            for port in by_port.keys().copied() {
                let client = self.client.clone();
                let timeout = options.timeout;
                probes.spawn(async move { (port, classify::classify(&client, port, timeout).await) });
            }
            while let Some(joined) = probes.join_next().await {
                if let Ok((port, kind)) = joined {
                    if let Some(server) = by_port.get_mut(&port) {
                        server.kind = kind;
                    }
                }
            }
        }

        by_port.into_values().collect()
    }

    /// Listening projects under `dir`, hiding any whose cwd is inside one of `hidden`.
    pub async fn listening_projects(
        &self,
        dir: &Path,
        hidden: &[PathBuf],
        options: DetectOptions,
    ) -> Vec<ListeningProject> {
        self.detect_servers_for_directory(dir, options)
            .await
            .iter()
            .filter(|server| !hidden.iter().any(|h| is_subpath(&server.cwd, h)))
            .map(ListeningProject::from)
            .collect()
    }

    /// Whether anything answers HTTP on the loopback `port`. Any status counts.
    pub async fn probe_ready(&self, port: u16, timeout: Duration) -> bool {
        let Some(base) = classify::loopback_base(port, timeout).await else {
            return false;
        };
        let url = format!("{}/", base);
        matches!(
            tokio::time::timeout(timeout, self.client.get(&url).send()).await,
            Ok(Ok(_))
        )
    }

    /// Polls `probe_ready` until it succeeds or `deadline` elapses.
    pub async fn wait_until_ready(&self, port: u16, deadline: Duration) -> bool {
        let end = tokio::time::Instant::now() + deadline;
        loop {
            let left = end.saturating_duration_since(tokio::time::Instant::now());
            if left.is_zero() {
                return false;
            }
            if self.probe_ready(port, left.min(Duration::from_millis(500))).await {
                return true;
            }
            tokio::time::sleep(Duration::from_millis(100).min(left)).await;
        }
    }
}

/// Whether `candidate` is `dir` or a descendant of it, after resolving both.
///
/// Comparison is by path component, so `/home/u/app2` is not inside `/home/u/app`.
pub fn is_subpath(candidate: &Path, dir: &Path) -> bool {
    let candidate = std::fs::canonicalize(candidate).unwrap_or_else(|_| candidate.to_path_buf());
    let dir = std::fs::canonicalize(dir).unwrap_or_else(|_| dir.to_path_buf());
    is_within(&candidate, &dir)
}

fn is_within(candidate: &Path, dir: &Path) -> bool {
    candidate.starts_with(dir)
}

/// Pid recorded by the nearest relay marker between `cwd` and `root`.
fn relay_pid_for(cwd: &Path, root: &Path) -> Option<u32> {
    cwd.ancestors()
        .take_while(|p| p.starts_with(root))
        .find_map(|p| RelayMeta::read(p).map(|meta| meta.pid))
}

#[cfg(target_os = "linux")]
fn proc_cwd(pid: u32) -> Option<PathBuf> {
    std::fs::read_link(format!("/proc/{}/cwd", pid)).ok()
}

#[cfg(not(target_os = "linux"))]
fn proc_cwd(_pid: u32) -> Option<PathBuf> {
    None
}

async fn run_capture(program: &str, args: &[&str]) -> Option<String> {
    match Command::new(program).args(args).output().await {
        // lsof exits 1 when nothing matched; its stdout is still authoritative.
        Ok(output) => Some(String::from_utf8_lossy(&output.stdout).to_string()),
        Err(err) => {
            tracing::debug!(program, error = %err, "inspection command failed");
            None
        }
    }
}

fn port_from_address(address: &str) -> Option<u16> {
    let (_, port) = address.rsplit_once(':')?;
    port.parse().ok()
}

/// Parses `lsof -Fpcn` output for listening sockets.
pub fn parse_lsof_listen(stdout: &str) -> HashMap<u32, ListeningSocket> {
    let mut sockets: HashMap<u32, ListeningSocket> = HashMap::new();
    let mut current: Option<u32> = None;
    for line in stdout.lines() {
        let Some(tag) = line.chars().next() else {
            continue;
        };
        let value = &line[tag.len_utf8()..];
        match tag {
            'p' => {
                current = value.parse().ok();
                if let Some(pid) = current {
                    sockets.entry(pid).or_default();
                }
            }
            'c' => {
                if let Some(socket) = current.and_then(|pid| sockets.get_mut(&pid)) {
                    socket.command = value.to_string();
                }
            }
            'n' => {
                // "*:5173", "127.0.0.1:3000", "[::1]:5173"; skip established pairs.
                if value.contains("->") {
                    continue;
                }
                if let (Some(socket), Some(port)) = (
                    current.and_then(|pid| sockets.get_mut(&pid)),
                    port_from_address(value),
                ) {
                    socket.ports.insert(port);
                }
            }
            _ => {}
        }
    }
    sockets.retain(|_, s| !s.ports.is_empty());
    sockets
}

/// Parses `ss -Hltnp` output.
pub fn parse_ss_listen(stdout: &str) -> HashMap<u32, ListeningSocket> {
    static USERS: OnceLock<Option<Regex>> = OnceLock::new();
    let Some(users) = USERS.get_or_init(|| Regex::new(r#"\("([^"]*)",pid=(\d+)"#).ok()) else {
        return HashMap::new();
    };
    let mut sockets: HashMap<u32, ListeningSocket> = HashMap::new();
    for line in stdout.lines() {
        let columns = line.split_whitespace().collect::<Vec<_>>();
        let Some(local) = columns.get(3) else {
            continue;
        };
        let Some(port) = port_from_address(local) else {
            continue;
        };
        for caps in users.captures_iter(line) {
            let Ok(pid) = caps[2].parse::<u32>() else {
                continue;
            };
            let socket = sockets.entry(pid).or_default();
            socket.command = caps[1].to_string();
            socket.ports.insert(port);
        }
    }
    sockets
}

/// Parses `lsof -a -d cwd -Fn -p ...` output into pid → cwd.
pub fn parse_lsof_cwd(stdout: &str) -> HashMap<u32, PathBuf> {
    let mut cwds = HashMap::new();
    let mut current: Option<u32> = None;
    for line in stdout.lines() {
        if let Some(pid) = line.strip_prefix('p') {
            current = pid.parse().ok();
        } else if let Some(path) = line.strip_prefix('n') {
            if let Some(pid) = current {
                cwds.insert(pid, PathBuf::from(path));
            }
        }
    }
    cwds
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn subpath_rejects_textual_prefix_siblings() {
        let root = tempfile::tempdir().unwrap();
        let app = root.path().join("app");
        let app2 = root.path().join("app2");
        let nested = app.join("packages").join("web");
        fs::create_dir_all(&nested).unwrap();
        fs::create_dir_all(&app2).unwrap();

        assert!(is_subpath(&app, &app));
        assert!(is_subpath(&nested, &app));
        assert!(!is_subpath(&app2, &app));
        assert!(!is_subpath(&app, &nested));
    }

    #[cfg(unix)]
    #[test]
    fn subpath_follows_symlinks() {
        let root = tempfile::tempdir().unwrap();
        let app = root.path().join("app");
        let inner = app.join("src");
        fs::create_dir_all(&inner).unwrap();
        let link = root.path().join("shortcut");
        std::os::unix::fs::symlink(&inner, &link).unwrap();
        assert!(is_subpath(&link, &app));
    }

    #[test]
    fn parses_lsof_listen_output() {
        let out = "p101\ncnode\nf23\nn*:5173\nf24\nn[::1]:5173\np202\ncpython3\nf3\nn127.0.0.1:8000\np303\ncsshd\nf4\nn10.0.0.1:22->10.0.0.2:5555\n";
        let sockets = parse_lsof_listen(out);
        assert_eq!(sockets.len(), 2);
        assert_eq!(sockets[&101].command, "node");
        assert_eq!(sockets[&101].ports, BTreeSet::from([5173]));
        assert_eq!(sockets[&202].ports, BTreeSet::from([8000]));
    }

    #[test]
    fn parses_ss_listen_output() {
        let out = "LISTEN 0      511          *:5173       *:*    users:((\"node\",pid=4242,fd=23))\nLISTEN 0      128    0.0.0.0:22      0.0.0.0:*\nLISTEN 0      5      127.0.0.1:8000    0.0.0.0:*    users:((\"python3\",pid=77,fd=3),(\"python3\",pid=78,fd=3))\n";
        let sockets = parse_ss_listen(out);
        assert_eq!(sockets.len(), 3);
        assert_eq!(sockets[&4242].command, "node");
        assert_eq!(sockets[&4242].ports, BTreeSet::from([5173]));
        assert_eq!(sockets[&78].ports, BTreeSet::from([8000]));
    }

    #[test]
    fn parses_lsof_cwd_output() {
        let out = "p10\nfcwd\nn/home/dev/app\np11\nfcwd\nn/tmp\n";
        let cwds = parse_lsof_cwd(out);
        assert_eq!(cwds[&10], PathBuf::from("/home/dev/app"));
        assert_eq!(cwds[&11], PathBuf::from("/tmp"));
    }

    #[test]
    fn relay_marker_overrides_listener_pid() {
        let root = tempfile::tempdir().unwrap();
        let root = fs::canonicalize(root.path()).unwrap();
        let app = root.join("app");
        let nested = app.join("apps").join("web");
        fs::create_dir_all(&nested).unwrap();
        RelayMeta {
            pid: 999,
            sock: app.join(".devrelay.sock"),
        }
        .write(&app)
        .unwrap();
        assert_eq!(relay_pid_for(&nested, &app), Some(999));
        assert_eq!(relay_pid_for(&nested, &nested), None);
    }

    #[tokio::test]
    async fn invalid_ports_classify_as_unknown() {
        let inspector = Inspector::new().unwrap();
        for port in [0, -1, 70000] {
            assert_eq!(
                inspector.classify_port(port, Duration::from_millis(50)).await,
                DevServerKind::Unknown
            );
        }
    }

    #[tokio::test]
    async fn missing_directory_detects_nothing() {
        let inspector = Inspector::new().unwrap();
        let servers = inspector
            .detect_servers_for_directory(Path::new("/definitely/not/here"), DetectOptions::default())
            .await;
        assert!(servers.is_empty());
    }

    #[tokio::test]
    async fn probe_ready_sees_any_http_listener() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            use tokio::io::{AsyncReadExt, AsyncWriteExt};
            while let Ok((mut stream, _)) = listener.accept().await {
                let mut buf = [0u8; 1024];
                let _ = stream.read(&mut buf).await;
                let _ = stream
                    .write_all(b"HTTP/1.1 500 X\r\ncontent-length: 0\r\nconnection: close\r\n\r\n")
                    .await;
            }
        });
        let inspector = Inspector::new().unwrap();
        assert!(inspector.wait_until_ready(port, Duration::from_secs(2)).await);

        let closed = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let closed_port = closed.local_addr().unwrap().port();
        drop(closed);
        assert!(!inspector.probe_ready(closed_port, Duration::from_millis(200)).await);
    }

    #[tokio::test]
    async fn probe_ready_reaches_ipv6_loopback() {
        let Ok(listener) = tokio::net::TcpListener::bind("[::1]:0").await else {
            return;
        };
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            use tokio::io::{AsyncReadExt, AsyncWriteExt};
            while let Ok((mut stream, _)) = listener.accept().await {
                let mut buf = [0u8; 1024];
                let _ = stream.read(&mut buf).await;
                let _ = stream
                    .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 0\r\nconnection: close\r\n\r\n")
                    .await;
            }
        });
        let inspector = Inspector::new().unwrap();
        assert!(inspector.probe_ready(port, Duration::from_secs(2)).await);
    }
}
