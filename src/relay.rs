//! Relay service: one supervised dev server per directory, streamed over a unix socket.
//!
//! Each relay is owned by a supervisor task holding the child, the socket listener and a
//! broadcast sender. Clients receive `CONNECTED\n` followed by everything the child writes
//! from that point on; there is no backlog. A client may send `KILL` to stop the child.
//! Any exit of the child tears the relay down completely: listener closed, clients
//! disconnected, socket and marker files removed, registry entry dropped.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::{UnixListener, UnixStream};
use tokio::process::Child;
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::config::{ProbeSettings, RelaySettings};
use crate::error::RelayError;
use crate::events::{ProcessSignal, RelayEvent};
use crate::inspector::{DetectOptions, Inspector};
use crate::output::{OutputChunk, StreamKind};
use crate::process::{DetectedServer, DevServerKind};
use crate::resolver::{resolve_dev_command, DevCommand};
use crate::runner::{pump_stream, send_os_signal, spawn_dev_server, terminate, LaunchPlan};

pub const SOCKET_FILE: &str = ".devrelay.sock";
pub const META_FILE: &str = ".devrelay.json";
pub const ACK: &[u8] = b"CONNECTED\n";

const BROADCAST_CAPACITY: usize = 1024;
const PUMP_DRAIN: Duration = Duration::from_millis(200);

/// Marker written next to a relayed project so other processes can find the relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayMeta {
    pub pid: u32,
    pub sock: PathBuf,
}

impl RelayMeta {
    pub fn read(dir: &Path) -> Option<Self> {
        let raw = std::fs::read_to_string(dir.join(META_FILE)).ok()?;
        serde_json::from_str(&raw).ok()
    }

    pub fn write(&self, dir: &Path) -> anyhow::Result<()> {
        let path = dir.join(META_FILE);
        let json = serde_json::to_string(self)?;
        std::fs::write(&path, json).with_context(|| format!("failed to write {}", path.display()))
    }
}

pub fn socket_path(dir: &Path) -> PathBuf {
    dir.join(SOCKET_FILE)
}

/// What `start` waits for before returning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadyWait {
    /// Return as soon as the process is spawned and the socket is bound.
    Immediate,
    /// Wait until a port that was not listening before the spawn appears under the directory.
    NewListener,
}

#[derive(Debug, Clone)]
pub struct StartOptions {
    pub port: Option<u16>,
    pub wait: ReadyWait,
    /// Mirror child output onto this process's stdout/stderr.
    pub echo: bool,
    pub events: Option<mpsc::Sender<RelayEvent>>,
    pub cancel: CancellationToken,
}

impl Default for StartOptions {
    fn default() -> Self {
        Self {
            port: None,
            wait: ReadyWait::NewListener,
            echo: true,
            events: None,
            cancel: CancellationToken::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RelayStart {
    pub socket_path: PathBuf,
    pub pid: u32,
    /// First new dev server seen; None for `ReadyWait::Immediate`.
    pub project: Option<DetectedServer>,
}

struct RelayHandle {
    generation: u64,
    pid: u32,
    stop: CancellationToken,
    done: watch::Receiver<bool>,
}

impl RelayHandle {
    async fn shutdown(mut self) {
        self.stop.cancel();
        let _ = self.done.wait_for(|done| *done).await;
    }
}

struct Inner {
    relays: Mutex<HashMap<PathBuf, RelayHandle>>,
    launch: Mutex<()>,
    generation: AtomicU64,
    inspector: Inspector,
    settings: RelaySettings,
    probe: ProbeSettings,
}

/// Registry of running relays, keyed by canonical project directory.
#[derive(Clone)]
pub struct RelayService {
    inner: Arc<Inner>,
}

impl RelayService {
    pub fn new(inspector: Inspector, settings: RelaySettings, probe: ProbeSettings) -> Self {
        Self {
            inner: Arc::new(Inner {
                relays: Mutex::new(HashMap::new()),
                launch: Mutex::new(()),
                generation: AtomicU64::new(0),
                inspector,
                settings,
                probe,
            }),
        }
    }

    /// Starts (or replaces) the relay for `dir`.
    pub async fn start(&self, dir: &Path, options: StartOptions) -> Result<RelayStart, RelayError> {
        let dir = tokio::fs::canonicalize(dir)
            .await
            .map_err(|source| RelayError::Spawn {
                dir: dir.to_path_buf(),
                source,
            })?;
        let socket_path = socket_path(&dir);

        let launch = self.inner.launch.lock().await;
        let previous = self.inner.relays.lock().await.remove(&dir);
        if let Some(previous) = previous {
            tracing::info!(dir = %dir.display(), pid = previous.pid, "replacing existing relay");
            previous.shutdown().await;
        }
        // A socket left behind by a crashed relay would block bind.
        let _ = tokio::fs::remove_file(&socket_path).await;

        let baseline: HashSet<u16> = match options.wait {
            ReadyWait::Immediate => HashSet::new(),
            ReadyWait::NewListener => self
                .inner
                .inspector
                .detect_servers_for_directory(&dir, self.quick_detect())
                .await
                .into_iter()
                .map(|s| s.port)
                .collect(),
        };

        let plan = self.launch_plan(&dir, options.port);
        let mut child = spawn_dev_server(&plan).map_err(|source| RelayError::Spawn {
            dir: dir.clone(),
            source,
        })?;
        let pid = child.id().unwrap_or(0);

        let listener = match UnixListener::bind(&socket_path) {
            Ok(listener) => listener,
            Err(source) => {
                terminate(&mut child, self.inner.settings.shutdown_grace).await;
                return Err(RelayError::Bind {
                    path: socket_path,
                    source,
                });
            }
        };
        let meta = RelayMeta {
            pid,
            sock: socket_path.clone(),
        };
        if let Err(err) = meta.write(&dir) {
            tracing::warn!(dir = %dir.display(), error = %err, "failed to write relay marker");
        }

        let (tx, _) = broadcast::channel(BROADCAST_CAPACITY);
        let mut pumps = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            pumps.push(tokio::spawn(pump_stream(stdout, StreamKind::Stdout, tx.clone(), options.echo)));
        }
        if let Some(stderr) = child.stderr.take() {
            pumps.push(tokio::spawn(pump_stream(stderr, StreamKind::Stderr, tx.clone(), options.echo)));
        }

        let stop = CancellationToken::new();
        let (done_tx, done_rx) = watch::channel(false);
        let generation = self.inner.generation.fetch_add(1, Ordering::Relaxed);
        self.inner.relays.lock().await.insert(
            dir.clone(),
            RelayHandle {
                generation,
                pid,
                stop: stop.clone(),
                done: done_rx.clone(),
            },
        );
        tracing::info!(dir = %dir.display(), pid, command = %plan.display(), "relay started");
        if let Some(events) = &options.events {
            let _ = events
                .send(RelayEvent::Starting {
                    cwd: dir.clone(),
                    pid,
                })
                .await;
        }

        tokio::spawn(supervise(Supervisor {
            service: self.clone(),
            dir: dir.clone(),
            generation,
            child,
            listener,
            tx,
            pumps,
            stop,
            done: done_tx,
            events: options.events.clone(),
        }));
        drop(launch);

        let project = match options.wait {
            ReadyWait::Immediate => None,
            ReadyWait::NewListener => {
                match self
                    .wait_for_listener(&dir, &baseline, options.port, pid, done_rx, &options.cancel)
                    .await
                {
                    Ok(server) => {
                        if let Some(events) = &options.events {
                            let _ = events
                                .send(RelayEvent::Listening {
                                    server: server.clone(),
                                })
                                .await;
                        }
                        Some(server)
                    }
                    Err(err) => {
                        // A newer start may already own `dir`; leave that relay alone.
                        self.stop_generation(&dir, generation).await;
                        return Err(err);
                    }
                }
            }
        };

        Ok(RelayStart {
            socket_path,
            pid,
            project,
        })
    }

    /// Stops the relay for `dir`. Returns false when no relay was tracked.
    pub async fn stop(&self, dir: &Path) -> bool {
        let key = tokio::fs::canonicalize(dir)
            .await
            .unwrap_or_else(|_| dir.to_path_buf());
        let handle = self.inner.relays.lock().await.remove(&key);
        match handle {
            Some(handle) => {
                let pid = handle.pid;
                handle.shutdown().await;
                tracing::info!(dir = %key.display(), pid, "relay stopped");
                true
            }
            None => false,
        }
    }

    async fn stop_generation(&self, dir: &Path, generation: u64) {
        let handle = {
            let mut relays = self.inner.relays.lock().await;
            match relays.get(dir) {
                Some(handle) if handle.generation == generation => relays.remove(dir),
                _ => None,
            }
        };
        if let Some(handle) = handle {
            let pid = handle.pid;
            handle.shutdown().await;
            tracing::info!(dir = %dir.display(), pid, "relay stopped after failed start");
        }
    }

    /// Stops every tracked relay.
    pub async fn stop_all(&self) {
        let handles = self
            .inner
            .relays
            .lock()
            .await
            .drain()
            .map(|(_, handle)| handle)
            .collect::<Vec<_>>();
        for handle in handles {
            handle.shutdown().await;
        }
    }

    /// Pid of the relayed dev server for `dir`, if one is tracked.
    pub async fn pid(&self, dir: &Path) -> Option<u32> {
        let key = tokio::fs::canonicalize(dir).await.ok()?;
        self.inner.relays.lock().await.get(&key).map(|h| h.pid)
    }

    /// Tracked relays as (directory, pid).
    pub async fn running(&self) -> Vec<(PathBuf, u32)> {
        let mut running = self
            .inner
            .relays
            .lock()
            .await
            .iter()
            .map(|(dir, handle)| (dir.clone(), handle.pid))
            .collect::<Vec<_>>();
        running.sort();
        running
    }

    pub fn inspector(&self) -> &Inspector {
        &self.inner.inspector
    }

    fn quick_detect(&self) -> DetectOptions {
        DetectOptions {
            http: false,
            timeout: self.inner.probe.timeout,
        }
    }

    fn launch_plan(&self, dir: &Path, port: Option<u16>) -> LaunchPlan {
        let resolved = resolve_dev_command(dir, &self.inner.settings.package_manager);
        let (program, mut args, npm_fallback) = match resolved {
            DevCommand::Bin { cmd, args } => (cmd, args, false),
            DevCommand::Fallback { cmd, args } => {
                let npm = cmd == "npm";
                (PathBuf::from(cmd), args, npm)
            }
        };
        let mut env = vec![
            ("FORCE_COLOR".to_string(), "1".to_string()),
            ("CLICOLOR_FORCE".to_string(), "1".to_string()),
        ];
        if let Some(port) = port {
            if npm_fallback {
                args.push("--".to_string());
            }
            args.push("--port".to_string());
            args.push(port.to_string());
            env.push(("PORT".to_string(), port.to_string()));
        }
        LaunchPlan {
            program,
            args,
            cwd: dir.to_path_buf(),
            env,
        }
    }

    async fn wait_for_listener(
        &self,
        dir: &Path,
        baseline: &HashSet<u16>,
        port: Option<u16>,
        pid: u32,
        done: watch::Receiver<bool>,
        cancel: &CancellationToken,
    ) -> Result<DetectedServer, RelayError> {
        let settings = &self.inner.settings;
        let inspector = &self.inner.inspector;
        let deadline = tokio::time::Instant::now() + settings.start_timeout;
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(RelayError::Cancelled { dir: dir.to_path_buf() });
                }
                _ = tokio::time::sleep(settings.poll_interval) => {}
            }
            if *done.borrow() {
                return Err(RelayError::ExitedBeforeListening {
                    dir: dir.to_path_buf(),
                });
            }

            let servers = inspector
                .detect_servers_for_directory(dir, self.quick_detect())
                .await;
            let mut fresh = servers.into_iter().find(|s| !baseline.contains(&s.port));
            // Socket tables may be unavailable; a requested port that answers is proof enough.
            if let (None, Some(port)) = (&fresh, port) {
                if !baseline.contains(&port)
                    && inspector.probe_ready(port, Duration::from_millis(300)).await
                {
                    fresh = Some(DetectedServer {
                        port,
                        pid,
                        cwd: dir.to_path_buf(),
                        command: String::new(),
                        kind: DevServerKind::Unknown,
                    });
                }
            }
            if let Some(mut server) = fresh {
                server.kind = inspector
                    .classify_port(i64::from(server.port), self.inner.probe.timeout)
                    .await;
                return Ok(server);
            }

            if tokio::time::Instant::now() >= deadline {
                return Err(RelayError::StartTimeout {
                    dir: dir.to_path_buf(),
                    timeout_ms: settings.start_timeout.as_millis() as u64,
                });
            }
        }
    }

    async fn deregister(&self, dir: &Path, generation: u64) {
        let mut relays = self.inner.relays.lock().await;
        if relays.get(dir).map(|h| h.generation) == Some(generation) {
            relays.remove(dir);
        }
    }
}

struct Supervisor {
    service: RelayService,
    dir: PathBuf,
    generation: u64,
    child: Child,
    listener: UnixListener,
    tx: broadcast::Sender<OutputChunk>,
    pumps: Vec<JoinHandle<()>>,
    stop: CancellationToken,
    done: watch::Sender<bool>,
    events: Option<mpsc::Sender<RelayEvent>>,
}

async fn supervise(sup: Supervisor) {
    let Supervisor {
        service,
        dir,
        generation,
        mut child,
        listener,
        tx,
        pumps,
        stop,
        done,
        events,
    } = sup;
    let grace = service.inner.settings.shutdown_grace;
    let pid = child.id().unwrap_or(0);
    let clients = CancellationToken::new();
    let (kill_tx, mut kill_rx) = mpsc::channel::<()>(4);

    let status = loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, _)) => {
                    tokio::spawn(serve_client(stream, tx.subscribe(), kill_tx.clone(), clients.child_token()));
                }
                Err(err) => tracing::debug!(error = %err, "relay accept failed"),
            },
            status = child.wait() => break status.ok(),
            _ = stop.cancelled() => break terminate(&mut child, grace).await,
            Some(()) = kill_rx.recv() => {
                tracing::info!(dir = %dir.display(), "KILL received over relay socket");
                break terminate(&mut child, grace).await;
            }
        }
    };
    let code = status.and_then(|s| s.code());

    drop(listener);
    for pump in pumps {
        let abort = pump.abort_handle();
        if tokio::time::timeout(PUMP_DRAIN, pump).await.is_err() {
            abort.abort();
        }
    }
    clients.cancel();
    let _ = tokio::fs::remove_file(socket_path(&dir)).await;
    if RelayMeta::read(&dir).map(|m| m.pid) == Some(pid) {
        let _ = tokio::fs::remove_file(dir.join(META_FILE)).await;
    }
    service.deregister(&dir, generation).await;
    tracing::info!(dir = %dir.display(), pid, code = ?code, "dev server exited");
    if let Some(events) = events {
        let _ = events.send(RelayEvent::Exited { cwd: dir, code }).await;
    }
    let _ = done.send(true);
}

fn is_kill_command(data: &[u8]) -> bool {
    std::str::from_utf8(data)
        .map(|s| s.trim().eq_ignore_ascii_case("kill"))
        .unwrap_or(false)
}

async fn serve_client(
    stream: UnixStream,
    mut rx: broadcast::Receiver<OutputChunk>,
    kill_tx: mpsc::Sender<()>,
    cancel: CancellationToken,
) {
    let (mut reader, mut writer) = stream.into_split();
    if writer.write_all(ACK).await.is_err() {
        return;
    }
    let mut buf = [0u8; 256];
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            message = rx.recv() => match message {
                Ok(chunk) => {
                    if writer.write_all(&chunk.data).await.is_err() {
                        break;
                    }
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "relay client fell behind; dropping output");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            },
            read = reader.read(&mut buf) => match read {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    if is_kill_command(&buf[..n]) {
                        let _ = kill_tx.try_send(());
                    }
                }
            },
        }
    }
    let _ = writer.shutdown().await;
}

/// Client side of a relay socket.
pub struct RelayConnection {
    writer: Mutex<Option<OwnedWriteHalf>>,
    reader: JoinHandle<()>,
}

impl RelayConnection {
    /// Asks the relay to terminate its dev server.
    pub async fn kill(&self) -> std::io::Result<()> {
        let mut writer = self.writer.lock().await;
        match writer.as_mut() {
            Some(writer) => writer.write_all(b"KILL\n").await,
            None => Err(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "relay connection closed",
            )),
        }
    }

    /// Resolves once the relay closes the stream.
    pub async fn closed(&mut self) {
        let _ = (&mut self.reader).await;
    }

    /// Ends and drops the connection. Safe to call more than once.
    pub async fn close(&self) {
        if let Some(mut writer) = self.writer.lock().await.take() {
            let _ = writer.shutdown().await;
        }
        self.reader.abort();
    }
}

/// Attaches to the relay already running for `dir`; `on_data` gets every received chunk,
/// starting with the `CONNECTED` acknowledgement.
pub async fn connect<F>(dir: &Path, mut on_data: F) -> anyhow::Result<RelayConnection>
where
    F: FnMut(Bytes) + Send + 'static,
{
    let path = socket_path(dir);
    let stream = UnixStream::connect(&path)
        .await
        .map_err(|_| RelayError::NotRunning {
            dir: dir.to_path_buf(),
        })?;
    let (mut reader, writer) = stream.into_split();
    let reader = tokio::spawn(async move {
        let mut buf = vec![0u8; 8 * 1024];
        loop {
            match reader.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => on_data(Bytes::copy_from_slice(&buf[..n])),
            }
        }
    });
    Ok(RelayConnection {
        writer: Mutex::new(Some(writer)),
        reader,
    })
}

/// Asks whichever process hosts the relay for `dir` to stop it.
pub async fn request_kill(dir: &Path) -> anyhow::Result<()> {
    let connection = connect(dir, |_| {}).await?;
    connection.kill().await?;
    connection.close().await;
    Ok(())
}

/// Best-effort signal to a relay's recorded pid when no host is reachable.
pub fn signal_recorded_pid(dir: &Path, signal: ProcessSignal) -> bool {
    match RelayMeta::read(dir) {
        Some(meta) if meta.pid != 0 => {
            send_os_signal(meta.pid, signal);
            true
        }
        _ => false,
    }
}
