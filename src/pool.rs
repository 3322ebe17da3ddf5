//! Warm pool of pre-started scaffold projects.
//!
//! Entries are clones of a template project, each with a relay already serving it on
//! its own port. Claims take the oldest entry; replenishment happens in the background.
//! All reads and writes of the pool index go through `BufferService::state`.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use serde::Serialize;
use tokio::sync::Mutex;

use crate::clone::clone_dir;
use crate::config::{PoolSettings, ProbeSettings};
use crate::control::CONTROL_SOCKET;
use crate::error::PoolError;
use crate::events::ProcessSignal;
use crate::inspector::{is_subpath, DetectOptions, Inspector};
use crate::pool_index::{BufferedMeta, PoolIndex, INDEX_FILE};
use crate::process::{DevServerKind, RunningProject, StartingProject};
use crate::relay::{ReadyWait, RelayService, StartOptions};
use crate::runner::{pid_alive, run_to_completion, send_os_signal};

#[derive(Debug, Clone)]
pub struct CreateOptions {
    /// Where an on-demand project goes when the pool is empty.
    pub target_dir: Option<PathBuf>,
    /// Start one background seed after the claim.
    pub replenish: bool,
}

impl Default for CreateOptions {
    fn default() -> Self {
        Self {
            target_dir: None,
            replenish: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClaimOutcome {
    pub meta: BufferedMeta,
    /// False when the pool was empty and the project was created on demand.
    pub hit: bool,
}

struct PoolState {
    /// Ports picked for entries that are not in the index yet.
    reserved: HashSet<u16>,
}

struct PoolInner {
    relays: RelayService,
    settings: PoolSettings,
    probe: ProbeSettings,
    home: PathBuf,
    index: PoolIndex,
    state: Mutex<PoolState>,
}

#[derive(Clone)]
pub struct BufferService {
    inner: Arc<PoolInner>,
}

impl BufferService {
    pub fn new(relays: RelayService, settings: PoolSettings, probe: ProbeSettings, home: PathBuf) -> Self {
        let index = PoolIndex::new(&settings.root);
        Self {
            inner: Arc::new(PoolInner {
                relays,
                settings,
                probe,
                home,
                index,
                state: Mutex::new(PoolState {
                    reserved: HashSet::new(),
                }),
            }),
        }
    }

    pub fn settings(&self) -> &PoolSettings {
        &self.inner.settings
    }

    pub fn relays(&self) -> &RelayService {
        &self.inner.relays
    }

    fn inspector(&self) -> &Inspector {
        self.inner.relays.inspector()
    }

    /// Unclaimed entries, oldest first.
    pub async fn entries(&self) -> Vec<BufferedMeta> {
        let _state = self.inner.state.lock().await;
        self.inner.index.load()
    }

    pub fn is_buffered_dir(&self, dir: &Path) -> bool {
        is_subpath(dir, &self.inner.settings.root)
    }

    /// Scaffolds and installs the template unless its manifest already exists.
    /// Returns whether anything was created.
    pub async fn ensure_template(&self) -> Result<bool> {
        let settings = &self.inner.settings;
        let template = &settings.template;
        if template.join("package.json").is_file() {
            return Ok(false);
        }
        let parent = template
            .parent()
            .context("template path has no parent directory")?;
        let name = template
            .file_name()
            .context("template path has no directory name")?
            .to_string_lossy()
            .to_string();
        tokio::fs::create_dir_all(parent)
            .await
            .with_context(|| format!("failed to create {}", parent.display()))?;

        let scaffold = settings.scaffold.replace("{name}", &shell_words::quote(&name));
        let cmdline = shell_words::split(&scaffold)
            .map_err(|err| PoolError::Scaffold(format!("invalid scaffold command: {}", err)))?;
        tracing::info!(template = %template.display(), "scaffolding pool template");
        run_to_completion(&cmdline, parent, settings.scaffold_timeout)
            .await
            .map_err(|err| PoolError::Scaffold(format!("{:#}", err)))?;
        if !template.join("package.json").is_file() {
            return Err(PoolError::TemplateMissing {
                path: template.clone(),
            }
            .into());
        }

        let install = vec![settings.package_manager.clone(), "install".to_string()];
        run_to_completion(&install, template, settings.scaffold_timeout)
            .await
            .map_err(|err| PoolError::Scaffold(format!("{:#}", err)))?;
        tracing::info!(template = %template.display(), "pool template ready");
        Ok(true)
    }

    /// Clones the template, starts its relay on a free port and appends it to the index.
    ///
    /// Ok(None) means this entry could not be created (template missing, clone or start
    /// failure) and nothing was registered. An exhausted port range is an error.
    pub async fn create_buffered_project(
        &self,
        target_dir: Option<PathBuf>,
    ) -> Result<Option<BufferedMeta>, PoolError> {
        self.provision(target_dir, true).await
    }

    /// Builds one running project; `register` appends it to the index.
    async fn provision(
        &self,
        target_dir: Option<PathBuf>,
        register: bool,
    ) -> Result<Option<BufferedMeta>, PoolError> {
        let settings = &self.inner.settings;
        if !settings.template.join("package.json").is_file() {
            tracing::warn!(template = %settings.template.display(), "pool template missing; run `devrelay pool template`");
            return Ok(None);
        }
        let created_ms = now_millis();
        let id = created_ms.to_string();
        let dir = target_dir.unwrap_or_else(|| {
            settings
                .root
                .join(format!("inst-{}-{}", id, nanoid::nanoid!(8)))
        });
        if let Some(parent) = dir.parent() {
            if let Err(err) = tokio::fs::create_dir_all(parent).await {
                tracing::warn!(dir = %parent.display(), error = %err, "failed to create pool directory");
                return Ok(None);
            }
        }

        let port = self.reserve_port().await?;
        let meta = self.launch_entry(id, &dir, port).await;
        let mut state = self.inner.state.lock().await;
        if let Some(meta) = meta.as_ref().filter(|_| register) {
            let mut entries = self.inner.index.load();
            entries.push(meta.clone());
            if let Err(err) = self.inner.index.save(&entries) {
                tracing::warn!(index = %self.inner.index.path().display(), error = %err, "failed to persist pool index");
            }
        }
        state.reserved.remove(&port);
        Ok(meta)
    }

    async fn launch_entry(&self, id: String, dir: &Path, port: u16) -> Option<BufferedMeta> {
        let settings = &self.inner.settings;
        if let Err(err) = clone_dir(&settings.template, dir).await {
            tracing::warn!(dir = %dir.display(), error = %format!("{:#}", err), "failed to clone template");
            return None;
        }
        let options = StartOptions {
            port: Some(port),
            wait: ReadyWait::Immediate,
            echo: false,
            ..StartOptions::default()
        };
        let started = match self.inner.relays.start(dir, options).await {
            Ok(started) => started,
            Err(err) => {
                tracing::warn!(dir = %dir.display(), error = %err, "failed to start pool entry");
                let _ = tokio::fs::remove_dir_all(dir).await;
                return None;
            }
        };
        if !self
            .inspector()
            .wait_until_ready(port, settings.readiness_timeout)
            .await
        {
            tracing::debug!(port, "pool entry not answering yet; recording anyway");
        }

        let dir = tokio::fs::canonicalize(dir)
            .await
            .unwrap_or_else(|_| dir.to_path_buf());
        let meta = BufferedMeta {
            id,
            dir,
            pid: started.pid,
            port,
            created_at: now_millis(),
        };
        if let Err(err) = meta.write_entry_file() {
            tracing::warn!(error = %err, "failed to write pool entry metadata");
        }
        tracing::info!(dir = %meta.dir.display(), port, pid = meta.pid, "pool entry created");
        Some(meta)
    }

    /// Picks the first port from the configured range that nobody listens on, no entry
    /// records, and no in-flight creation holds.
    async fn reserve_port(&self) -> Result<u16, PoolError> {
        let settings = &self.inner.settings;
        let listening = self.inspector().listening_ports().await;
        let mut state = self.inner.state.lock().await;
        let indexed: HashSet<u16> = self.inner.index.load().iter().map(|m| m.port).collect();
        let base = settings.base_port;
        let last = base.saturating_add(settings.port_range.saturating_sub(1));
        // Port 0 would bind an ephemeral port and always look free.
        for port in base.max(1)..=last {
            if listening.contains(&port) || indexed.contains(&port) || state.reserved.contains(&port) {
                continue;
            }
            if !port_is_free(port) {
                continue;
            }
            state.reserved.insert(port);
            return Ok(port);
        }
        Err(PoolError::PortRangeExhausted { base, last })
    }

    /// Creates `count` entries one after another. Entries that fail are skipped.
    pub async fn seed(&self, count: usize) -> Result<Vec<BufferedMeta>, PoolError> {
        let mut created = Vec::with_capacity(count);
        for _ in 0..count {
            if let Some(meta) = self.create_buffered_project(None).await? {
                created.push(meta);
            }
        }
        Ok(created)
    }

    /// Seeds until the pool holds its configured size.
    pub async fn top_up(&self) -> Result<Vec<BufferedMeta>, PoolError> {
        let have = self.entries().await.len();
        let want = self.inner.settings.size.saturating_sub(have);
        if want == 0 {
            return Ok(Vec::new());
        }
        self.seed(want).await
    }

    /// Claims the oldest entry, or creates a project on demand when the pool is empty.
    pub async fn create(&self, options: CreateOptions) -> Result<ClaimOutcome> {
        let head = {
            let _state = self.inner.state.lock().await;
            let mut entries = self.inner.index.load();
            if entries.is_empty() {
                None
            } else {
                let first = entries.remove(0);
                self.inner.index.save(&entries)?;
                Some(first)
            }
        };

        let outcome = match head {
            Some(meta) => {
                tracing::info!(dir = %meta.dir.display(), port = meta.port, "claimed pool entry");
                ClaimOutcome { meta, hit: true }
            }
            None => {
                tracing::info!("pool empty; creating project on demand");
                let meta = self
                    .provision(options.target_dir.clone(), false)
                    .await?
                    .context("failed to create project on demand")?;
                ClaimOutcome { meta, hit: false }
            }
        };

        if options.replenish {
            let service = self.clone();
            tokio::spawn(async move {
                if let Err(err) = service.seed(1).await {
                    tracing::warn!(error = %err, "pool replenishment failed");
                }
            });
        }
        Ok(outcome)
    }

    /// Restarts every indexed entry whose dev server no longer answers, and drops entries
    /// whose directory is gone. Returns how many entries were restarted.
    pub async fn ensure_buffer_started(&self) -> Result<usize> {
        let entries = self.entries().await;
        let mut dropped = HashSet::new();
        let mut updated = HashMap::new();
        for mut meta in entries {
            if !meta.dir.is_dir() {
                tracing::info!(dir = %meta.dir.display(), "dropping pool entry with missing directory");
                dropped.insert(meta.id.clone());
                continue;
            }
            if BufferedMeta::read_entry_file(&meta.dir).is_some_and(|on_disk| on_disk.id != meta.id) {
                tracing::info!(dir = %meta.dir.display(), "dropping pool entry whose directory was reused");
                dropped.insert(meta.id.clone());
                continue;
            }
            if self
                .inspector()
                .probe_ready(meta.port, self.inner.probe.timeout)
                .await
            {
                continue;
            }
            let options = StartOptions {
                port: Some(meta.port),
                wait: ReadyWait::Immediate,
                echo: false,
                ..StartOptions::default()
            };
            match self.inner.relays.start(&meta.dir, options).await {
                Ok(started) => {
                    meta.pid = started.pid;
                    self.inspector()
                        .wait_until_ready(meta.port, self.inner.settings.readiness_timeout)
                        .await;
                    if let Err(err) = meta.write_entry_file() {
                        tracing::warn!(error = %err, "failed to write pool entry metadata");
                    }
                    tracing::info!(dir = %meta.dir.display(), pid = meta.pid, "pool entry restarted");
                    updated.insert(meta.id.clone(), meta);
                }
                Err(err) => {
                    tracing::warn!(dir = %meta.dir.display(), error = %err, "failed to restart pool entry");
                }
            }
        }

        let healed = updated.len();
        if !dropped.is_empty() || !updated.is_empty() {
            let _state = self.inner.state.lock().await;
            // Claims and seeds may have run meanwhile; merge into the current index.
            let merged = self
                .inner
                .index
                .load()
                .into_iter()
                .filter(|meta| !dropped.contains(&meta.id))
                .map(|meta| updated.remove(&meta.id).unwrap_or(meta))
                .collect::<Vec<_>>();
            self.inner.index.save(&merged)?;
        }
        Ok(healed)
    }

    /// Stops every pool process and deletes the pool root.
    pub async fn kill(&self) -> Result<()> {
        let root = &self.inner.settings.root;
        validate_pool_root(root, &self.inner.home)?;

        let canonical_root = tokio::fs::canonicalize(root)
            .await
            .unwrap_or_else(|_| root.clone());
        for (dir, _) in self.inner.relays.running().await {
            if dir.starts_with(&canonical_root) {
                self.inner.relays.stop(&dir).await;
            }
        }

        let _state = self.inner.state.lock().await;
        for meta in self.inner.index.load() {
            if pid_alive(meta.pid) {
                send_os_signal(meta.pid, ProcessSignal::SigKill);
            }
        }
        match tokio::fs::remove_dir_all(root).await {
            Ok(()) => {}
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
            Err(err) => {
                return Err(err).with_context(|| format!("failed to remove {}", root.display()));
            }
        }
        tracing::info!(root = %root.display(), "pool reset");
        Ok(())
    }

    /// Dev servers running under `dir`: listening ones with pool entries hidden, plus
    /// relays this host launched that have no listener yet.
    pub async fn running_projects(&self, dir: &Path, options: DetectOptions) -> Vec<RunningProject> {
        let root = &self.inner.settings.root;
        let listening = self
            .inspector()
            .listening_projects(dir, std::slice::from_ref(root), options)
            .await;
        let mut projects = Vec::new();
        for (relay_dir, pid) in self.inner.relays.running().await {
            if !is_subpath(&relay_dir, dir) || is_subpath(&relay_dir, root) {
                continue;
            }
            if listening.iter().any(|p| p.cwd.starts_with(&relay_dir)) {
                continue;
            }
            projects.push(RunningProject::Starting(StartingProject {
                cwd: relay_dir,
                pid,
                kind: DevServerKind::Unknown,
            }));
        }
        projects.extend(listening.into_iter().map(RunningProject::Listening));
        projects
    }
}

/// Refuses deletion roots that could take user data with them.
pub fn validate_pool_root(root: &Path, home: &Path) -> Result<(), PoolError> {
    let unsafe_root = |reason| PoolError::UnsafePoolRoot {
        path: root.to_path_buf(),
        reason,
    };
    if !root.is_absolute() {
        return Err(unsafe_root("not an absolute path"));
    }
    let resolved = std::fs::canonicalize(root).unwrap_or_else(|_| root.to_path_buf());
    if resolved.parent().is_none() {
        return Err(unsafe_root("is the filesystem root"));
    }
    let home = std::fs::canonicalize(home).unwrap_or_else(|_| home.to_path_buf());
    if home.starts_with(&resolved) {
        return Err(unsafe_root("is the home directory or contains it"));
    }
    let marked = resolved.join(INDEX_FILE).is_file() || resolved.join(CONTROL_SOCKET).exists();
    if resolved.is_dir() && !marked {
        let empty = std::fs::read_dir(&resolved)
            .map(|mut entries| entries.next().is_none())
            .unwrap_or(false);
        if !empty {
            return Err(unsafe_root("holds files but no pool index"));
        }
    }
    Ok(())
}

fn port_is_free(port: u16) -> bool {
    std::net::TcpListener::bind(("127.0.0.1", port)).is_ok()
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
