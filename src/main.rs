//! devrelay: dev server discovery, relaying and a warm project pool.
//!
//! This is the entry point. It parses command-line arguments, loads configuration,
//! initialises logging and dispatches to the inspector, relay, pool and indexer
//! services.

mod classify;
mod clone;
mod config;
mod control;
mod error;
mod events;
mod indexer;
mod inspector;
mod output;
mod pool;
mod pool_index;
mod process;
mod relay;
mod resolver;
mod runner;

use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::builder::styling::{AnsiColor, Effects, Style};
use clap::builder::Styles;
use clap::{Parser, Subcommand};
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use crate::config::{default_config_path, load_config, Config, Settings};
use crate::control::{control_socket_path, send_request, Request, Response};
use crate::error::RelayError;
use crate::events::ProcessSignal;
use crate::indexer::{index_projects, IndexOptions};
use crate::inspector::{DetectOptions, Inspector};
use crate::output::sanitize_text;
use crate::pool::BufferService;
use crate::pool_index::PoolIndex;
use crate::process::{LaunchState, ProjectLaunch};
use crate::relay::{ReadyWait, RelayService, StartOptions};
use crate::resolver::resolve_dev_command;

/// Command-line interface definition.
#[derive(Debug, Parser)]
#[command(
    name = "devrelay",
    version,
    about = "Find, relay and pre-warm local dev servers",
    styles = help_styles(),
    disable_help_subcommand = true
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
    /// Path to devrelay.toml configuration file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Log lifecycle events to stderr.
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// List dev servers listening under a directory.
    Ports {
        dir: PathBuf,
        /// Skip HTTP fingerprinting.
        #[arg(long)]
        no_http: bool,
        /// Per-probe timeout (ms).
        #[arg(long)]
        timeout_ms: Option<u64>,
        /// Hide servers running from pool entries.
        #[arg(long)]
        hide_buffered: bool,
        #[arg(long)]
        json: bool,
    },
    /// Fingerprint the dev server on a local port.
    Classify {
        port: String,
        #[arg(long)]
        timeout_ms: Option<u64>,
    },
    /// Show how a project's dev command would be launched.
    Resolve { dir: PathBuf },
    /// Discover runnable projects.
    Index {
        /// Defaults to the home directory.
        root: Option<PathBuf>,
        #[arg(long)]
        max_depth: Option<usize>,
        #[arg(long)]
        json: bool,
    },
    /// Run or talk to a relay.
    #[command(subcommand)]
    Relay(RelayCommand),
    /// Manage the warm project pool.
    #[command(subcommand)]
    Pool(PoolCommand),
}

#[derive(Debug, Subcommand)]
enum RelayCommand {
    /// Start a relay in the foreground; Ctrl-C stops it.
    Run {
        dir: PathBuf,
        #[arg(long)]
        port: Option<u16>,
    },
    /// Stream a running relay's output.
    Attach {
        dir: PathBuf,
        #[arg(long)]
        strip_ansi: bool,
    },
    /// Ask a running relay to stop its dev server.
    Kill { dir: PathBuf },
}

#[derive(Debug, Subcommand)]
enum PoolCommand {
    /// Host the pool: heal, top up and accept control requests.
    Serve,
    /// Scaffold the template project if it is missing.
    Template,
    /// Show unclaimed entries.
    List {
        #[arg(long)]
        json: bool,
    },
    /// Claim the oldest entry (needs `pool serve`).
    Claim {
        /// Directory for an on-demand project when the pool is empty.
        #[arg(long)]
        target: Option<PathBuf>,
    },
    /// Add entries (needs `pool serve`).
    Seed { count: usize },
    /// Dev servers running or starting under a directory, pool entries hidden (needs `pool serve`).
    Running {
        dir: PathBuf,
        #[arg(long)]
        json: bool,
    },
    /// Stop every entry and delete the pool root.
    Reset,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    let settings = load_settings(cli.config.as_deref())?;

    match cli.command {
        Commands::Ports {
            dir,
            no_http,
            timeout_ms,
            hide_buffered,
            json,
        } => {
            let options = DetectOptions {
                http: !no_http,
                timeout: timeout_ms
                    .map(Duration::from_millis)
                    .unwrap_or(settings.probe.timeout),
            };
            let inspector = Inspector::new()?;
            let mut servers = inspector.detect_servers_for_directory(&dir, options).await;
            if hide_buffered {
                let pool = build_pool(&settings)?;
                servers.retain(|s| !pool.is_buffered_dir(&s.cwd));
            }
            if json {
                print_json(&servers)?;
            } else {
                for s in &servers {
                    println!("{:<6} {:<8} {:<19} {}", s.port, s.pid, s.kind, s.cwd.display());
                }
            }
        }
        Commands::Classify { port, timeout_ms } => {
            let timeout = timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(settings.probe.timeout);
            let port = classify::parse_port(&port).map(i64::from).unwrap_or(0);
            let kind = Inspector::new()?.classify_port(port, timeout).await;
            println!("{}", kind);
        }
        Commands::Resolve { dir } => {
            print_json(&resolve_dev_command(&dir, &settings.relay.package_manager))?;
        }
        Commands::Index {
            root,
            max_depth,
            json,
        } => {
            let root = match root {
                Some(root) => root,
                None => home_dir()?,
            };
            let mut options = IndexOptions::new(&settings.index, &settings.pool.root);
            if let Some(depth) = max_depth {
                options.max_depth = depth;
            }
            let projects = index_projects(&root, &options).await?;
            if json {
                print_json(&projects)?;
            } else {
                for p in &projects {
                    println!(
                        "{}  [{}]  {}",
                        p.path.display(),
                        p.tags.join(","),
                        p.package_manager.as_str()
                    );
                }
            }
        }
        Commands::Relay(command) => run_relay_command(command, &settings).await?,
        Commands::Pool(command) => run_pool_command(command, &settings).await?,
    }
    Ok(())
}

async fn run_relay_command(command: RelayCommand, settings: &Settings) -> Result<()> {
    match command {
        RelayCommand::Run { dir, port } => {
            let relays = RelayService::new(Inspector::new()?, settings.relay.clone(), settings.probe);
            let cancel = CancellationToken::new();
            spawn_signal_listener(cancel.clone());

            let (event_tx, mut event_rx) = mpsc::channel(16);
            let mut watcher = tokio::spawn(async move {
                let mut launch = ProjectLaunch::new();
                while let Some(event) = event_rx.recv().await {
                    if !launch.apply(&event) {
                        continue;
                    }
                    if let Some(project) = launch.current() {
                        tracing::debug!(project = %project.identity(), "launch state changed");
                    }
                    match launch.state() {
                        LaunchState::Starting(p) => eprintln!("starting (pid {})", p.pid),
                        LaunchState::Listening(p) => {
                            eprintln!("listening on http://127.0.0.1:{} ({})", p.port, p.kind)
                        }
                        LaunchState::Stopped { code } => {
                            eprintln!("exited ({})", code.map(|c| c.to_string()).unwrap_or_else(|| "signal".into()));
                            return *code;
                        }
                        LaunchState::Absent => {}
                    }
                }
                None
            });

            let options = StartOptions {
                port,
                wait: ReadyWait::NewListener,
                echo: true,
                events: Some(event_tx),
                cancel: cancel.clone(),
            };
            match relays.start(&dir, options).await {
                Ok(started) => {
                    tracing::info!(socket = %started.socket_path.display(), "relay ready");
                }
                Err(RelayError::Cancelled { .. }) => return Ok(()),
                Err(err) => return Err(err.into()),
            }
            tokio::select! {
                _ = cancel.cancelled() => {
                    relays.stop(&dir).await;
                    let _ = watcher.await;
                }
                code = &mut watcher => {
                    if let Ok(Some(code)) = code {
                        if code != 0 {
                            bail!("dev server exited with code {}", code);
                        }
                    }
                }
            }
        }
        RelayCommand::Attach { dir, strip_ansi } => {
            let mut first = true;
            let mut connection = relay::connect(&dir, move |chunk| {
                let mut data: &[u8] = &chunk;
                if first {
                    first = false;
                    data = data.strip_prefix(relay::ACK).unwrap_or(data);
                }
                let mut stdout = std::io::stdout();
                let _ = stdout.write_all(sanitize_text(data, strip_ansi).as_bytes());
                let _ = stdout.flush();
            })
            .await?;
            tokio::select! {
                _ = connection.closed() => {}
                _ = tokio::signal::ctrl_c() => connection.close().await,
            }
        }
        RelayCommand::Kill { dir } => {
            if let Err(err) = relay::request_kill(&dir).await {
                if !relay::signal_recorded_pid(&dir, ProcessSignal::SigTerm) {
                    return Err(err);
                }
                tracing::warn!(dir = %dir.display(), "relay socket unreachable; signalled recorded pid");
            }
        }
    }
    Ok(())
}

async fn run_pool_command(command: PoolCommand, settings: &Settings) -> Result<()> {
    let socket = control_socket_path(&settings.pool.root);
    match command {
        PoolCommand::Serve => {
            let pool = build_pool(settings)?;
            pool.ensure_template().await?;
            let healed = pool.ensure_buffer_started().await?;
            if healed > 0 {
                tracing::info!(healed, "restarted pool entries");
            }

            let cancel = CancellationToken::new();
            spawn_signal_listener(cancel.clone());
            let filler = pool.clone();
            tokio::spawn(async move {
                match filler.top_up().await {
                    Ok(created) => tracing::info!(created = created.len(), "pool topped up"),
                    Err(err) => tracing::warn!(error = %err, "failed to top up pool"),
                }
            });

            eprintln!("pool host listening on {}", socket.display());
            let served = control::serve(pool.clone(), socket, cancel).await;
            pool.relays().stop_all().await;
            served?;
        }
        PoolCommand::Template => {
            let pool = build_pool(settings)?;
            if pool.ensure_template().await? {
                println!("created {}", settings.pool.template.display());
            } else {
                println!("template already present at {}", settings.pool.template.display());
            }
        }
        PoolCommand::List { json } => {
            let entries = PoolIndex::new(&settings.pool.root).load();
            if json {
                print_json(&entries)?;
            } else {
                for e in &entries {
                    println!("{:<6} {:<8} {}", e.port, e.pid, e.dir.display());
                }
            }
        }
        PoolCommand::Claim { target } => {
            // The host resolves paths against its own cwd, not ours.
            let target = match target {
                Some(target) => Some(absolutize(target, &std::env::current_dir()?)),
                None => None,
            };
            let response = send_request(&socket, &Request::Claim { target }).await?;
            match expect_ok(response)? {
                Response::Claimed { meta, hit } => {
                    #[derive(Serialize)]
                    struct Claimed<'a> {
                        meta: &'a pool_index::BufferedMeta,
                        hit: bool,
                    }
                    print_json(&Claimed { meta: &meta, hit })?;
                }
                other => bail!("unexpected response from pool host: {:?}", other),
            }
        }
        PoolCommand::Seed { count } => {
            let response = send_request(&socket, &Request::Seed { count }).await?;
            match expect_ok(response)? {
                Response::Seeded { entries } => print_json(&entries)?,
                other => bail!("unexpected response from pool host: {:?}", other),
            }
        }
        PoolCommand::Running { dir, json } => {
            let dir = absolutize(dir, &std::env::current_dir()?);
            let response = send_request(&socket, &Request::Running { dir }).await?;
            match expect_ok(response)? {
                Response::Running { projects } if json => print_json(&projects)?,
                Response::Running { projects } => {
                    for p in &projects {
                        println!("{:<8} {:<32} {}", p.pid(), p.identity(), p.cwd().display());
                    }
                }
                other => bail!("unexpected response from pool host: {:?}", other),
            }
        }
        PoolCommand::Reset => {
            if socket.exists() {
                if let Ok(response) = send_request(&socket, &Request::Reset).await {
                    expect_ok(response)?;
                    return Ok(());
                }
            }
            build_pool(settings)?.kill().await?;
        }
    }
    Ok(())
}

fn expect_ok(response: Response) -> Result<Response> {
    match response {
        Response::Error { message } => bail!("{}", message),
        other => Ok(other),
    }
}

fn build_pool(settings: &Settings) -> Result<BufferService> {
    let relays = RelayService::new(Inspector::new()?, settings.relay.clone(), settings.probe);
    Ok(BufferService::new(
        relays,
        settings.pool.clone(),
        settings.probe,
        home_dir()?,
    ))
}

fn home_dir() -> Result<PathBuf> {
    dirs::home_dir().context("could not determine the home directory")
}

fn absolutize(path: PathBuf, cwd: &Path) -> PathBuf {
    if path.is_absolute() {
        path
    } else {
        cwd.join(path)
    }
}

fn load_settings(path: Option<&Path>) -> Result<Settings> {
    let config = match path.map(Path::to_path_buf).or_else(default_config_path) {
        Some(path) => load_config(&path)?,
        None => Config::default(),
    };
    Settings::resolve(&config, &home_dir()?)
}

fn init_tracing(verbose: bool) {
    let fallback = if verbose { "info" } else { "warn" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(fallback));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .try_init();
}

fn print_json<T: Serialize + ?Sized>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Cancels `token` on Ctrl-C or SIGTERM.
fn spawn_signal_listener(token: CancellationToken) {
    tokio::spawn(async move {
        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};
            let mut sigterm = match signal(SignalKind::terminate()) {
                Ok(signal) => signal,
                Err(_) => {
                    let _ = tokio::signal::ctrl_c().await;
                    token.cancel();
                    return;
                }
            };
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = sigterm.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            let _ = tokio::signal::ctrl_c().await;
        }
        token.cancel();
    });
}

fn help_styles() -> Styles {
    Styles::styled()
        .header(
            Style::new()
                .fg_color(Some(AnsiColor::Cyan.into()))
                .effects(Effects::BOLD),
        )
        .usage(
            Style::new()
                .fg_color(Some(AnsiColor::Green.into()))
                .effects(Effects::BOLD),
        )
        .literal(Style::new().fg_color(Some(AnsiColor::Yellow.into())))
        .placeholder(Style::new().fg_color(Some(AnsiColor::Magenta.into())))
        .valid(Style::new().fg_color(Some(AnsiColor::Green.into())))
        .invalid(
            Style::new()
                .fg_color(Some(AnsiColor::Red.into()))
                .effects(Effects::BOLD),
        )
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_nested_pool_and_relay_commands() {
        let cli = Cli::try_parse_from(["devrelay", "pool", "claim", "--target", "/tmp/app"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Pool(PoolCommand::Claim { target: Some(_) })
        ));

        let cli = Cli::try_parse_from(["devrelay", "-v", "relay", "run", "/tmp/app", "--port", "5190"]).unwrap();
        assert!(cli.verbose);
        match cli.command {
            Commands::Relay(RelayCommand::Run { dir, port }) => {
                assert_eq!(dir, PathBuf::from("/tmp/app"));
                assert_eq!(port, Some(5190));
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn pool_running_takes_a_directory() {
        let cli = Cli::try_parse_from(["devrelay", "pool", "running", "apps", "--json"]).unwrap();
        match cli.command {
            Commands::Pool(PoolCommand::Running { dir, json }) => {
                assert_eq!(dir, PathBuf::from("apps"));
                assert!(json);
            }
            other => panic!("unexpected command {:?}", other),
        }
    }

    #[test]
    fn claim_target_is_resolved_against_caller_cwd() {
        let cwd = Path::new("/home/dev/projects");
        assert_eq!(
            absolutize(PathBuf::from("myapp"), cwd),
            PathBuf::from("/home/dev/projects/myapp")
        );
        assert_eq!(absolutize(PathBuf::from("/srv/app"), cwd), PathBuf::from("/srv/app"));
    }

    #[test]
    fn classify_accepts_unparseable_port_text() {
        let cli = Cli::try_parse_from(["devrelay", "classify", "NaN"]).unwrap();
        assert!(matches!(cli.command, Commands::Classify { .. }));
        assert!(Cli::try_parse_from(["devrelay", "pool", "seed", "many"]).is_err());
    }

    #[test]
    fn explicit_config_path_is_loaded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("devrelay.toml");
        std::fs::write(&path, "[pool]\nsize = 5\n").unwrap();
        let settings = load_settings(Some(&path)).unwrap();
        assert_eq!(settings.pool.size, 5);
        assert!(load_settings(Some(&dir.path().join("missing.toml"))).is_err());
    }
}
