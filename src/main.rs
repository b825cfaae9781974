//! craft-router binary entry point
//!
//! ```bash
//! # Run with the default config path (seeded on first start)
//! craft-router
//!
//! # Run against a specific working directory and config
//! craft-router -w /srv/minecraft -c router.yml -e dev
//!
//! # Print the license or version
//! craft-router license
//! craft-router version
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use craft_router::config::{load_config, seed_default_config, ConfigWatcher};
use craft_router::event::EventBus;
use craft_router::plugin::{PluginApi, PluginManager};
use craft_router::proxy::ProxySet;
use craft_router::VERSION;

const LICENSE_TEXT: &str = include_str!("../LICENSE");

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    Run,
    License,
    Version,
}

struct Args {
    command: Command,
    working_dir: PathBuf,
    environment: String,
    config_path: PathBuf,
}

impl Args {
    fn parse() -> Result<Self> {
        let mut command = Command::Run;
        let mut working_dir = PathBuf::from(".");
        let mut environment = String::from("prod");
        let mut config_path = PathBuf::from("config.yml");

        let mut args = std::env::args().skip(1);
        while let Some(arg) = args.next() {
            match arg.as_str() {
                "license" => command = Command::License,
                "version" => command = Command::Version,
                "-w" | "--working-dir" => {
                    working_dir = PathBuf::from(
                        args.next().context("missing value for --working-dir")?,
                    );
                }
                "-e" | "--environment" => {
                    environment = args.next().context("missing value for --environment")?;
                }
                "-c" | "--config" => {
                    config_path =
                        PathBuf::from(args.next().context("missing value for --config")?);
                }
                "-h" | "--help" => {
                    print_help();
                    std::process::exit(0);
                }
                "-v" | "--version" => command = Command::Version,
                other => {
                    eprintln!("Unknown argument: {other}");
                    print_help();
                    std::process::exit(2);
                }
            }
        }

        if environment != "dev" && environment != "prod" {
            bail!("unsupported environment '{environment}', expected dev or prod");
        }

        Ok(Self {
            command,
            working_dir,
            environment,
            config_path,
        })
    }
}

fn print_help() {
    println!(
        r#"craft-router v{VERSION}

Reverse proxy and host-based router for Minecraft Java and Bedrock servers.

USAGE:
    craft-router [COMMAND] [OPTIONS]

COMMANDS:
    (none)     Run the proxy
    license    Print the license text
    version    Print the version

OPTIONS:
    -w, --working-dir <DIR>    Working directory (default: .)
    -e, --environment <ENV>    dev or prod, selects logger verbosity (default: prod)
    -c, --config <FILE>        Configuration file (default: config.yml)
    -h, --help                 Print this help
    -v, --version              Print the version"#
    );
}

fn init_tracing(environment: &str) {
    let default_filter = if environment == "dev" {
        "debug,craft_router=debug"
    } else {
        "info"
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if environment == "dev" {
        let _ = builder.pretty().try_init();
    } else {
        let _ = builder.compact().try_init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse()?;
    match args.command {
        Command::License => {
            println!("{LICENSE_TEXT}");
            return Ok(());
        }
        Command::Version => {
            println!("craft-router v{VERSION}");
            return Ok(());
        }
        Command::Run => {}
    }

    init_tracing(&args.environment);

    std::env::set_current_dir(&args.working_dir).with_context(|| {
        format!("changing working directory to {}", args.working_dir.display())
    })?;

    if seed_default_config(&args.config_path)? {
        info!(path = %args.config_path.display(), "wrote default configuration");
    }

    let config = load_config(&args.config_path)
        .with_context(|| format!("loading {}", args.config_path.display()))?;

    let bus = EventBus::new();
    let proxies = Arc::new(ProxySet::new(bus.clone()));

    let mut plugins = PluginManager::with_builtin(PluginApi::new(bus.clone(), proxies.clone()));
    info!("loading plugins");
    plugins.load_all(&config).await.context("loading plugins")?;

    info!("starting proxies");
    proxies
        .apply_config(&config)
        .await
        .context("starting proxies")?;

    info!("enabling plugins");
    plugins.enable_all().await.context("enabling plugins")?;

    let mut drain_timeout = config.drain_timeout();
    let mut watcher = match ConfigWatcher::new(&args.config_path) {
        Ok(w) => Some(w),
        Err(e) => {
            warn!(error = %e, "config watching disabled");
            None
        }
    };

    let mut sigterm = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
    info!(config = %args.config_path.display(), "craft-router running");

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupt received, shutting down");
                break;
            }
            _ = sigterm.recv() => {
                info!("termination requested, shutting down");
                break;
            }
            changed = watch_changes(watcher.as_mut()) => {
                if !changed {
                    // Watcher died; keep serving without hot reload.
                    watcher = None;
                    continue;
                }
                match load_config(&args.config_path) {
                    Ok(new_config) => {
                        drain_timeout = new_config.drain_timeout();
                        proxies.reload(&new_config).await;
                        plugins.reload_all(&new_config).await;
                    }
                    Err(e) => {
                        error!(error = %e, "ignoring config change, keeping previous configuration");
                    }
                }
            }
        }
    }

    proxies.shutdown(drain_timeout).await;
    plugins.disable_all().await;
    info!("shutdown complete");
    Ok(())
}

/// Resolve the next watcher event, or pend forever when watching is
/// disabled so the select arm never fires.
async fn watch_changes(watcher: Option<&mut ConfigWatcher>) -> bool {
    match watcher {
        Some(w) => w.changed().await.is_some(),
        None => std::future::pending().await,
    }
}
