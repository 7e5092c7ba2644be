// SPDX-License-Identifier: GPL-3.0-or-later
// Copyright (C) 2026 Mark Wells <contact@markwells.dev>

//! langfleet: runs a fleet of language servers and talks to them as one.
//!
//! `serve` keeps every configured server alive until Ctrl-C, `doctor` reports
//! which servers come up, and `query` asks every ready server the same
//! question and prints the first answer.

#![allow(clippy::print_stdout, reason = "CLI tool needs to output to stdout")]

use anyhow::{Context, Result, anyhow, bail};
use clap::{Parser, Subcommand};
use serde_json::{Value, json};
use std::cell::RefCell;
use std::path::PathBuf;
use std::rc::Rc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use langfleet::cli::{self, ColorConfig};
use langfleet::config::Config;
use langfleet::lsp::{
    Client, ClientId, ClientManager, ClientSettings, ManagerEvent, ResponseResult, StdioTransport,
};

/// How long `doctor` waits for servers to come up.
const DOCTOR_WAIT: Duration = Duration::from_secs(10);

/// Command-line arguments for langfleet.
#[derive(Parser, Debug)]
#[command(name = "langfleet")]
#[command(about = "Run several language servers as one fleet")]
#[command(version = env!("LANGFLEET_VERSION"))]
struct Args {
    /// The subcommand to run.
    #[command(subcommand)]
    command: Option<Command>,

    /// LSP servers to spawn in "name:command" format (e.g., "rust:rust-analyzer").
    /// Can be specified multiple times. These override/append to the config file.
    #[arg(short, long = "lsp", global = true)]
    lsps: Vec<String>,

    /// Path to configuration file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Workspace root announced to every server (default: current directory).
    #[arg(short, long, global = true)]
    root: Option<PathBuf>,
}

/// Subcommands supported by langfleet.
#[derive(Subcommand, Debug)]
enum Command {
    /// Keep the fleet running until interrupted (default if no subcommand given).
    Serve,

    /// Start every server and report which ones become ready.
    Doctor {
        /// Disable colored output.
        #[arg(long)]
        nocolor: bool,
    },

    /// Send one request to every ready server and print the first answer.
    Query {
        /// LSP method, e.g. "workspace/symbol".
        method: String,

        /// Request parameters as JSON (default: `{}`).
        params: Option<String>,

        /// Seconds to wait for servers and for the answer.
        #[arg(long, default_value_t = 10)]
        timeout: u64,
    },
}

/// Entry point for the langfleet binary.
///
/// # Errors
///
/// Returns an error if the subcommand fails.
#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let default_level = match args.command {
        None | Some(Command::Serve) => "langfleet=info",
        Some(_) => "langfleet=warn",
    };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(default_level.parse()?))
        .with_writer(std::io::stderr)
        .init();

    let (config, root) = load_config(&args)?;

    match args.command {
        None | Some(Command::Serve) => run_server(&config, root).await,
        Some(Command::Doctor { nocolor }) => run_doctor(&config, root, args.config, nocolor).await,
        Some(Command::Query {
            method,
            params,
            timeout,
        }) => {
            run_query(
                &config,
                root,
                &method,
                params.as_deref(),
                Duration::from_secs(timeout),
            )
            .await
        }
    }
}

/// Loads configuration, merges `--lsp` servers and resolves the root.
fn load_config(args: &Args) -> Result<(Config, PathBuf)> {
    let mut config = Config::load(args.config.clone())?;
    for spec in &args.lsps {
        config.add_server_spec(spec)?;
    }

    let root = args
        .root
        .clone()
        .unwrap_or_else(|| PathBuf::from("."))
        .canonicalize()
        .context("Failed to resolve workspace root")?;

    Ok((config, root))
}

/// Builds one client per configured server, in name order.
fn build_clients(config: &Config, root: &std::path::Path) -> Vec<Client> {
    config
        .server
        .iter()
        .map(|(name, server)| {
            let transport = StdioTransport::new(&server.command, server.args.clone())
                .with_working_dir(root.to_path_buf());
            let settings = ClientSettings {
                root: root.to_path_buf(),
                initialization_options: server.initialization_options.clone(),
                restart_budget: config.restart_budget,
            };
            Client::new(name, Box::new(transport), settings)
        })
        .collect()
}

/// Starts the fleet for `config` and returns the running manager.
fn start_fleet(config: &Config, root: &std::path::Path) -> ClientManager {
    let mut manager = ClientManager::new(config.lifecycle());
    for client in build_clients(config, root) {
        manager.start_client(client);
    }
    manager
}

/// Runs the graceful shutdown sequence to completion.
async fn stop_fleet(manager: &mut ClientManager) {
    manager.shutdown();
    manager
        .run_until(ClientManager::is_shutdown_finished)
        .await;
}

/// Runs the fleet until Ctrl-C or until every server is retired.
///
/// # Errors
///
/// Returns an error if the signal handler cannot be installed.
async fn run_server(config: &Config, root: PathBuf) -> Result<()> {
    if config.server.is_empty() {
        warn!("No language servers configured");
        return Ok(());
    }

    info!("Starting langfleet");
    info!("Workspace root: {}", root.display());

    let mut manager = start_fleet(config, &root);
    manager.subscribe(|event| {
        if let ManagerEvent::RestartScheduled { name, delay, .. } = event {
            info!("{} will be restarted in {}s", name, delay.as_secs());
        }
    });

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        if manager.clients().is_empty() {
            warn!("Every language server has been retired");
            break;
        }
        tokio::select! {
            res = &mut ctrl_c => {
                res.context("Failed to listen for Ctrl-C")?;
                info!("Received shutdown signal");
                break;
            }
            () = manager.process_next() => {}
        }
    }

    info!("Shutting down language servers");
    stop_fleet(&mut manager).await;
    Ok(())
}

/// Reports which configured servers become ready.
///
/// # Errors
///
/// Returns an error if printing fails.
async fn run_doctor(
    config: &Config,
    root: PathBuf,
    config_path: Option<PathBuf>,
    nocolor: bool,
) -> Result<()> {
    let colors = ColorConfig::new(nocolor);

    println!("langfleet {}", env!("LANGFLEET_VERSION"));
    println!();

    let config_source =
        config_path.map_or_else(|| "default paths".to_string(), |p| p.display().to_string());
    println!("{} {}", colors.bold("Config:"), config_source);
    println!("{} {}", colors.bold("Root:  "), root.display());
    println!();

    if config.server.is_empty() {
        println!("No language servers configured.");
        return Ok(());
    }

    let mut manager = start_fleet(config, &root);
    if tokio::time::timeout(DOCTOR_WAIT, manager.run_until(ClientManager::is_settled))
        .await
        .is_err()
    {
        warn!("Some servers did not settle within {}s", DOCTOR_WAIT.as_secs());
    }

    let name_width = config.server.keys().map(String::len).max().unwrap_or(10);
    let cmd_width = (cli::terminal_width() / 3).max(12);

    for (name, server) in &config.server {
        let name_display = format!("{name:<name_width$}");
        let cmd_display = format!(
            "{:<cmd_width$}",
            cli::truncate(&server.command, cmd_width)
        );

        let Some(client) = manager.clients().iter().find(|c| c.name() == name) else {
            println!(
                "{}  {}  {}",
                name_display,
                cmd_display,
                colors.red("✗ failed"),
            );
            continue;
        };

        if !client.reachable() {
            println!(
                "{}  {}  {}",
                name_display,
                cmd_display,
                colors.yellow(&format!("… {}", client.state())),
            );
            continue;
        }

        println!("{}  {}  {}", name_display, cmd_display, colors.green("✓ ready"));
        if let Some(caps) = client.capabilities() {
            let names = cli::capability_names(caps);
            if !names.is_empty() {
                println!(
                    "{}  {}",
                    " ".repeat(name_width + cmd_width + 4),
                    colors.dim(&names.join(" ")),
                );
            }
        }
    }

    stop_fleet(&mut manager).await;
    Ok(())
}

/// Sends one exclusive request and prints the first answer as JSON.
///
/// # Errors
///
/// Returns an error if the parameters are not JSON, no server is ready, the
/// answer is an error, or nothing arrives in time.
async fn run_query(
    config: &Config,
    root: PathBuf,
    method: &str,
    params: Option<&str>,
    timeout: Duration,
) -> Result<()> {
    let params: Value = params
        .map(serde_json::from_str)
        .transpose()
        .context("Request parameters must be JSON")?
        .unwrap_or_else(|| json!({}));

    let mut manager = start_fleet(config, &root);
    // Servers that are still starting when the wait ends are simply not asked.
    if tokio::time::timeout(timeout, manager.run_until(ClientManager::is_settled))
        .await
        .is_err()
    {
        warn!("Some servers did not settle within {}s", timeout.as_secs());
    }

    let answer: Rc<RefCell<Option<(ClientId, ResponseResult)>>> = Rc::default();
    let slot = answer.clone();
    let Some(id) = manager.request_exclusive(method, &params, move |from, result| {
        *slot.borrow_mut() = Some((from, result));
    }) else {
        stop_fleet(&mut manager).await;
        bail!("No language server is ready to answer {method}");
    };

    let waited = tokio::time::timeout(
        timeout,
        manager.run_until(|m| answer.borrow().is_some() || !m.is_exclusive_pending(&id)),
    )
    .await;

    let answer = answer.borrow_mut().take();
    let responder = answer
        .as_ref()
        .and_then(|(from, _)| manager.client(*from))
        .map(|c| c.name().to_string());
    stop_fleet(&mut manager).await;

    match answer {
        Some((_, Ok(result))) => {
            info!(
                "{} answered first",
                responder.as_deref().unwrap_or("unknown server")
            );
            println!("{}", serde_json::to_string_pretty(&result)?);
            Ok(())
        }
        Some((_, Err(error))) => Err(anyhow!(
            "{} failed {method}: {error}",
            responder.as_deref().unwrap_or("server")
        )),
        None if waited.is_err() => bail!("No answer to {method} within {}s", timeout.as_secs()),
        None => bail!("Every server asked for {method} went away"),
    }
}
