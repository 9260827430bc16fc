//! `skylink` – operator console for the device-control link.
//!
//! 1. Initialises tracing (see [`telemetry`]).
//! 2. Loads `~/.skylink/config.toml`, writing the defaults on first run.
//! 3. Connects a [`DeviceLink`] and prints connection state changes.
//! 4. Drops the user into an **interactive REPL** (`/help` lists commands).
//! 5. Intercepts **Ctrl-C** to shut the link down before exiting.

mod config;
mod repl;
mod telemetry;

use colored::Colorize;
use skylink_middleware::{DeviceLink, LogMiddleware};
use skylink_transport::{EventKind, TransportEvent};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{error, warn};

fn main() {
    let _telemetry = telemetry::init_tracing("skylink");

    print_banner();

    // ── Configuration ─────────────────────────────────────────────────────
    let cfg = match config::load() {
        Ok(Some(cfg)) => {
            println!(
                "  Config loaded from {}",
                config::config_path().display().to_string().bold()
            );
            cfg
        }
        Ok(None) => first_run(),
        Err(e) => {
            println!("{}: {}", "Config error".red(), e);
            println!("  Using default configuration.");
            let mut cfg = config::Config::default();
            config::apply_env_overrides(&mut cfg);
            cfg
        }
    };

    let bus_cfg = match cfg.bus_config() {
        Ok(bus_cfg) => bus_cfg,
        Err(e) => {
            println!("{}: {} – using defaults", "Config error".red(), e);
            skylink_middleware::BusConfig::default()
        }
    };

    // ── Runtime + link ────────────────────────────────────────────────────
    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            error!(error = %e, "failed to start the Tokio runtime");
            std::process::exit(1);
        }
    };

    println!("  Connecting to {} …", cfg.transport.url.bold());
    let log_level = bus_cfg.log_level;
    let link = runtime.block_on(async move {
        let link = DeviceLink::connect(cfg.transport_config(), bus_cfg);
        link.bus().use_middleware(LogMiddleware::new(log_level));
        link.transport().on(EventKind::StateChange, |event: &TransportEvent| {
            if let TransportEvent::StateChange(state) = event {
                println!("\n  {} connection {}", "●".cyan(), state.to_string().bold());
            }
        });
        link.transport().on(EventKind::Reconnect, |event: &TransportEvent| {
            if let TransportEvent::Reconnect(attempt) = event {
                println!("\n  {} reconnect attempt {}", "↻".yellow(), attempt);
            }
        });
        link
    });

    // ── Ctrl-C handler ────────────────────────────────────────────────────
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_flag = shutdown.clone();
    let ctrlc_link = link.clone();
    if let Err(e) = ctrlc::set_handler(move || {
        println!();
        println!("{}", "⚠  Ctrl-C received – shutting down …".yellow().bold());
        ctrlc_link.shutdown();
        println!("{}", "  ✓ Connection closed. Press Enter to exit.".green());
        shutdown_flag.store(true, Ordering::SeqCst);
    }) {
        warn!(error = %e, "Failed to install Ctrl-C handler; graceful shutdown on Ctrl-C will not be available");
    }

    println!();
    println!("  Type {} for a list of commands.\n", "/help".bold().cyan());

    // ── Interactive REPL ──────────────────────────────────────────────────
    repl::run(link, runtime.handle().clone(), shutdown);
}

/// Write the default config so the operator has a file to edit.
fn first_run() -> config::Config {
    let cfg = config::Config::default();
    match config::save(&cfg) {
        Ok(()) => println!(
            "  {} Default config written to {}",
            "✓".green().bold(),
            config::config_path().display().to_string().bold()
        ),
        Err(e) => println!("{}: {}", "Error saving config".red(), e),
    }
    let mut cfg = cfg;
    config::apply_env_overrides(&mut cfg);
    cfg
}

fn print_banner() {
    println!();
    println!("{}", r#"   _____ __         __    _       __  "#.bold().cyan());
    println!("{}", r#"  / ___// /____  __/ /   (_)___  / /__"#.bold().cyan());
    println!("{}", r#"  \__ \/ //_/ / / / /   / / __ \/ //_/"#.bold().cyan());
    println!("{}", r#" ___/ / ,< / /_/ / /___/ / / / / ,<   "#.bold().cyan());
    println!("{}", r#"/____/_/|_|\__, /_____/_/_/ /_/_/|_|  "#.bold().cyan());
    println!("{}", r#"          /____/                      "#.bold().cyan());
    println!();
    println!(
        "  {} {}",
        "SkyLink".bold(),
        format!("v{}", env!("CARGO_PKG_VERSION")).dimmed()
    );
    println!("  Observatory device link console");
    println!();
}
