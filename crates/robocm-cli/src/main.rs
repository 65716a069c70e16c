//! `robocm` – robot context manager daemon and console.
//!
//! This binary wires the whole stack together and gives the operator a
//! shell on it:
//!
//! 1. Installs tracing (console plus optional OTLP export).
//! 2. Loads `~/.robocm/config.toml` (or the path given as the first
//!    argument), applying `ROBOCM_*` environment overrides.
//! 3. Opens the knowledge base, builds the perception pipeline and starts the
//!    dispatch loops and the WebSocket broker bridge.
//! 4. Drops the operator into an **interactive console** with slash-commands
//!    (`/notify`, `/query`, `/stats`, `/window`, `/rules`, `/help`).
//! 5. Intercepts **Ctrl-C** to publish a shutdown alert and exit.

mod config;
mod repl;

use colored::Colorize;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tracing::{error, info, warn};

use robocm_memory::{Gateway, SqliteTripleStore};
use robocm_middleware::{EventBus, WsBridge, query};
use robocm_perception::Normalizer;
use robocm_runtime::{DispatchBridge, PerceptionPipeline};
use robocm_types::{CmError, alert};

/// Requests buffered between the broker bridge and the query loop.
const QUERY_QUEUE: usize = 64;

/// How long connected clients get to receive the shutdown alert.
const SHUTDOWN_GRACE: Duration = Duration::from_millis(250);

fn main() {
    let _telemetry = robocm_runtime::init_tracing("robocm");

    print_banner();

    let path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(config::config_path);
    let cfg = match config::load(&path) {
        Ok(cfg) => {
            println!("  Config loaded from {}", path.display().to_string().bold());
            cfg
        }
        Err(e) => {
            println!("{}: {}", "Config error".red(), e);
            std::process::exit(2);
        }
    };

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            println!("{}: {}", "Failed to start async runtime".red(), e);
            std::process::exit(1);
        }
    };

    let console = match runtime.block_on(start(&cfg)) {
        Ok(console) => console,
        Err(e) => {
            println!("{}: {}", "Startup failed".red(), e);
            std::process::exit(1);
        }
    };

    // ── Shared shutdown flag ──────────────────────────────────────────────
    let shutdown = Arc::new(AtomicBool::new(false));
    let shutdown_clone = shutdown.clone();
    let bus_ctrlc_ref = Arc::clone(&console.bus);

    if let Err(e) = ctrlc::set_handler(move || {
        println!();
        println!("{}", "⚠  Ctrl-C received – shutting down …".yellow().bold());

        let listeners = bus_ctrlc_ref.alert("robocm-cli", alert::SHUTDOWN, "SHUTDOWN: operator Ctrl-C");
        println!("  ✓ Shutdown alert sent to {listeners} listener(s).");
        shutdown_clone.store(true, Ordering::SeqCst);

        std::thread::sleep(SHUTDOWN_GRACE);
        println!("{}", "  ✓ Exiting robocm.".green());
        std::process::exit(0);
    }) {
        warn!(error = %e, "Failed to install Ctrl-C handler; Ctrl-C will terminate without a shutdown alert");
    }

    println!(
        "  Broker bridge on {}, agent {}",
        format!("ws://{}", cfg.listen_addr).bold(),
        cfg.agent_id.dimmed()
    );
    println!();
    println!("  Type {} for a list of commands.\n", "/help".bold().cyan());

    repl::run(shutdown, &console, runtime.handle());

    runtime.shutdown_timeout(SHUTDOWN_GRACE);
}

/// Build every service described by `cfg` and start the background loops.
async fn start(cfg: &config::Config) -> Result<repl::Console, CmError> {
    let store = match &cfg.database_path {
        Some(path) => SqliteTripleStore::open(path),
        None => SqliteTripleStore::open_in_memory(),
    }
    .map_err(|e| CmError::Storage(e.to_string()))?;
    info!(
        database = cfg.database_path.as_deref().unwrap_or(":memory:"),
        "knowledge base opened"
    );

    let bus = Arc::new(EventBus::new(cfg.bus_capacity));
    let gateway = Gateway::new(Arc::new(store), cfg.gateway_timeout());
    let pipeline = Arc::new(PerceptionPipeline::new(
        Normalizer::new(cfg.aliases.clone()),
        cfg.retention_index()?,
        gateway,
        Arc::clone(&bus),
    ));

    let (client, inbox) = query::channel(QUERY_QUEUE);
    let dispatch = DispatchBridge::new(Arc::clone(&pipeline));
    dispatch.spawn(&bus, inbox);

    let bridge = WsBridge::new(Arc::clone(&bus), client.clone());
    let addr = cfg.listen_addr;
    tokio::spawn(async move {
        if let Err(e) = bridge.run(addr).await {
            error!(error = %e, "broker bridge stopped");
        }
    });

    Ok(repl::Console {
        bus,
        pipeline,
        dispatch,
        queries: client,
        agent_id: cfg.agent_id.clone(),
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// Banner
// ─────────────────────────────────────────────────────────────────────────────

fn print_banner() {
    println!();
    println!("{}", r#"   ___       __          _____ __  ___"#.bold().cyan());
    println!("{}", r#"  / _ \___  / /  ___    / ___//  |/  /"#.bold().cyan());
    println!("{}", r#" / , _/ _ \/ _ \/ _ \  / /__ / /|_/ / "#.bold().cyan());
    println!("{}", r#"/_/|_|\___/_.__/\___/  \___//_/  /_/  "#.bold().cyan());
    println!();
    println!(
        "  {} {}",
        "robocm".bold(),
        format!("v{}", env!("CARGO_PKG_VERSION")).dimmed()
    );
    println!("  Robot Context Manager");
    println!();
}
