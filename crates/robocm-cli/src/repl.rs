//! REPL – Read-Eval-Print Loop for the robocm operator console.
//!
//! Supported slash-commands:
//!   /help                      – show this list
//!   /notify <source> <gl>      – publish a perception notification
//!   /query <gl>                – run a context query and print the result
//!   /stats                     – pipeline, gateway and dispatch counters
//!   /window <class> <entity>   – retention window of one entity
//!   /rules                     – subscription rules for every known event
//!   /quit | /exit              – exit the console

use colored::Colorize;
use serde_json::json;
use std::io::{self, BufRead, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::runtime::Handle;

use robocm_middleware::{EventBus, QueryClient};
use robocm_runtime::{DispatchBridge, PerceptionPipeline};
use robocm_types::EntityClass;

/// Handles the console needs to drive the running services.
pub struct Console {
    pub bus: Arc<EventBus>,
    pub pipeline: Arc<PerceptionPipeline>,
    pub dispatch: DispatchBridge,
    pub queries: QueryClient,
    pub agent_id: String,
}

/// One parsed console line.
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    Help,
    Notify { source: String, text: String },
    Query(String),
    Stats,
    Window { class: String, entity: String },
    Rules,
    Quit,
    Unknown(String),
    Usage(&'static str),
}

impl Command {
    /// Parse one trimmed, non-empty line.
    pub fn parse(line: &str) -> Self {
        let (head, rest) = match line.split_once(char::is_whitespace) {
            Some((head, rest)) => (head, rest.trim()),
            None => (line, ""),
        };
        match head {
            "/help" => Command::Help,
            "/stats" => Command::Stats,
            "/rules" => Command::Rules,
            "/quit" | "/exit" => Command::Quit,
            "/query" if rest.is_empty() => Command::Usage("/query <context pattern>"),
            "/query" => Command::Query(rest.to_string()),
            "/notify" => match rest.split_once(char::is_whitespace) {
                Some((source, text)) if !text.trim().is_empty() => Command::Notify {
                    source: source.to_string(),
                    text: text.trim().to_string(),
                },
                _ => Command::Usage("/notify <source> <notification>"),
            },
            "/window" => match rest.split_whitespace().collect::<Vec<_>>().as_slice() {
                [class, entity] => Command::Window {
                    class: class.to_string(),
                    entity: entity.to_string(),
                },
                _ => Command::Usage("/window <class> <entity>"),
            },
            _ => Command::Unknown(line.to_string()),
        }
    }
}

/// Entry point for the interactive console.
///
/// `shutdown` is polled each iteration; when set the console exits cleanly.
pub fn run(shutdown: Arc<AtomicBool>, console: &Console, runtime: &Handle) {
    let stdin = io::stdin();
    let mut stdout = io::stdout();

    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }

        print!("{} ", "robocm>".bold().cyan());
        stdout.flush().ok();

        let mut line = String::new();
        match stdin.lock().read_line(&mut line) {
            Ok(0) => break, // EOF
            Ok(_) => {}
            Err(e) => {
                eprintln!("{}: {}", "Read error".red(), e);
                break;
            }
        }

        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        match Command::parse(line) {
            Command::Help => cmd_help(),
            Command::Notify { source, text } => cmd_notify(console, source, text),
            Command::Query(pattern) => cmd_query(console, runtime, pattern),
            Command::Stats => cmd_stats(console),
            Command::Window { class, entity } => cmd_window(console, &class, &entity),
            Command::Rules => cmd_rules(console),
            Command::Quit => {
                println!("{}", "Goodbye.".green());
                shutdown.store(true, Ordering::SeqCst);
                break;
            }
            Command::Usage(usage) => println!("{} {}", "Usage:".yellow(), usage.bold()),
            Command::Unknown(other) => {
                println!(
                    "{} '{}'. Type {} for available commands.",
                    "Unknown command:".red(),
                    other.yellow(),
                    "/help".bold()
                );
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Command handlers
// ─────────────────────────────────────────────────────────────────────────────

fn cmd_help() {
    println!();
    println!("{}", "robocm Commands".bold().underline());
    println!("  {}  – publish a perception notification", "/notify <source> <gl>".bold().cyan());
    println!("  {}             – run a context query", "/query <gl>".bold().cyan());
    println!("  {}                  – pipeline and gateway counters", "/stats".bold().cyan());
    println!("  {} – retention window of one entity", "/window <class> <entity>".bold().cyan());
    println!("  {}                  – subscription rules", "/rules".bold().cyan());
    println!("  {}            – exit the console", "/quit  /exit".bold().cyan());
    println!();
}

fn cmd_notify(console: &Console, source: String, text: String) {
    match console.bus.notify(source, text) {
        Ok(_) => println!("{}", "✓ Notification published.".green()),
        Err(e) => println!("{}: {}", "Publish failed".red(), e),
    }
}

fn cmd_query(console: &Console, runtime: &Handle, pattern: String) {
    match runtime.block_on(console.queries.ask(console.agent_id.clone(), pattern)) {
        Ok(result) => println!("{}", result),
        Err(e) => println!("{}: {}", "Query failed".red(), e),
    }
}

fn cmd_stats(console: &Console) {
    let stats = json!({
        "pipeline": console.pipeline.stats().snapshot(),
        "gateway": console.pipeline.gateway().stats().snapshot(),
        "dispatch": {
            "overflowed": console.dispatch.overflowed(),
            "refused_sources": console.dispatch.refused_sources(),
            "active_workers": console.dispatch.active_workers(),
        },
    });
    match serde_json::to_string_pretty(&stats) {
        Ok(text) => println!("{}", text),
        Err(e) => println!("{}: {}", "Error rendering stats".red(), e),
    }
}

fn cmd_window(console: &Console, class: &str, entity: &str) {
    let class = match class.parse::<EntityClass>() {
        Ok(class) => class,
        Err(e) => {
            println!("{}: {}", "Error".red(), e);
            return;
        }
    };
    let key = console.pipeline.normalizer().aliases().resolve(entity);
    let tracked = console.pipeline.retention().tracked(class);
    match console.pipeline.retention().window(class, key) {
        Some(w) => println!(
            "  {} {}: lo={} hi={} live={}  ({} {} entities tracked)",
            class.to_string().bold(),
            key.bold(),
            w.lo,
            w.hi,
            w.live(),
            tracked,
            class
        ),
        None => println!(
            "  {} {} is not tracked ({} entities tracked)",
            class.to_string().bold(),
            key.yellow(),
            tracked
        ),
    }
}

fn cmd_rules(console: &Console) {
    println!("{}", "Subscription Rules".bold().underline());
    for rule in console.pipeline.normalizer().subscription_rules() {
        println!("  {}", rule);
    }
}
