//! REPL – operator console over a live [`DeviceLink`].
//!
//! Supported slash-commands:
//!   /help               – show this list
//!   /state              – current connection state
//!   /stats              – connection counters
//!   /topics             – topics with at least one handler
//!   /sub <topic>        – print every message on `topic`
//!   /unsub <topic>      – stop printing `topic`
//!   /clear <topic>      – drop every handler of `topic`
//!   /pub <topic> [json] – publish `json` (default `null`) on `topic`
//!   /connect            – reconnect after /close or exhausted retries
//!   /close              – close the connection
//!   /quit | /exit       – shut down and exit

use colored::Colorize;
use serde_json::Value;
use skylink_middleware::{DeviceLink, Subscription};
use std::collections::HashMap;
use std::io::{self, BufRead, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::runtime::Handle;

/// One parsed console line.
#[derive(Debug, Clone, PartialEq)]
pub enum ReplCommand {
    Help,
    State,
    Stats,
    Topics,
    Sub(String),
    Unsub(String),
    Clear(String),
    Pub { topic: String, data: Value },
    Connect,
    Close,
    Quit,
}

/// Parse one input line.  `Ok(None)` for blank lines.
pub fn parse_command(line: &str) -> Result<Option<ReplCommand>, String> {
    let line = line.trim();
    if line.is_empty() {
        return Ok(None);
    }
    let (name, rest) = match line.split_once(char::is_whitespace) {
        Some((name, rest)) => (name, rest.trim()),
        None => (line, ""),
    };

    let command = match name {
        "/help" => ReplCommand::Help,
        "/state" => ReplCommand::State,
        "/stats" => ReplCommand::Stats,
        "/topics" => ReplCommand::Topics,
        "/sub" => ReplCommand::Sub(required_topic(name, rest)?),
        "/unsub" => ReplCommand::Unsub(required_topic(name, rest)?),
        "/clear" => ReplCommand::Clear(required_topic(name, rest)?),
        "/pub" => {
            let (topic, payload) = match rest.split_once(char::is_whitespace) {
                Some((topic, payload)) => (topic, payload.trim()),
                None => (rest, ""),
            };
            let topic = required_topic(name, topic)?;
            let data = if payload.is_empty() {
                Value::Null
            } else {
                serde_json::from_str(payload).map_err(|e| format!("invalid JSON payload: {e}"))?
            };
            ReplCommand::Pub { topic, data }
        }
        "/connect" => ReplCommand::Connect,
        "/close" => ReplCommand::Close,
        "/quit" | "/exit" => ReplCommand::Quit,
        other => return Err(format!("unknown command '{other}'")),
    };
    Ok(Some(command))
}

fn required_topic(command: &str, arg: &str) -> Result<String, String> {
    match arg.split_whitespace().next() {
        Some(topic) => Ok(topic.to_string()),
        None => Err(format!("usage: {command} <topic>")),
    }
}

/// Entry point for the interactive REPL.
///
/// `shutdown` is polled each iteration; when set the REPL exits cleanly.
/// `runtime` drives the async bus queries.
pub fn run(link: DeviceLink, runtime: Handle, shutdown: Arc<AtomicBool>) {
    let stdin = io::stdin();
    let mut stdout = io::stdout();
    // Subscriptions opened from this console, so /unsub leaves others alone.
    let mut watches: HashMap<String, Vec<Subscription>> = HashMap::new();

    loop {
        if shutdown.load(Ordering::SeqCst) {
            break;
        }

        print!("{} ", "skylink>".bold().cyan());
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

        let command = match parse_command(&line) {
            Ok(Some(command)) => command,
            Ok(None) => continue,
            Err(e) => {
                println!("{} {}. Type {} for available commands.", "Error:".red(), e, "/help".bold());
                continue;
            }
        };

        match command {
            ReplCommand::Help => cmd_help(),
            ReplCommand::State => cmd_state(&link),
            ReplCommand::Stats => cmd_stats(&link),
            ReplCommand::Topics => {
                let topics = runtime.block_on(link.bus().topics());
                if topics.is_empty() {
                    println!("  {}", "no topics with handlers".dimmed());
                }
                for topic in topics {
                    println!("  • {}", topic.bold());
                }
            }
            ReplCommand::Sub(topic) => {
                let subscription = link.bus().subscribe(topic.clone(), |data: &Value, topic: &str| {
                    println!("\n  {} {} {}", "◀".cyan(), topic.bold(), data);
                    Ok(())
                });
                watches.entry(topic.clone()).or_default().push(subscription);
                println!("{} {}", "✓ Watching".green(), topic.bold());
            }
            ReplCommand::Unsub(topic) => match watches.remove(&topic) {
                Some(subscriptions) => {
                    for subscription in subscriptions {
                        subscription.unsubscribe();
                    }
                    println!("{} {}", "✓ Stopped watching".green(), topic.bold());
                }
                None => println!("  {} '{}'", "Not watching".yellow(), topic),
            },
            ReplCommand::Clear(topic) => {
                link.bus().clear_topic(&topic);
                watches.remove(&topic);
                println!("{} {}", "✓ Cleared".green(), topic.bold());
            }
            ReplCommand::Pub { topic, data } => {
                link.bus().publish(&topic, &data);
                let note = if link.transport().is_connected() { "sent" } else { "queued" };
                println!("{} {} ({})", "✓ Published to".green(), topic.bold(), note.dimmed());
            }
            ReplCommand::Connect => {
                link.transport().initiate_connection();
                println!("  Connecting …");
            }
            ReplCommand::Close => {
                link.transport().close();
                println!("  Closing connection.");
            }
            ReplCommand::Quit => {
                link.shutdown();
                println!("{}", "Goodbye.".green());
                shutdown.store(true, Ordering::SeqCst);
                break;
            }
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Command handlers
// ─────────────────────────────────────────────────────────────────────────────

fn cmd_help() {
    println!();
    println!("{}", "SkyLink Commands".bold().underline());
    println!("  {}               – current connection state", "/state".bold().cyan());
    println!("  {}               – connection counters", "/stats".bold().cyan());
    println!("  {}              – topics with handlers", "/topics".bold().cyan());
    println!("  {}         – print messages on a topic", "/sub <topic>".bold().cyan());
    println!("  {}       – stop printing a topic", "/unsub <topic>".bold().cyan());
    println!("  {}       – drop every handler of a topic", "/clear <topic>".bold().cyan());
    println!("  {}  – publish a JSON value", "/pub <topic> [json]".bold().cyan());
    println!("  {}             – reconnect", "/connect".bold().cyan());
    println!("  {}               – close the connection", "/close".bold().cyan());
    println!("  {}        – exit", "/quit  /exit".bold().cyan());
    println!();
}

fn cmd_state(link: &DeviceLink) {
    let state = link.transport().state();
    let label = state.to_string();
    let label = if link.transport().is_connected() {
        label.green()
    } else {
        label.yellow()
    };
    println!("  Connection: {}", label.bold());
}

fn cmd_stats(link: &DeviceLink) {
    let stats = link.transport().stats();
    let stamp = |t: Option<chrono::DateTime<chrono::Utc>>| {
        t.map(|t| t.to_rfc3339()).unwrap_or_else(|| "never".to_string())
    };
    println!("{}", "Connection Stats".bold().underline());
    println!("  Sent             : {}", stats.messages_sent);
    println!("  Received         : {}", stats.messages_received);
    println!("  Connections      : {}", stats.connection_attempts);
    println!("  Queued           : {}", stats.queued_messages);
    println!("  Dropped          : {}", stats.dropped_messages);
    println!("  Last connected   : {}", stamp(stats.last_connected_at));
    println!("  Last disconnected: {}", stamp(stats.last_disconnected_at));
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn blank_lines_are_ignored() {
        assert_eq!(parse_command("   \n"), Ok(None));
    }

    #[test]
    fn bare_commands() {
        assert_eq!(parse_command("/help"), Ok(Some(ReplCommand::Help)));
        assert_eq!(parse_command("/stats\n"), Ok(Some(ReplCommand::Stats)));
        assert_eq!(parse_command("/exit"), Ok(Some(ReplCommand::Quit)));
        assert_eq!(parse_command("/quit"), Ok(Some(ReplCommand::Quit)));
    }

    #[test]
    fn topic_commands_take_one_topic() {
        assert_eq!(
            parse_command("/sub mount/status"),
            Ok(Some(ReplCommand::Sub("mount/status".to_string())))
        );
        assert_eq!(
            parse_command("/clear   guider/status  "),
            Ok(Some(ReplCommand::Clear("guider/status".to_string())))
        );
        assert!(parse_command("/unsub").unwrap_err().contains("usage: /unsub <topic>"));
    }

    #[test]
    fn pub_parses_json_payload() {
        assert_eq!(
            parse_command(r#"/pub mount/slew {"ra": 10.5, "dec": -3.2}"#),
            Ok(Some(ReplCommand::Pub {
                topic: "mount/slew".to_string(),
                data: json!({ "ra": 10.5, "dec": -3.2 }),
            }))
        );
    }

    #[test]
    fn pub_without_payload_sends_null() {
        assert_eq!(
            parse_command("/pub guider/stop"),
            Ok(Some(ReplCommand::Pub {
                topic: "guider/stop".to_string(),
                data: Value::Null,
            }))
        );
    }

    #[test]
    fn pub_rejects_invalid_json() {
        let err = parse_command("/pub mount/slew {ra:").unwrap_err();
        assert!(err.starts_with("invalid JSON payload"));
    }

    #[test]
    fn unknown_commands_are_errors() {
        assert_eq!(
            parse_command("/settings"),
            Err("unknown command '/settings'".to_string())
        );
        assert!(parse_command("hello").is_err());
    }
}
