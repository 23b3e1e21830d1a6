//! Autowire CLI - drive the transport core against a live backend.
//!
//! This is the main binary entry point. See the `autowire` library for the
//! core functionality.

use std::io::Write;
use std::time::Duration;

use anyhow::{Context, Result};
use autowire::events::TopicPattern;
use autowire::{CallOptions, Config, SessionOptions, TopicFilter, Transport};
use clap::{Parser, Subcommand};
use serde_json::Value;
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;

// CLI
#[derive(Parser)]
#[command(name = "autowire")]
#[command(version)]
#[command(about = "Talk to the dev-automation backend over its real-time transport")]
struct Cli {
    /// Backend base address (overrides config and AUTOWIRE_BASE_URL)
    #[arg(long, global = true)]
    base_url: Option<String>,

    /// Bearer token forwarded on every connection
    #[arg(long, global = true, env = "AUTOWIRE_TOKEN", hide_env_values = true)]
    token: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Send a command and print its result
    Call {
        /// Command name
        command: String,
        /// JSON payload
        #[arg(long, default_value = "{}")]
        data: String,
        /// Give up after this many seconds
        #[arg(long)]
        timeout: Option<f64>,
    },
    /// Send a command without waiting for its result
    Notify {
        /// Command name
        command: String,
        /// JSON payload
        #[arg(long, default_value = "{}")]
        data: String,
    },
    /// Print pushed events as JSON lines
    Watch {
        /// Topic, `*`, or a template like `changelog.{project_id}.progress`
        #[arg(default_value = "*")]
        pattern: String,
    },
    /// Attach stdin/stdout to a terminal session
    Terminal {
        /// Session id (random if omitted)
        session_id: Option<String>,
        /// Working directory for the remote process
        #[arg(long)]
        cwd: Option<String>,
        /// Command to run instead of the default shell
        #[arg(long)]
        command: Option<String>,
    },
    /// Print the effective configuration (token excluded)
    Config {
        /// Also write it to the config file
        #[arg(long)]
        save: bool,
    },
}

fn init_logging() -> Result<()> {
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    if let Ok(path) = std::env::var("AUTOWIRE_LOG_FILE") {
        let log_file = std::fs::File::create(&path)
            .with_context(|| format!("failed to create log file at {path}"))?;
        builder.target(env_logger::Target::Pipe(Box::new(log_file)));
    } else {
        builder.target(env_logger::Target::Stderr);
    }
    builder.format_timestamp_secs().init();
    Ok(())
}

fn parse_payload(data: &str) -> Result<Value> {
    serde_json::from_str(data).with_context(|| format!("--data is not valid JSON: {data}"))
}

fn parse_filter(pattern: &str) -> Result<TopicFilter> {
    if pattern.contains('{') {
        Ok(TopicPattern::parse(pattern)?.into())
    } else {
        Ok(pattern.into())
    }
}

fn run_config(config: &Config, save: bool) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(config)?);
    if save {
        config.save()?;
        eprintln!("Configuration saved to {}", Config::config_dir()?.display());
    }
    Ok(())
}

async fn run_call(transport: &Transport, command: &str, data: &str, timeout: Option<f64>) -> Result<()> {
    let payload = parse_payload(data)?;
    let mut options = CallOptions::default();
    if let Some(secs) = timeout {
        let timeout = Duration::try_from_secs_f64(secs).context("--timeout must be a positive number")?;
        options = options.with_timeout(timeout);
    }

    transport.rpc().wait_connected().await?;
    let result = transport.rpc().call_with(command, payload, options).await?;
    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}

async fn run_notify(transport: &Transport, command: &str, data: &str) -> Result<()> {
    let payload = parse_payload(data)?;
    transport.rpc().wait_connected().await?;
    transport.rpc().notify(command, payload);
    // Leave the socket up long enough to flush the frame.
    tokio::time::sleep(Duration::from_millis(200)).await;
    Ok(())
}

async fn run_watch(transport: &Transport, pattern: &str) -> Result<()> {
    let (subscription, mut events) = transport.events().stream(parse_filter(pattern)?);
    let mut stdout = std::io::stdout();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => {
                let Some(event) = event else { break };
                writeln!(stdout, "{}", serde_json::to_string(&event)?)?;
                stdout.flush()?;
            }
        }
    }

    subscription.unsubscribe();
    Ok(())
}

async fn run_terminal(transport: &Transport, session_id: String, options: SessionOptions) -> Result<()> {
    let terminals = transport.terminals();
    let (exit_tx, mut exit_rx) = mpsc::unbounded_channel();

    let target = session_id.clone();
    let output = terminals.on_output(move |id, bytes| {
        if id == target {
            let mut stdout = std::io::stdout();
            let _ = stdout.write_all(bytes);
            let _ = stdout.flush();
        }
    });
    let target = session_id.clone();
    let exit = terminals.on_exit(move |id, code| {
        if id == target {
            let _ = exit_tx.send(code);
        }
    });
    let dropped = terminals.on_connection_change(|id, connected| {
        if !connected {
            log::warn!("Terminal {} disconnected, waiting for reconnect", id);
        }
    });

    terminals.create(&session_id, options).await?;
    eprintln!("[attached to {session_id}; Ctrl-C to detach]");

    let mut stdin = tokio::io::stdin();
    let mut buf = vec![0u8; 4096];
    let code = loop {
        tokio::select! {
            code = exit_rx.recv() => break code.flatten(),
            _ = tokio::signal::ctrl_c() => {
                terminals.destroy(&session_id).await?;
                break None;
            }
            read = stdin.read(&mut buf) => {
                let n = read.context("failed to read stdin")?;
                if n == 0 {
                    terminals.destroy(&session_id).await?;
                    break None;
                }
                if let Err(e) = terminals.write(&session_id, &buf[..n]) {
                    log::warn!("Input for {} dropped: {}", session_id, e);
                }
            }
        }
    };

    output.unsubscribe();
    exit.unsubscribe();
    dropped.unsubscribe();

    if let Some(code) = code {
        eprintln!("[process exited with code {code}]");
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging()?;

    let cli = Cli::parse();

    let mut config = Config::load()?;
    if let Some(base_url) = cli.base_url {
        config.base_url = Some(base_url);
    }
    if let Some(token) = cli.token {
        config.token = Some(token);
    }

    if let Commands::Config { save } = cli.command {
        return run_config(&config, save);
    }

    let transport = Transport::new(config)?;
    transport.start();

    let result = match cli.command {
        Commands::Call {
            command,
            data,
            timeout,
        } => run_call(&transport, &command, &data, timeout).await,
        Commands::Notify { command, data } => run_notify(&transport, &command, &data).await,
        Commands::Watch { pattern } => run_watch(&transport, &pattern).await,
        Commands::Terminal {
            session_id,
            cwd,
            command,
        } => {
            let session_id = session_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
            let options = SessionOptions {
                cwd,
                command,
                ..SessionOptions::default()
            };
            run_terminal(&transport, session_id, options).await
        }
        Commands::Config { .. } => Ok(()),
    };

    transport.stop().await;
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition_is_valid() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_filter() {
        assert!(matches!(parse_filter("*").unwrap(), TopicFilter::Any));
        assert!(matches!(parse_filter("task.updated").unwrap(), TopicFilter::Exact(_)));
        assert!(matches!(
            parse_filter("changelog.{project_id}.progress").unwrap(),
            TopicFilter::Pattern(_)
        ));
    }

    #[test]
    fn test_config_subcommand_parses_save_flag() {
        let cli = Cli::try_parse_from(["autowire", "--base-url", "http://10.0.0.5:8000", "config", "--save"])
            .unwrap();
        assert_eq!(cli.base_url.as_deref(), Some("http://10.0.0.5:8000"));
        assert!(matches!(cli.command, Commands::Config { save: true }));
    }

    #[test]
    fn test_parse_payload_rejects_bad_json() {
        assert!(parse_payload("{not json").is_err());
        assert_eq!(parse_payload(r#"{"a":1}"#).unwrap(), serde_json::json!({"a": 1}));
    }
}
