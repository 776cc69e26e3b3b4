//! Binary entrypoint for the xarm-bridge CLI.
//!
//! Commands:
//! - `start [--port <path>]` - run the bridge, talking to the cloud side as JSON lines on stdin/stdout
//! - `init` - create a starter `config.toml`
//! - `check <command...>` - validate a controller command and show its wire form
//! - `smoketest --port <path> [-b <baud>] [--command <cmd>] [--timeout <s>]` - one exchange with the device
//!
//! See the library crate docs for module-level details: `xarm_bridge::`.
use anyhow::Result;
use clap::{Parser, Subcommand};
use log::{info, warn};

use xarm_bridge::bridge::{self, Bridge, ChannelMutex};
use xarm_bridge::cloud::stdio::spawn_stdio;
use xarm_bridge::cloud::ChannelCloud;
use xarm_bridge::command::validate_command;
use xarm_bridge::config::Config;
use xarm_bridge::error::BridgeResult;
use xarm_bridge::metrics::BridgeMetrics;
use xarm_bridge::serial::{SerialChannel, SerialPortOpener};
use xarm_bridge::shutdown;

#[derive(Parser)]
#[command(name = "xarm-bridge")]
#[command(about = "Bridge between a cloud message bus and a serial-attached xARM controller")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Configuration file path (can be used before or after subcommand)
    #[arg(short, long, default_value = "config.toml", global = true)]
    config: String,

    /// Verbose logging (-v, -vv for more; may appear before or after subcommand)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the bridge
    Start {
        /// Controller serial port (e.g., /dev/ttyACM0); overrides the config file
        #[arg(short, long)]
        port: Option<String>,
    },
    /// Write a default configuration file
    Init,
    /// Validate a controller command, e.g. `check get_block 5`
    Check {
        #[arg(required = true, num_args = 1..)]
        command: Vec<String>,
    },
    /// Send one command to the controller and print the reply as JSON
    SmokeTest {
        /// Device serial port
        #[arg(short, long)]
        port: String,
        /// Baud rate
        #[arg(short = 'b', long, default_value_t = 9600)]
        baud: u32,
        /// Command to send
        #[arg(long, default_value = "holding_block")]
        command: String,
        /// Seconds to wait for the reply
        #[arg(short, long, default_value_t = 10)]
        timeout: u64,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Init runs before a config exists; everything else logs per the config file.
    let pre_config = match cli.command {
        Commands::Init => None,
        _ => match Config::load(&cli.config).await {
            Ok(config) => Some(config),
            Err(e) => {
                eprintln!("{e}; using defaults");
                None
            }
        },
    };
    init_logging(&pre_config, cli.verbose);

    match cli.command {
        Commands::Start { port } => {
            let mut config = pre_config.unwrap_or_default();
            if let Some(port) = port {
                config.serial.port = port;
            }
            config.validate()?;

            let opener = SerialPortOpener::new(
                config.serial.port.clone(),
                config.serial.baud_rate,
                config.serial.read_timeout(),
            );
            let (cloud, harness) = ChannelCloud::pair();
            info!(
                "Bridging {} @ {} baud to the cloud on stdin/stdout",
                config.serial.port, config.serial.baud_rate
            );
            let handle = Bridge::new(&config, Box::new(opener), cloud).spawn();
            let pump = spawn_stdio(harness, handle.shutdown_signal());
            let outcome = handle.run_until(bridge::wait_for_ctrl_c()).await;
            match pump.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!("Cloud adapter stopped with error: {}", e),
                Err(e) => warn!("Cloud adapter task failed: {}", e),
            }
            outcome?;
        }
        Commands::Init => {
            info!("Initializing new bridge configuration");
            Config::create_default(&cli.config).await?;
            info!("Configuration file created at {}", cli.config);
        }
        Commands::Check { command } => {
            let text = command.join(" ");
            match validate_command(&text) {
                Ok(cmd) => {
                    println!("{}", serde_json::json!({
                        "valid": true,
                        "command": cmd.to_string(),
                        "device_line": cmd.device_line(),
                    }));
                }
                Err(e) => {
                    println!("{}", serde_json::json!({
                        "valid": false,
                        "error": e.to_string(),
                    }));
                    std::process::exit(1);
                }
            }
        }
        Commands::SmokeTest {
            port,
            baud,
            command,
            timeout,
        } => {
            let cmd = validate_command(&command)?;
            let config = pre_config.unwrap_or_default();
            let opener = SerialPortOpener::new(port.clone(), baud, config.serial.read_timeout());
            let channel = SerialChannel::new(
                Box::new(opener),
                config.reconnect.policy(),
                std::sync::Arc::new(BridgeMetrics::new()),
            )
            .with_settle(config.serial.settle())
            .with_poll_interval(config.methods.poll_interval());
            let mutex = ChannelMutex::new(channel);

            info!("Starting smoke test on {} @ {} baud", port, baud);
            let (trigger, mut sd) = shutdown::channel();
            let wait = tokio::time::Duration::from_secs(timeout);
            let started = tokio::time::Instant::now();
            let line = cmd.device_line();
            // The whole exchange, opening the port included, is bounded by the timeout.
            let exchange = tokio::time::timeout(
                wait,
                mutex.with_channel::<Option<String>, _>(&mut sd, move |chan| Box::pin(smoke_exchange(chan, line, wait))),
            );
            let (status_ok, reply, error) = match exchange.await {
                Ok(Ok(Some(reply))) => (true, Some(reply), None),
                Ok(Ok(None)) => (false, None, Some("no response within timeout".to_string())),
                Ok(Err(e)) => (false, None, Some(e.to_string())),
                Err(_) => (false, None, Some(format!("timed out after {}s", timeout))),
            };
            trigger.shutdown();
            let payload = serde_json::json!({
                "status": if status_ok { "ok" } else { "no_reply" },
                "port": port,
                "command": cmd.to_string(),
                "device_line": cmd.device_line(),
                "reply": reply,
                "error": error,
                "elapsed_ms": started.elapsed().as_millis() as u64,
                "timeout_seconds": timeout,
            });
            println!("{}", payload);
            std::process::exit(if status_ok { 0 } else { 1 });
        }
    }

    Ok(())
}

async fn smoke_exchange(chan: &mut SerialChannel, line: String, wait: tokio::time::Duration) -> BridgeResult<Option<String>> {
    chan.write_line(&line)?;
    let deadline = tokio::time::Instant::now() + wait;
    while tokio::time::Instant::now() < deadline {
        let remaining = deadline - tokio::time::Instant::now();
        match chan.read_line_with_timeout(remaining).await? {
            Some(reply) if reply.trim().is_empty() => continue,
            other => return Ok(other),
        }
    }
    Ok(None)
}

fn init_logging(config: &Option<Config>, verbosity: u8) {
    use std::io::Write;
    let mut builder = env_logger::Builder::new();
    // CLI verbosity overrides the configured level
    let configured = config
        .as_ref()
        .and_then(|cfg| cfg.logging.level.parse::<log::LevelFilter>().ok())
        .unwrap_or(log::LevelFilter::Info);
    let base_level = match verbosity {
        0 => configured,
        1 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    builder.filter_level(base_level);

    let log_file = config.as_ref().and_then(|cfg| cfg.logging.file.clone());
    let file = log_file.as_ref().and_then(|path| {
        std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .ok()
    });
    if let Some(f) = file {
        let write_mutex = std::sync::Arc::new(std::sync::Mutex::new(f));
        // Mirror to the console only when someone is watching; stdout is reserved for cloud traffic.
        let is_tty = atty::is(atty::Stream::Stderr);
        builder.format(move |fmt, record| {
            let ts = chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ");
            let line = format!("{} [{}] {}", ts, record.level(), record.args());
            if let Ok(mut guard) = write_mutex.lock() {
                let _ = writeln!(guard, "{}", line);
            }
            if is_tty {
                writeln!(fmt, "{}", line)
            } else {
                Ok(())
            }
        });
    } else {
        builder.format(|fmt, record| {
            writeln!(
                fmt,
                "{} [{}] {}",
                chrono::Utc::now().format("%Y-%m-%dT%H:%M:%SZ"),
                record.level(),
                record.args()
            )
        });
    }
    let _ = builder.try_init();
}
