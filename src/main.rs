use std::net::{IpAddr, SocketAddr};
use std::process::ExitCode;

use clap::Parser;
use log::{error, info};
use tracing_subscriber::EnvFilter;

use ws_relay::chat::ChatRelay;
use ws_relay::config::{DEFAULT_MAX_FRAME_LEN, DEFAULT_MAX_HANDSHAKE_LEN, DEFAULT_PORT};
use ws_relay::{console, RelayConfig, RelayServer};

const COMMAND_QUEUE_CAPACITY: usize = 64;

/// WebSocket chat relay.
#[derive(Parser, Debug)]
#[command(name = "ws-relay", about = "WebSocket chat relay over raw TCP")]
struct Cli {
    /// Address to bind.
    #[arg(long, env = "RELAY_HOST", default_value = "127.0.0.1")]
    host: IpAddr,

    /// WebSocket port (0 for auto-assign).
    #[arg(long, env = "RELAY_PORT", default_value_t = DEFAULT_PORT)]
    port: u16,

    /// Largest frame payload a client may send, in bytes.
    #[arg(long, env = "RELAY_MAX_FRAME_BYTES", default_value_t = DEFAULT_MAX_FRAME_LEN)]
    max_frame_bytes: usize,

    /// Largest HTTP upgrade request head, in bytes.
    #[arg(long, env = "RELAY_MAX_HANDSHAKE_BYTES", default_value_t = DEFAULT_MAX_HANDSHAKE_LEN)]
    max_handshake_bytes: usize,

    /// Do not read admin commands from stdin.
    #[arg(long, env = "RELAY_NO_CONSOLE")]
    no_console: bool,

    /// Log filter used when RUST_LOG is unset.
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Cli {
    fn relay_config(&self) -> RelayConfig {
        RelayConfig {
            max_frame_len: self.max_frame_bytes,
            max_handshake_len: self.max_handshake_bytes,
            ..RelayConfig::with_addr(SocketAddr::new(self.host, self.port))
        }
    }
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    // try_init also bridges `log` records into the subscriber.
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_writer(std::io::stderr)
        .try_init();
}

fn main() -> ExitCode {
    // Load .env file if present (development)
    dotenv::dotenv().ok();
    let cli = Cli::parse();
    init_logging(&cli.log_level);

    let mut server = match RelayServer::bind(cli.relay_config()) {
        Ok(server) => server,
        Err(e) => {
            error!("failed to start relay: {e}");
            return ExitCode::FAILURE;
        }
    };

    if !cli.no_console {
        let sender = server.command_sender(COMMAND_QUEUE_CAPACITY);
        match console::spawn(sender) {
            Ok(_) => info!("console ready: list, kick <id> [reason], say <text>, quit"),
            Err(e) => error!("console unavailable: {e}"),
        }
    }

    match server.run(&mut ChatRelay::new()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("relay stopped with error: {e}");
            ExitCode::FAILURE
        }
    }
}
