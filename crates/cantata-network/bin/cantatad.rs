use std::{net::SocketAddr, path::PathBuf, process::ExitCode};

use cantata::{Config, Interpreter, Permission, config};
use cantata_network::{ClientManager, Listener};
use clap::Parser;
use signal_hook::{
    consts::{SIGINT, SIGTERM},
    low_level,
};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(about = "Line-oriented music playback control daemon", version)]
struct Args {
    /// TCP address to listen on.
    #[arg(short, long, default_value = "0.0.0.0:6600")]
    listen: SocketAddr,
    /// Additionally listen on a Unix socket at this path.
    #[arg(long)]
    socket: Option<PathBuf>,
    /// Seconds a silent connection is kept before being closed.
    #[arg(long, default_value_t = config::DEFAULT_CONNECTION_TIMEOUT_SECS,
          value_parser = clap::value_parser!(u64).range(1..))]
    connection_timeout: u64,
    /// Maximum number of concurrent clients.
    #[arg(long, default_value_t = config::DEFAULT_MAX_CONNECTIONS as u64,
          value_parser = clap::value_parser!(u64).range(1..))]
    max_connections: u64,
    /// Command list size cap, in KiB.
    #[arg(long, default_value_t = config::DEFAULT_MAX_COMMAND_LIST_KIB,
          value_parser = clap::value_parser!(u64).range(1..))]
    max_command_list_size: u64,
    /// Per-client deferred output cap, in KiB.
    #[arg(long, default_value_t = config::DEFAULT_MAX_OUTPUT_BUFFER_KIB,
          value_parser = clap::value_parser!(u64).range(1..))]
    max_output_buffer_size: u64,
    /// Permissions granted to new clients, comma separated.
    #[arg(long, default_value = "read,add,control,admin")]
    default_permissions: String,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let permissions = match Permission::parse_list(&args.default_permissions) {
        Ok(p) => p,
        Err(error) => {
            error!(%error, "invalid --default-permissions");
            return ExitCode::from(2);
        }
    };

    let config = match Config::from_limits(
        args.connection_timeout,
        args.max_connections as usize,
        args.max_command_list_size,
        args.max_output_buffer_size,
    ) {
        Ok(c) => c.with_default_permissions(permissions),
        Err(error) => {
            error!(%error, "invalid configuration");
            return ExitCode::from(2);
        }
    };

    let mut listener = Listener::new();
    if let Err(error) = listener.bind_tcp(args.listen) {
        error!(%error, addr = %args.listen, "failed to listen");
        return ExitCode::from(111);
    }
    if let Some(path) = &args.socket {
        if let Err(error) = listener.bind_unix(path) {
            error!(%error, path = %path.display(), "failed to listen");
            return ExitCode::from(111);
        }
    }

    let mut manager = match ClientManager::new(config, listener) {
        Ok(m) => m,
        Err(error) => {
            error!(%error, "failed to set up the reactor");
            return ExitCode::FAILURE;
        }
    };

    for signal in [SIGINT, SIGTERM] {
        let notify = manager.notify_handle();
        if let Err(error) = unsafe { low_level::register(signal, move || notify.shutdown()) } {
            error!(%error, signal, "failed to register signal handler");
            return ExitCode::FAILURE;
        }
    }

    let mut handler = Interpreter;
    match manager.run(&mut handler) {
        Ok(()) => {
            info!("bye");
            ExitCode::SUCCESS
        }
        Err(error) => {
            error!(%error, "reactor failed");
            ExitCode::FAILURE
        }
    }
}
