use std::{error::Error, net::SocketAddr, sync::mpsc, time::Duration};

use clap::Parser;
use log::info;
use serde_json::Value;
use wirecall::protocol::{ByteStream, HandlerError, Reply, Server, ServerConfig};

#[derive(Debug, Parser)]
#[command(version, about = "Serve the demo handlers over wirecall", long_about = None)]
struct Cli {
    /// Listen for new connections at address
    address: SocketAddr,
    /// Number of worker threads
    #[arg(long, default_value_t = 16)]
    workers: usize,
    /// Close connections idle for this many seconds
    #[arg(long)]
    idle_timeout: Option<u64>,
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let cli = Cli::parse();
    let config = ServerConfig {
        workers: cli.workers,
        idle_timeout: cli.idle_timeout.map(Duration::from_secs),
        ..ServerConfig::default()
    };

    let mut server = Server::bind(cli.address, config)?;
    server
        .handle("echo", |data, _, _| Ok(Reply::Data(data)))
        .handle("upper", |data, _, _| {
            let text = data
                .get("text")
                .and_then(Value::as_str)
                .ok_or_else(|| HandlerError::new("expected a 'text' field"))?;
            Ok(Reply::Stream(ByteStream::from(text.to_uppercase().into_bytes())))
        })
        .handle("fail", |data, _, _| {
            let message = data.as_str().unwrap_or("requested failure");
            Err(HandlerError::new(message))
        });

    let handle = server.spawn()?;
    println!("listening at {}", handle.local_addr());

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })?;
    rx.recv()?;

    info!("interrupted, shutting down");
    handle.stop()?;
    Ok(())
}
