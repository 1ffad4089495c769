use std::{error::Error, io};

use clap::Parser;
use wirecall::{
    Client, ClientConfig, Command, Response, prompt,
    protocol::{Payload, PoolConfig, RetryPolicy},
};

#[derive(Parser)]
#[command(version, about = "Interactive wirecall client", long_about = None)]
struct Cli {
    /// Server address as host:port
    address: String,
    /// Maximum number of pooled connections
    #[arg(long, default_value_t = 10)]
    max_connections: usize,
    /// Retries for transactions hit by a dropped connection
    #[arg(long, default_value_t = 3)]
    retries: u32,
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let cli = Cli::parse();
    let config = ClientConfig {
        pool: PoolConfig {
            max_connections: cli.max_connections,
            ..PoolConfig::default()
        },
        retry: RetryPolicy {
            max_retries: cli.retries,
            ..RetryPolicy::default()
        },
    };
    let client = Client::new(&cli.address, config)?;

    let stdin = io::stdin();
    let stdout = io::stdout();
    loop {
        let cmd = match prompt(stdin.lock(), stdout.lock()) {
            Ok(cmd) => cmd,
            Err(e) => {
                eprintln!("error: {e}");
                continue;
            }
        };

        match cmd {
            Command::Exit => break,
            Command::Ping => match client.ping() {
                Ok(true) => println!("pong"),
                Ok(false) => println!("unexpected reply to ping"),
                Err(e) => eprintln!("error: {e}"),
            },
            Command::Call {
                handler,
                data,
                params,
            } => match client.send(&handler, data, params) {
                Ok(response) => print_response(response),
                Err(e) => eprintln!("error: {e}"),
            },
        }
    }

    Ok(())
}

fn print_response(response: Response) {
    let mut messages: Vec<_> = response.into_iter().collect();
    messages.sort_by(|a, b| a.0.cmp(&b.0));

    for (key, payload) in messages {
        match payload {
            Payload::Data(value) => println!("{key}: {value}"),
            Payload::Buffer(bytes) => println!("{key}: <{} bytes> {bytes:?}", bytes.len()),
            Payload::Stream(stream) => match stream.into_bytes() {
                Ok(body) => println!("{key}: {}", String::from_utf8_lossy(&body)),
                Err(e) => eprintln!("{key}: failed to read stream: {e}"),
            },
        }
    }
}
