use anyhow::{Context, Result};
use clap::Parser;
use lib_common::core::next_update;
use std::io::Read;
use std::net::TcpStream;

/// Subscriber client: prints every update an endpoint sends.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Monitor host
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Subscription endpoint port
    #[arg(short, long)]
    port: u16,

    /// Exit after this many updates
    #[arg(short, long)]
    count: Option<u64>,
}

fn main() -> Result<()> {
    let args = Args::parse();
    let mut stream = TcpStream::connect((args.host.as_str(), args.port))
        .with_context(|| format!("Failed to connect to {}:{}", args.host, args.port))?;

    let mut pending: Vec<u8> = Vec::new();
    let mut chunk = [0u8; 1024];
    let mut received = 0u64;

    loop {
        let n = stream.read(&mut chunk)?;
        if n == 0 {
            println!("endpoint closed after {} updates", received);
            return Ok(());
        }
        pending.extend_from_slice(&chunk[..n]);

        while let Some(update) = next_update(&mut pending) {
            match update {
                Ok(reading) => {
                    println!("{}:{} = {}", reading.resource, reading.metric, reading.value);
                    received += 1;
                }
                Err(e) => eprintln!("malformed update: {}", e),
            }
            if args.count.is_some_and(|count| received >= count) {
                return Ok(());
            }
        }
    }
}
