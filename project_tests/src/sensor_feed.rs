use anyhow::{Context, Result};
use clap::Parser;
use lib_common::core::SensorReading;
use rand::Rng;
use std::io::Write;
use std::net::TcpStream;
use std::thread::sleep;
use std::time::Duration;

/// Producer simulator: streams a random walk for one sensor to the monitor.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Monitor host
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Ingestion port
    #[arg(short, long, default_value_t = 12087)]
    port: u16,

    /// Resource name (e.g. the host being measured)
    #[arg(short, long)]
    resource: String,

    /// Metric name
    #[arg(short, long)]
    metric: String,

    /// Delay between readings in milliseconds
    #[arg(short, long, default_value_t = 1000)]
    interval_ms: u64,

    /// Number of readings to send (forever when omitted)
    #[arg(short, long)]
    count: Option<u64>,

    /// Starting value of the walk
    #[arg(long, default_value_t = 50.0)]
    start: f64,
}

fn main() -> Result<()> {
    let args = Args::parse();
    let mut stream = TcpStream::connect((args.host.as_str(), args.port))
        .with_context(|| format!("Failed to connect to {}:{}", args.host, args.port))?;
    stream.set_nodelay(true)?;

    let mut rng = rand::rng();
    let mut value = args.start;
    let mut sent = 0u64;

    while args.count.is_none_or(|count| sent < count) {
        let reading = SensorReading {
            resource: args.resource.clone(),
            metric: args.metric.clone(),
            value,
        };
        stream
            .write_all(reading.encode().as_bytes())
            .context("Monitor closed the connection")?;
        println!("sent {}", reading.encode().trim_end());

        sent += 1;
        value += rng.random_range(-1.0..=1.0);
        sleep(Duration::from_millis(args.interval_ms));
    }

    Ok(())
}
