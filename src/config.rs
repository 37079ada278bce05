use crate::messages::Address;
use crate::ring::DEFAULT_BITS;
use clap::Parser;
use std::{path::PathBuf, time::Duration};

/// A single DHT ring node
#[derive(Parser, Debug, Clone)]
#[command(version, about)]
pub struct Config {
    /// Host this node listens on and advertises to peers
    #[arg(long, default_value = "127.0.0.1")]
    pub host: String,

    /// Port to listen on, 0 picks a free one
    #[arg(short, long, default_value = "0")]
    pub port: u16,

    /// Any ring member to join through, as host:port. Omit to start a new ring
    #[arg(short, long)]
    pub join: Option<Address>,

    /// Bit width of the identifier space
    #[arg(short, long, default_value_t = DEFAULT_BITS,
          value_parser = clap::value_parser!(u32).range(1..=32))]
    pub bits: u32,

    /// How often the successor is pinged
    #[arg(long, default_value = "250")]
    pub ping_interval_ms: u64,

    /// How long to wait for a ping reply
    #[arg(long, default_value = "2000")]
    pub ping_timeout_ms: u64,

    /// Where the node's private <host>_<port> directory is created
    #[arg(long, default_value = ".")]
    pub data_dir: PathBuf,

    /// Where files named in a put are read from
    #[arg(long, default_value = ".")]
    pub source_dir: PathBuf,
}

impl Config {
    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }

    pub fn ping_timeout(&self) -> Duration {
        Duration::from_millis(self.ping_timeout_ms)
    }
}
