use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug, Clone)]
#[command(name = "apfd")]
#[command(
    author,
    version,
    about = "Forwards TCP ports from the host to Intel AMT via the MEI device"
)]
pub struct Cli {
    /// Path to the MEI character device
    #[arg(long = "mei_device", default_value = "/dev/mei0")]
    pub mei_device: PathBuf,

    /// IPv4 address granted forward ports are bound on
    #[arg(long = "listen_addr", default_value = "127.0.0.1")]
    pub listen_addr: Ipv4Addr,

    /// Ports the ME may ask us to forward (comma-separated)
    #[arg(long = "allowed_ports", value_delimiter = ',', default_value = "16992,16993")]
    pub allowed_ports: Vec<u16>,

    /// Log level when RUST_LOG is unset (trace, debug, info, warn, error)
    #[arg(long = "log_level", default_value = "info")]
    pub log_level: String,
}

impl Cli {
    /// The operator's port allowlist as a set.
    pub fn allowed_port_set(&self) -> HashSet<u16> {
        self.allowed_ports.iter().copied().collect()
    }
}
