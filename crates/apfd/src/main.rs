mod cli;
mod daemon;
mod error;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use apf_session::Session;
use mei::{MeiDevice, LME_GUID};

use crate::cli::Cli;
use crate::daemon::Apfd;

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let cli = Cli::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    if let Err(e) = run(cli).await {
        error!("{e}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> error::Result<()> {
    let mut device = MeiDevice::open(&cli.mei_device, &LME_GUID)?;
    info!(
        device = %cli.mei_device.display(),
        max_msg_length = device.max_msg_length(),
        protocol_version = device.protocol_version(),
        "connected to LME"
    );
    device.set_nonblocking(true)?;

    let daemon = Apfd::new(Session::new(device), cli.listen_addr, cli.allowed_port_set())?;
    daemon.run().await
}
