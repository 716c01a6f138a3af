//! Diagnostic dumper for the AMT Host Interface.
//!
//! Queries the local system account, the platform UUID, and the trusted root
//! certificate hash store, printing whatever the firmware is willing to
//! reveal. Each query failure is reported on its own; the dump continues.

use std::path::PathBuf;

use clap::Parser;
use tracing::{error, warn};
use tracing_subscriber::EnvFilter;

use amthi::{format_uuid_le, AmtHostInterface};

#[derive(Parser, Debug)]
#[command(name = "ahi-info")]
#[command(author, version, about = "Dump ME info over the AMT Host Interface")]
struct Cli {
    /// Path to the MEI character device
    #[arg(long = "mei_device", default_value = "/dev/mei0")]
    mei_device: PathBuf,

    /// Log level when RUST_LOG is unset (trace, debug, info, warn, error)
    #[arg(long = "log_level", default_value = "warn")]
    log_level: String,
}

fn main() {
    let cli = Cli::parse();

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&cli.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    if let Err(e) = run(&cli) {
        error!("{e}");
        std::process::exit(1);
    }
}

fn run(cli: &Cli) -> amthi::Result<()> {
    let mut ahi = AmtHostInterface::open(&cli.mei_device)?;

    match ahi.get_local_system_account() {
        Ok(account) => {
            println!("local system account: user={} password={}", account.username, account.password);
        }
        Err(e) => warn!(error = %e, "GetLocalSystemAccount failed"),
    }

    match ahi.get_uuid() {
        Ok(uuid) => println!("platform uuid: {}", format_uuid_le(&uuid)),
        Err(e) => warn!(error = %e, "GetUuid failed"),
    }

    match ahi.enumerate_hash_handles() {
        Ok(handles) => {
            println!("certificate hash entries: {}", handles.len());
            for handle in handles {
                match ahi.get_certificate_hash_entry(handle) {
                    Ok(entry) => println!(
                        "  [{handle:#06x}] {} {}={} {}{}",
                        entry.name,
                        entry.algorithm,
                        entry.hash_hex(),
                        if entry.is_active { "active" } else { "inactive" },
                        if entry.is_default { ", default" } else { "" },
                    ),
                    Err(e) => warn!(handle, error = %e, "GetCertificateHashEntry failed"),
                }
            }
        }
        Err(e) => warn!(error = %e, "EnumerateHashHandles failed"),
    }

    Ok(())
}
