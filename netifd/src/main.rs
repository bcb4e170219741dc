//! Entry point: parses the CLI, wires a [`netifd::daemon::Daemon`] to a
//! real [`DummyBackend`] and [`ProcessHotplugRunner`], and dispatches on
//! the requested subcommand.

use std::path::Path;
use std::sync::Arc;

use clap::Parser;
use netifd_core::hotplug::ProcessHotplugRunner;
use netifd_core::system::DummyBackend;
use tracing::info;

use netifd::cli::{Cli, Commands};
use netifd::config::{ConfigSource, FileConfigSource};
use netifd::daemon::Daemon;
use netifd::management::ManagementApi;
use netifd::{Error, Result};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let command = cli.command.clone().unwrap_or_default();

    if command == Commands::Serve {
        let log_dir = cli.resolv_conf.parent().unwrap_or_else(|| Path::new("/tmp")).join("log");
        netifd::logging::init_daemon(&log_dir)?;
    } else {
        netifd::logging::init_cli()?;
    }

    let hotplug_command = cli.script_dir.join("hotplug-call");
    let mut daemon = Daemon::new(
        Arc::new(DummyBackend),
        cli.script_dir.clone(),
        Arc::new(ProcessHotplugRunner::new(hotplug_command)),
        cli.resolv_conf.clone(),
        cli.socket.clone(),
    );

    let config = FileConfigSource::new(&cli.config);
    daemon.load_config(config.load()?)?;

    match command {
        Commands::Serve => {
            info!(socket = %daemon.socket_path().display(), "netifd starting");
            daemon.run().await?;
        }
        Commands::Status => {
            let status = serde_json::json!({
                "devices": daemon.devices().iter().map(|d| (d.name().to_string(), daemon.device_status(d.name()))).collect::<std::collections::HashMap<_, _>>(),
                "interfaces": daemon.interfaces().iter().map(|i| (i.name().to_string(), daemon.interface_status(i.name()))).collect::<std::collections::HashMap<_, _>>(),
            });
            println!("{}", serde_json::to_string_pretty(&status).map_err(|err| Error::Config {
                source: "<status>".to_string(),
                reason: err.to_string(),
            })?);
        }
        Commands::Up { iface } => daemon.interface_up(&iface)?,
        Commands::Down { iface } => daemon.interface_down(&iface)?,
        Commands::Reload => daemon.network_reload(&config)?,
    }

    Ok(())
}
