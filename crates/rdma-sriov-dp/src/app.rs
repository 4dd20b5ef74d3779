use anyhow::Context;
use anyhow::Result;

use crate::config::Cli;
use crate::device_plugin::RdmaSriovDevicePlugin;
use crate::inventory::build_inventory;
use crate::sriov::SysfsProvisioner;

/// Provision the configured PFs, serve the device plugin until a shutdown
/// signal arrives, then stop it.
pub async fn run(cli: Cli) -> Result<()> {
    let pf_netdevices = cli.pf_netdevices();
    let provisioner = SysfsProvisioner::new(&cli.sysfs_root, &cli.ip_command);

    // sysfs writes and `ip` invocations block
    let devices = tokio::task::spawn_blocking(move || build_inventory(&provisioner, &pf_netdevices))
        .await
        .context("inventory build task failed")?;
    tracing::info!("discovered {} SR-IOV device(s)", devices.len());

    let device_plugin = RdmaSriovDevicePlugin::new(
        cli.resource_name.clone(),
        cli.socket_path(),
        cli.device_dir.clone(),
        devices,
    );
    device_plugin.serve(&cli.kubelet_socket).await?;

    wait_for_shutdown_signal().await?;

    device_plugin.stop().await
}

async fn wait_for_shutdown_signal() -> Result<()> {
    use tokio::signal::unix::signal;
    use tokio::signal::unix::SignalKind;

    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    tokio::select! {
        _ = sigterm.recv() => {
            tracing::info!("Received SIGTERM, initiating graceful shutdown");
        }
        _ = sigint.recv() => {
            tracing::info!("Received SIGINT, initiating graceful shutdown");
        }
    }
    Ok(())
}
