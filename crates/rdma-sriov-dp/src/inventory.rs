//! Builds the advertised device list from the configured physical devices.

use std::collections::HashSet;

use error_stack::Report;

use crate::device_plugin::api::Device;
use crate::device_plugin::HEALTHY;
use crate::sriov::PfHandle;
use crate::sriov::SriovError;
use crate::sriov::SriovProvisioner;
use crate::sriov::VfHandle;

/// Configure SR-IOV on every PF in `pf_netdevices` and collect their VFs as
/// healthy devices identified by MAC address.
///
/// Provisioning is best effort: a PF that fails any step is logged and
/// contributes no devices, the remaining PFs are still processed in order.
pub fn build_inventory(
    provisioner: &dyn SriovProvisioner,
    pf_netdevices: &[String],
) -> Vec<Device> {
    let mut devices = Vec::new();

    if pf_netdevices.is_empty() {
        tracing::error!("empty or invalid PF netdevice configuration");
        return devices;
    }

    let mut seen = HashSet::new();
    for pf in pf_netdevices {
        tracing::info!(pf = %pf, "configuring SR-IOV");
        let handle = match configure_sriov(provisioner, pf) {
            Ok(handle) => handle,
            Err(report) => {
                tracing::error!(pf = %pf, "failed to configure SR-IOV: {report:?}");
                continue;
            }
        };

        for vf in &handle.vfs {
            let id = match vf_device_id(provisioner, &handle, vf) {
                Ok(id) => id,
                Err(report) => {
                    tracing::warn!(pf = %pf, vf = vf.index, "skipping VF: {report:?}");
                    continue;
                }
            };
            if !seen.insert(id.clone()) {
                tracing::warn!(pf = %pf, vf = vf.index, id = %id, "skipping VF with duplicate ID");
                continue;
            }
            devices.push(Device {
                id,
                health: HEALTHY.to_string(),
                topology: None,
            });
        }
    }

    devices
}

fn configure_sriov(
    provisioner: &dyn SriovProvisioner,
    pf: &str,
) -> Result<PfHandle, Report<SriovError>> {
    provisioner.enable_sriov(pf)?;
    let handle = provisioner.pf_handle(pf)?;
    provisioner.configure_vfs(&handle, true)?;
    Ok(handle)
}

fn vf_device_id(
    provisioner: &dyn SriovProvisioner,
    handle: &PfHandle,
    vf: &VfHandle,
) -> Result<String, Report<SriovError>> {
    let netdev = provisioner.vf_netdev_name(handle, vf)?;
    provisioner.vf_mac_address(&netdev)
}
