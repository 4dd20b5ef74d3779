use std::fs;
use std::io;
use std::path::Path;
use std::path::PathBuf;
use std::process::Command;

use error_stack::Report;
use error_stack::ResultExt;
use macaddr::MacAddr6;

use super::PfHandle;
use super::SriovError;
use super::SriovProvisioner;
use super::VfHandle;

/// [`SriovProvisioner`] backed by the kernel's sysfs interface and `ip link`.
#[derive(Debug, Clone)]
pub struct SysfsProvisioner {
    sysfs_root: PathBuf,
    ip_command: PathBuf,
}

impl Default for SysfsProvisioner {
    fn default() -> Self {
        Self::new("/sys", "ip")
    }
}

impl SysfsProvisioner {
    pub fn new(sysfs_root: impl Into<PathBuf>, ip_command: impl Into<PathBuf>) -> Self {
        Self {
            sysfs_root: sysfs_root.into(),
            ip_command: ip_command.into(),
        }
    }

    fn netdev_dir(&self, netdev: &str) -> PathBuf {
        self.sysfs_root.join("class/net").join(netdev)
    }

    fn pf_device_dir(&self, pf: &str) -> PathBuf {
        self.netdev_dir(pf).join("device")
    }

    fn vf_device_dir(&self, pf: &str, vf: &VfHandle) -> PathBuf {
        self.pf_device_dir(pf).join(format!("virtfn{}", vf.index))
    }

    fn pci_driver_dir(&self, driver: &str) -> PathBuf {
        self.sysfs_root.join("bus/pci/drivers").join(driver)
    }

    fn read_netdev_mac(&self, netdev: &str) -> Result<String, Report<SriovError>> {
        let address = fs::read_to_string(self.netdev_dir(netdev).join("address"))
            .change_context(SriovError::MacAddress {
                netdev: netdev.to_string(),
            })?;
        let address = address.trim();
        if address.is_empty() {
            return Err(Report::new(SriovError::MacAddress {
                netdev: netdev.to_string(),
            })
            .attach_printable("address attribute is empty"));
        }
        Ok(address.to_string())
    }

    fn configure_vf(
        &self,
        handle: &PfHandle,
        vf: &VfHandle,
        pf_mac: MacAddr6,
        pf_driver: Option<&str>,
        privileged: bool,
    ) -> io::Result<()> {
        let vf_device = self.vf_device_dir(&handle.pf_netdev, vf);
        let vf_driver = driver_name(&vf_device);

        if let Some(driver) = &vf_driver {
            tracing::debug!(vf = %vf.pci_address, driver = %driver, "unbinding VF");
            fs::write(self.pci_driver_dir(driver).join("unbind"), &vf.pci_address)?;
        }

        let mac = vf_mac(pf_mac, vf.index).to_string();
        let index = vf.index.to_string();
        let mut args = vec![
            "link",
            "set",
            handle.pf_netdev.as_str(),
            "vf",
            index.as_str(),
            "mac",
            mac.as_str(),
        ];
        if privileged {
            args.extend(["trust", "on"]);
        }
        self.run_ip(&args)?;

        if let Some(driver) = vf_driver.as_deref().or(pf_driver) {
            tracing::debug!(vf = %vf.pci_address, driver = %driver, "binding VF");
            fs::write(self.pci_driver_dir(driver).join("bind"), &vf.pci_address)?;
        }
        Ok(())
    }

    fn run_ip(&self, args: &[&str]) -> io::Result<()> {
        let output = Command::new(&self.ip_command).args(args).output()?;
        if !output.status.success() {
            return Err(io::Error::other(format!(
                "`{} {}` failed with {}: {}",
                self.ip_command.display(),
                args.join(" "),
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(())
    }
}

impl SriovProvisioner for SysfsProvisioner {
    fn enable_sriov(&self, pf: &str) -> Result<(), Report<SriovError>> {
        let device_dir = self.pf_device_dir(pf);

        let total_vfs = read_count(&device_dir.join("sriov_totalvfs"))
            .change_context(SriovError::Unsupported { pf: pf.to_string() })?;
        if total_vfs == 0 {
            return Err(Report::new(SriovError::Unsupported { pf: pf.to_string() })
                .attach_printable("device reports zero total VFs"));
        }

        let num_vfs_path = device_dir.join("sriov_numvfs");
        let num_vfs = read_count(&num_vfs_path)
            .change_context(SriovError::Enable { pf: pf.to_string() })?;
        if num_vfs > 0 {
            tracing::debug!(pf, num_vfs, "SR-IOV already enabled");
            return Ok(());
        }

        tracing::info!(pf, total_vfs, "enabling SR-IOV");
        fs::write(&num_vfs_path, total_vfs.to_string())
            .change_context(SriovError::Enable { pf: pf.to_string() })
            .attach_printable_lazy(|| format!("writing {}", num_vfs_path.display()))
    }

    fn pf_handle(&self, pf: &str) -> Result<PfHandle, Report<SriovError>> {
        let device_dir = self.pf_device_dir(pf);
        let context = || SriovError::Handle { pf: pf.to_string() };

        let mut vfs = Vec::new();
        for entry in fs::read_dir(&device_dir).change_context_lazy(context)? {
            let entry = entry.change_context_lazy(context)?;
            let name = entry.file_name();
            let Some(index) = name
                .to_str()
                .and_then(|name| name.strip_prefix("virtfn"))
                .and_then(|index| index.parse::<u32>().ok())
            else {
                continue;
            };

            let target = fs::read_link(entry.path()).change_context_lazy(context)?;
            let pci_address = target
                .file_name()
                .and_then(|name| name.to_str())
                .map(str::to_string)
                .ok_or_else(|| {
                    Report::new(context())
                        .attach_printable(format!("invalid VF link target {}", target.display()))
                })?;
            vfs.push(VfHandle { index, pci_address });
        }

        if vfs.is_empty() {
            return Err(Report::new(context()).attach_printable("no virtual functions found"));
        }
        vfs.sort_by_key(|vf| vf.index);

        Ok(PfHandle {
            pf_netdev: pf.to_string(),
            vfs,
        })
    }

    fn configure_vfs(&self, handle: &PfHandle, privileged: bool) -> Result<(), Report<SriovError>> {
        let context = || SriovError::ConfigureVfs {
            pf: handle.pf_netdev.clone(),
        };

        let pf_mac = self.read_netdev_mac(&handle.pf_netdev).change_context_lazy(context)?;
        let pf_mac = pf_mac
            .parse::<MacAddr6>()
            .change_context_lazy(context)
            .attach_printable_lazy(|| format!("invalid PF MAC address {pf_mac}"))?;
        let pf_driver = driver_name(&self.pf_device_dir(&handle.pf_netdev));

        for vf in &handle.vfs {
            self.configure_vf(handle, vf, pf_mac, pf_driver.as_deref(), privileged)
                .change_context_lazy(context)
                .attach_printable_lazy(|| format!("VF {} ({})", vf.index, vf.pci_address))?;
        }
        Ok(())
    }

    fn vf_netdev_name(
        &self,
        handle: &PfHandle,
        vf: &VfHandle,
    ) -> Result<String, Report<SriovError>> {
        let context = || SriovError::VfNetdev {
            pf: handle.pf_netdev.clone(),
            index: vf.index,
        };

        let net_dir = self.vf_device_dir(&handle.pf_netdev, vf).join("net");
        let entry = fs::read_dir(&net_dir)
            .change_context_lazy(context)?
            .next()
            .ok_or_else(|| Report::new(context()).attach_printable("VF has no netdev"))?
            .change_context_lazy(context)?;

        entry
            .file_name()
            .into_string()
            .map_err(|name| Report::new(context()).attach_printable(format!("{name:?}")))
    }

    fn vf_mac_address(&self, vf_netdev: &str) -> Result<String, Report<SriovError>> {
        self.read_netdev_mac(vf_netdev)
    }
}

fn read_count(path: &Path) -> io::Result<u32> {
    fs::read_to_string(path)?
        .trim()
        .parse()
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

/// Name of the driver a PCI device directory is bound to, if any.
fn driver_name(device_dir: &Path) -> Option<String> {
    let target = fs::read_link(device_dir.join("driver")).ok()?;
    target.file_name()?.to_str().map(str::to_string)
}

/// Locally administered unicast address, stable for a given PF and VF index.
fn vf_mac(pf_mac: MacAddr6, index: u32) -> MacAddr6 {
    let pf = pf_mac.as_bytes();
    MacAddr6::new(0x02, pf[3], pf[4], pf[5], (index >> 8) as u8, index as u8)
}
