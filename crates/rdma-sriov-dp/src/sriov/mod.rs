//! SR-IOV provisioning of physical network devices.
//!
//! Enabling SR-IOV and provisioning virtual functions touches host-wide state,
//! so the inventory builder only talks to the [`SriovProvisioner`] port. The
//! production adapter is [`SysfsProvisioner`].

use core::error::Error;

use error_stack::Report;

mod sysfs;

pub use sysfs::SysfsProvisioner;

/// A virtual function created on a physical device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VfHandle {
    /// index N of the `virtfnN` link below the PF device
    pub index: u32,
    /// PCI address of the VF, e.g. `0000:03:00.2`
    pub pci_address: String,
}

/// Configuration handle of an SR-IOV enabled physical device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PfHandle {
    pub pf_netdev: String,
    /// VFs ordered by index
    pub vfs: Vec<VfHandle>,
}

#[derive(Debug, derive_more::Display)]
pub enum SriovError {
    #[display("SR-IOV is not supported on netdev {pf}")]
    Unsupported { pf: String },
    #[display("failed to enable SR-IOV on netdev {pf}")]
    Enable { pf: String },
    #[display("failed to get PF handle for netdev {pf}")]
    Handle { pf: String },
    #[display("failed to configure VFs of netdev {pf}")]
    ConfigureVfs { pf: String },
    #[display("failed to resolve netdev of VF {index} on {pf}")]
    VfNetdev { pf: String, index: u32 },
    #[display("failed to read MAC address of netdev {netdev}")]
    MacAddress { netdev: String },
}

impl Error for SriovError {}

/// Host operations needed to turn a PF into a set of usable VFs.
pub trait SriovProvisioner: Send + Sync {
    /// Enable SR-IOV on `pf`, creating as many VFs as the device supports.
    fn enable_sriov(&self, pf: &str) -> Result<(), Report<SriovError>>;

    /// Get a handle listing the VFs of an SR-IOV enabled `pf`.
    fn pf_handle(&self, pf: &str) -> Result<PfHandle, Report<SriovError>>;

    /// Provision every VF of `handle`. `privileged` turns VF trust on.
    fn configure_vfs(&self, handle: &PfHandle, privileged: bool) -> Result<(), Report<SriovError>>;

    /// Network interface name of a provisioned VF.
    fn vf_netdev_name(&self, handle: &PfHandle, vf: &VfHandle)
        -> Result<String, Report<SriovError>>;

    /// Hardware address of the VF network interface `vf_netdev`.
    fn vf_mac_address(&self, vf_netdev: &str) -> Result<String, Report<SriovError>>;
}
