use std::path::Path;
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use serde::Deserialize;
use serde::Serialize;
use utils::version;

/// Schedulable resource advertised to kubelet.
pub const RESOURCE_NAME: &str = "rdma/vhca";
/// Directory kubelet watches for device plugin sockets.
pub const DEVICE_PLUGIN_PATH: &str = "/var/lib/kubelet/device-plugins/";
pub const SOCKET_NAME: &str = "rdma-sriov-dp.sock";
pub const KUBELET_SOCKET: &str = "/var/lib/kubelet/device-plugins/kubelet.sock";
/// RDMA device nodes exposed to containers.
pub const RDMA_DEVICES: &str = "/dev/infiniband";

/// User supplied configuration file
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserConfig {
    /// physical network devices to enable SR-IOV on, e.g. ["ens1f0"]
    #[serde(default)]
    pub pf_netdevices: Vec<String>,
}

impl UserConfig {
    /// load the configuration from a JSON file
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        tracing::info!("loading configuration from {}", path.display());

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("failed to parse {}", path.display()))
    }
}

#[derive(Parser, Debug)]
#[command(about, long_about, version = &**version::VERSION)]
pub struct Cli {
    #[arg(
        long,
        env = "RDMA_SRIOV_DP_CONFIG",
        value_hint = clap::ValueHint::FilePath,
        default_value = "/k8s-rdma-sriov-dev-plugin/config.json",
        help = "Path of the JSON configuration listing PF netdevices"
    )]
    pub config: PathBuf,

    #[arg(
        long,
        env = "PF_NETDEVICES",
        value_delimiter = ',',
        help = "PF netdevices to configure, overrides the configuration file, e.g. ens1f0,ens1f1"
    )]
    pub pf_netdevices: Option<Vec<String>>,

    #[arg(long, default_value = RESOURCE_NAME, help = "Resource name advertised to kubelet")]
    pub resource_name: String,

    #[arg(
        long,
        env = "DEVICE_PLUGIN_PATH",
        default_value = DEVICE_PLUGIN_PATH,
        help = "Directory the device plugin socket is created in"
    )]
    pub device_plugin_dir: PathBuf,

    #[arg(long, default_value = SOCKET_NAME, help = "File name of the device plugin socket")]
    pub socket_name: String,

    #[arg(
        long,
        env = "KUBELET_SOCKET_PATH",
        default_value = KUBELET_SOCKET,
        help = "kubelet registration socket path"
    )]
    pub kubelet_socket: PathBuf,

    #[arg(
        long,
        default_value = RDMA_DEVICES,
        help = "Device directory exposed to allocated containers"
    )]
    pub device_dir: String,

    #[arg(long, default_value = "/sys", help = "sysfs mount point")]
    pub sysfs_root: PathBuf,

    #[arg(long, default_value = "ip", help = "iproute2 binary used to configure VFs")]
    pub ip_command: PathBuf,

    #[arg(
        long,
        env = "RDMA_SRIOV_DP_LOG_FILE",
        value_hint = clap::ValueHint::FilePath,
        help = "Also write logs to this file, rotated daily"
    )]
    pub log_file: Option<PathBuf>,
}

impl Cli {
    pub fn socket_path(&self) -> PathBuf {
        self.device_plugin_dir.join(&self.socket_name)
    }

    /// PF netdevices from the command line, or else from the configuration
    /// file. An unreadable file yields an empty list.
    pub fn pf_netdevices(&self) -> Vec<String> {
        if let Some(pf_netdevices) = &self.pf_netdevices {
            return pf_netdevices.clone();
        }

        match UserConfig::load(&self.config) {
            Ok(config) => config.pf_netdevices,
            Err(e) => {
                tracing::error!("invalid configuration: {e:#}");
                Vec::new()
            }
        }
    }
}
