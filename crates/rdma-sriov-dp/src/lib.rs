pub mod app;
pub mod config;
pub mod device_plugin;
pub mod inventory;
pub mod sriov;
