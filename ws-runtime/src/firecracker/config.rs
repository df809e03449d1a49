//! Firecracker `--config-file` document.
//!
//! Only the sections a workspace VM needs are modelled: boot source, one root
//! drive, machine sizing and one network interface.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use ws_network::SlotAllocation;

const BASE_BOOT_ARGS: &str = "console=ttyS0 reboot=k panic=1 pci=off";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BootSource {
    pub kernel_image_path: PathBuf,
    pub boot_args: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Drive {
    pub drive_id: String,
    pub path_on_host: PathBuf,
    pub is_root_device: bool,
    pub is_read_only: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MachineConfig {
    pub vcpu_count: u8,
    pub mem_size_mib: u32,
    pub smt: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkInterface {
    pub iface_id: String,
    pub guest_mac: String,
    pub host_dev_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct VmConfigFile {
    pub boot_source: BootSource,
    pub drives: Vec<Drive>,
    pub machine_config: MachineConfig,
    pub network_interfaces: Vec<NetworkInterface>,
}

/// Kernel command line carrying the guest's static network settings.
///
/// The gateway is the host side of the /30, i.e. the TAP address.
pub fn boot_args(slot: &SlotAllocation) -> String {
    format!(
        "{} ws.guest_ip={} ws.gateway_ip={} ws.netmask={}",
        BASE_BOOT_ARGS, slot.guest_ip, slot.tap_ip, slot.mask
    )
}

impl VmConfigFile {
    pub fn new(
        kernel: &Path,
        rootfs: &Path,
        slot: &SlotAllocation,
        vcpu_count: u8,
        mem_size_mib: u32,
    ) -> Self {
        Self {
            boot_source: BootSource {
                kernel_image_path: kernel.to_path_buf(),
                boot_args: boot_args(slot),
            },
            drives: vec![Drive {
                drive_id: "rootfs".to_string(),
                path_on_host: rootfs.to_path_buf(),
                is_root_device: true,
                is_read_only: false,
            }],
            machine_config: MachineConfig {
                vcpu_count,
                mem_size_mib,
                smt: false,
            },
            network_interfaces: vec![NetworkInterface {
                iface_id: "eth0".to_string(),
                guest_mac: slot.guest_mac.clone(),
                host_dev_name: slot.tap_name.clone(),
            }],
        }
    }
}
