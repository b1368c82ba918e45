pub mod client;
pub mod models;

use std::collections::BTreeMap;
use std::path::Path;

use crate::errors::VmError;

pub use self::client::VirshClient;
pub use self::models::{
    DiskAttachment, DiskDef, DomResources, GuestInterface, Instances, NicDef, ResourceScope,
    VmState,
};

/// Narrow hypervisor capability injected into every controller. The real
/// implementation drives virsh/qemu-img; tests substitute a mock. The
/// hypervisor is the authoritative store for VM, disk and NIC state —
/// callers re-read through this interface before acting and never cache
/// device mappings across operations.
pub trait Hypervisor {
    async fn instances(&self) -> Result<Instances, VmError>;
    async fn state(&self, vm: &str) -> Result<VmState, VmError>;

    async fn start(&self, vm: &str) -> Result<(), VmError>;
    async fn shutdown(&self, vm: &str) -> Result<(), VmError>;
    async fn destroy(&self, vm: &str) -> Result<(), VmError>;
    async fn reboot(&self, vm: &str) -> Result<(), VmError>;
    async fn reset(&self, vm: &str) -> Result<(), VmError>;
    async fn undefine(&self, vm: &str) -> Result<(), VmError>;

    async fn disks(&self, vm: &str) -> Result<Vec<DiskDef>, VmError>;
    async fn attach_disk(
        &self,
        vm: &str,
        attachment: &DiskAttachment,
        live: bool,
    ) -> Result<(), VmError>;
    async fn detach_disk(&self, vm: &str, target: &str, live: bool) -> Result<(), VmError>;

    async fn interfaces(&self, vm: &str) -> Result<Vec<NicDef>, VmError>;
    async fn guest_interfaces(&self, vm: &str) -> Result<BTreeMap<u32, GuestInterface>, VmError>;
    async fn attach_interface(&self, vm: &str, bridge: &str, live: bool) -> Result<(), VmError>;
    async fn detach_interface(&self, vm: &str, mac: &str, live: bool) -> Result<(), VmError>;

    async fn resources(&self, vm: &str) -> Result<DomResources, VmError>;
    async fn set_vcpus(&self, vm: &str, count: u32, scope: ResourceScope) -> Result<(), VmError>;
    async fn set_memory(&self, vm: &str, mib: u64, scope: ResourceScope) -> Result<(), VmError>;

    async fn create_volume(&self, path: &Path, bytes: u64) -> Result<(), VmError>;
    async fn grow_volume(&self, path: &Path, delta: u64) -> Result<(), VmError>;
    async fn volume_size(&self, path: &Path) -> Result<u64, VmError>;
}

/// Re-read live state and report whether the VM is running. `NotFound` if
/// the hypervisor has no such VM.
pub async fn vm_running<H: Hypervisor>(driver: &H, vm: &str) -> Result<bool, VmError> {
    let instances = driver.instances().await?;
    if !instances.contains(vm) {
        return Err(VmError::vm_not_found(vm));
    }
    Ok(instances.is_running(vm))
}
