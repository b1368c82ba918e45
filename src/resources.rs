use log::info;
use serde::Serialize;

use crate::config::Config;
use crate::confirm::Confirm;
use crate::errors::VmError;
use crate::power::PowerController;
use crate::units::format_size;
use crate::virsh::{vm_running, Hypervisor, ResourceScope};

/// Command-surface view of a VM's compute allocation.
#[derive(Debug, Clone, Serialize)]
pub struct ResourceView {
    pub memory_bytes: u64,
    pub memory: String,
    pub cpu: u32,
}

/// Reads and rewrites CPU and memory allocations. Writes require the VM
/// stopped; a running VM is stopped after a prompt (or automatically when
/// forced) and started again once both scopes are written.
pub struct ResourceManager<'a, H, C> {
    driver: &'a H,
    confirm: &'a C,
    config: &'a Config,
}

impl<'a, H: Hypervisor, C: Confirm> ResourceManager<'a, H, C> {
    pub fn new(driver: &'a H, confirm: &'a C, config: &'a Config) -> Self {
        ResourceManager {
            driver,
            confirm,
            config,
        }
    }

    pub async fn list(&self, vm: &str) -> Result<ResourceView, VmError> {
        vm_running(self.driver, vm).await?;
        let resources = self.driver.resources(vm).await?;
        Ok(ResourceView {
            memory_bytes: resources.memory_bytes,
            memory: format_size(resources.memory_bytes),
            cpu: resources.cpu,
        })
    }

    /// Set CPU count and/or memory. Both the persisted maximum and the
    /// current value are written, maximum first, so the change is durable
    /// and takes effect on the restart this method performs.
    pub async fn set(
        &self,
        vm: &str,
        cpu: Option<u32>,
        memory_mb: Option<u64>,
        force: bool,
    ) -> Result<(), VmError> {
        if cpu.is_none() && memory_mb.is_none() {
            return Err(VmError::InvalidInput(
                "nothing to set: specify a CPU count, a memory size, or both".to_string(),
            ));
        }
        let was_running = vm_running(self.driver, vm).await?;
        let power = PowerController::new(self.driver, self.confirm, self.config);
        if was_running {
            if !force
                && !self.confirm.confirm(&format!(
                    "VM {vm} must be powered off to change its resources. Stop it now?"
                ))
            {
                return Err(VmError::UserAborted(format!(
                    "resource change on running VM {vm} declined"
                )));
            }
            power.stop(vm).await?;
        }

        if let Some(count) = cpu {
            info!("Setting VM {vm} to {count} vCPUs");
            self.driver
                .set_vcpus(vm, count, ResourceScope::Maximum)
                .await?;
            self.driver
                .set_vcpus(vm, count, ResourceScope::Current)
                .await?;
        }
        if let Some(mib) = memory_mb {
            info!("Setting VM {vm} to {mib} MiB of memory");
            self.driver
                .set_memory(vm, mib, ResourceScope::Maximum)
                .await?;
            self.driver
                .set_memory(vm, mib, ResourceScope::Current)
                .await?;
        }

        if was_running {
            power.start(vm).await?;
        }
        Ok(())
    }
}
