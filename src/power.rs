use std::net::Ipv4Addr;

use log::{info, warn};

use crate::config::Config;
use crate::confirm::Confirm;
use crate::errors::VmError;
use crate::virsh::{Hypervisor, Instances};
use crate::wait;

/// Drives power-state transitions: start, stop (with escalation), reboot,
/// soft/hard reset and delete. Every operation re-reads live state before
/// acting; an interrupted wait leaves the VM mid-transition and the next
/// invocation picks up from whatever the hypervisor reports.
pub struct PowerController<'a, H, C> {
    driver: &'a H,
    confirm: &'a C,
    config: &'a Config,
}

impl<'a, H: Hypervisor, C: Confirm> PowerController<'a, H, C> {
    pub fn new(driver: &'a H, confirm: &'a C, config: &'a Config) -> Self {
        PowerController {
            driver,
            confirm,
            config,
        }
    }

    pub async fn list(&self) -> Result<Instances, VmError> {
        Ok(self.driver.instances().await?.sorted())
    }

    /// Start the VM and wait for readiness. Returns `None` when the VM was
    /// already running (no-op), otherwise the address the guest reported.
    pub async fn start(&self, vm: &str) -> Result<Option<Ipv4Addr>, VmError> {
        info!("Starting VM {vm}");
        let instances = self.driver.instances().await?;
        if !instances.contains(vm) {
            return Err(VmError::vm_not_found(vm));
        }
        if instances.is_running(vm) {
            info!("VM {vm} is already running");
            return Ok(None);
        }
        self.driver.start(vm).await?;
        let ip = wait::wait_ready(self.driver, vm, self.config.ssh_port).await?;
        Ok(Some(ip))
    }

    /// Graceful shutdown with convergence polling; escalates to a forced
    /// power-off when the grace bound expires. No-op if not running.
    pub async fn stop(&self, vm: &str) -> Result<(), VmError> {
        info!("Shutting down VM {vm}");
        let instances = self.driver.instances().await?;
        if !instances.contains(vm) {
            return Err(VmError::vm_not_found(vm));
        }
        if !instances.is_running(vm) {
            info!("VM {vm} is not running");
            return Ok(());
        }
        self.driver.shutdown(vm).await?;
        match wait::wait_until_stopped(self.driver, vm, wait::SHUTDOWN_GRACE).await {
            Ok(()) => Ok(()),
            Err(VmError::Timeout { .. }) => {
                warn!(
                    "VM {vm} failed to shut down within {:?}; forcing power off",
                    wait::SHUTDOWN_GRACE
                );
                self.force_stop(vm).await
            }
            Err(e) => Err(e),
        }
    }

    /// Immediate power-off. Not graceful; can lose unsynced guest data.
    pub async fn force_stop(&self, vm: &str) -> Result<(), VmError> {
        info!("Force shutting down VM {vm}");
        self.driver.destroy(vm).await?;
        wait::wait_until_stopped(self.driver, vm, wait::FORCE_GRACE).await
    }

    /// Hypervisor-level reboot signal followed by the readiness wait. Starts
    /// the VM instead if it is not running.
    pub async fn reboot(&self, vm: &str) -> Result<Ipv4Addr, VmError> {
        info!("Rebooting VM {vm}");
        let instances = self.driver.instances().await?;
        if !instances.contains(vm) {
            return Err(VmError::vm_not_found(vm));
        }
        if !instances.is_running(vm) {
            info!("VM {vm} is not running. Starting...");
            self.driver.start(vm).await?;
        } else {
            self.driver.reboot(vm).await?;
        }
        wait::wait_ready(self.driver, vm, self.config.ssh_port).await
    }

    /// Full graceful cycle: stop, then start with the readiness guarantee.
    pub async fn reset_soft(&self, vm: &str) -> Result<Ipv4Addr, VmError> {
        info!("Soft resetting VM {vm}");
        self.stop(vm).await?;
        match self.start(vm).await? {
            Some(ip) => Ok(ip),
            None => wait::wait_ready(self.driver, vm, self.config.ssh_port).await,
        }
    }

    /// Forced reset signal, no graceful shutdown attempted. Starts the VM
    /// instead if it is not running.
    pub async fn reset_hard(&self, vm: &str) -> Result<Ipv4Addr, VmError> {
        info!("Hard resetting VM {vm}");
        let instances = self.driver.instances().await?;
        if !instances.contains(vm) {
            return Err(VmError::vm_not_found(vm));
        }
        if !instances.is_running(vm) {
            info!("VM {vm} is not running. Starting...");
            self.driver.start(vm).await?;
        } else {
            self.driver.reset(vm).await?;
        }
        wait::wait_ready(self.driver, vm, self.config.ssh_port).await
    }

    /// Stop if needed, undefine, and remove the backing storage directory as
    /// one unit. Prompts up front unless forced; declining leaves the VM and
    /// its storage intact.
    pub async fn delete(&self, vm: &str, force: bool) -> Result<(), VmError> {
        info!("Deleting VM {vm}");
        if !force
            && !self
                .confirm
                .confirm(&format!("Delete VM {vm} and its backing storage?"))
        {
            return Err(VmError::UserAborted(format!("delete of VM {vm} declined")));
        }
        let instances = self.driver.instances().await?;
        if instances.contains(vm) {
            if instances.is_running(vm) {
                self.stop(vm).await?;
            }
            self.driver.undefine(vm).await?;
        }
        let dir = self.config.vm_path(vm);
        if dir.exists() {
            info!("Deleting VM directory {}", dir.display());
            tokio::fs::remove_dir_all(&dir).await?;
        }
        Ok(())
    }
}
