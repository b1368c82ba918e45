use std::collections::BTreeMap;
use std::path::Path;

use log::{error, info};
use tokio::process::Command;

use crate::errors::VmError;
use crate::virsh::models::{
    self, DiskAttachment, DiskDef, DomResources, GuestInterface, Instances, NicDef, ResourceScope,
    VmState,
};
use crate::virsh::Hypervisor;

/// Hypervisor driver backed by the virsh and qemu-img command-line tools.
/// Every call shells out and parses the output; a non-zero exit is a driver
/// failure carrying the command and its stderr.
pub struct VirshClient;

impl VirshClient {
    pub fn new() -> Self {
        VirshClient
    }

    async fn run(&self, program: &str, args: &[&str]) -> Result<String, VmError> {
        info!("Running {} {}", program, args.join(" "));
        let output = Command::new(program)
            .args(args)
            .output()
            .await
            .map_err(|e| VmError::Driver(format!("failed to run {program}: {e}")))?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            error!(
                "Command failed: {} {} (exit {:?}): {}",
                program,
                args.join(" "),
                output.status.code(),
                stderr.trim()
            );
            return Err(VmError::Driver(format!(
                "{program} {} failed: {}",
                args.join(" "),
                stderr.trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    async fn virsh(&self, args: &[&str]) -> Result<String, VmError> {
        self.run("virsh", args).await
    }
}

impl Default for VirshClient {
    fn default() -> Self {
        Self::new()
    }
}

impl Hypervisor for VirshClient {
    async fn instances(&self) -> Result<Instances, VmError> {
        let output = self.virsh(&["list", "--all"]).await?;
        Ok(models::parse_instances(&output))
    }

    async fn state(&self, vm: &str) -> Result<VmState, VmError> {
        let output = self.virsh(&["dominfo", vm]).await?;
        models::parse_state(&output)
            .ok_or_else(|| VmError::Driver(format!("no state reported for VM {vm}")))
    }

    async fn start(&self, vm: &str) -> Result<(), VmError> {
        self.virsh(&["start", vm]).await.map(|_| ())
    }

    async fn shutdown(&self, vm: &str) -> Result<(), VmError> {
        self.virsh(&["shutdown", vm]).await.map(|_| ())
    }

    async fn destroy(&self, vm: &str) -> Result<(), VmError> {
        self.virsh(&["destroy", vm]).await.map(|_| ())
    }

    async fn reboot(&self, vm: &str) -> Result<(), VmError> {
        self.virsh(&["reboot", vm]).await.map(|_| ())
    }

    async fn reset(&self, vm: &str) -> Result<(), VmError> {
        self.virsh(&["reset", vm]).await.map(|_| ())
    }

    async fn undefine(&self, vm: &str) -> Result<(), VmError> {
        self.virsh(&["undefine", vm]).await.map(|_| ())
    }

    async fn disks(&self, vm: &str) -> Result<Vec<DiskDef>, VmError> {
        let output = self.virsh(&["domblklist", vm]).await?;
        Ok(models::parse_domblklist(&output))
    }

    async fn attach_disk(
        &self,
        vm: &str,
        attachment: &DiskAttachment,
        live: bool,
    ) -> Result<(), VmError> {
        let path = attachment.path.display().to_string();
        let mut args = vec![
            "attach-disk",
            vm,
            &path,
            "--driver",
            "qemu",
            "--subdriver",
            "qcow2",
            "--cache",
            "none",
            "--serial",
            &attachment.serial,
            "--target",
            &attachment.target,
            "--targetbus",
            "scsi",
            "--persistent",
        ];
        if live {
            args.push("--live");
        }
        self.virsh(&args).await.map(|_| ())
    }

    async fn detach_disk(&self, vm: &str, target: &str, live: bool) -> Result<(), VmError> {
        let mut args = vec!["detach-disk", vm, target, "--config"];
        if live {
            args.push("--live");
        }
        self.virsh(&args).await.map(|_| ())
    }

    async fn interfaces(&self, vm: &str) -> Result<Vec<NicDef>, VmError> {
        let output = self.virsh(&["domiflist", vm]).await?;
        Ok(models::parse_domiflist(&output))
    }

    async fn guest_interfaces(&self, vm: &str) -> Result<BTreeMap<u32, GuestInterface>, VmError> {
        let output = self.virsh(&["guestinfo", vm, "--interface"]).await?;
        Ok(models::parse_guestinfo(&output))
    }

    async fn attach_interface(&self, vm: &str, bridge: &str, live: bool) -> Result<(), VmError> {
        let mut args = vec![
            "attach-interface",
            vm,
            "--type",
            "bridge",
            "--source",
            bridge,
            "--model",
            "virtio",
            "--config",
        ];
        if live {
            args.push("--live");
        }
        self.virsh(&args).await.map(|_| ())
    }

    async fn detach_interface(&self, vm: &str, mac: &str, live: bool) -> Result<(), VmError> {
        let mut args = vec!["detach-interface", vm, "bridge", "--mac", mac, "--config"];
        if live {
            args.push("--live");
        }
        self.virsh(&args).await.map(|_| ())
    }

    async fn resources(&self, vm: &str) -> Result<DomResources, VmError> {
        let output = self.virsh(&["dominfo", vm]).await?;
        models::parse_resources(&output)
            .ok_or_else(|| VmError::Driver(format!("no resource info reported for VM {vm}")))
    }

    async fn set_vcpus(&self, vm: &str, count: u32, scope: ResourceScope) -> Result<(), VmError> {
        let count = count.to_string();
        let mut args = vec!["setvcpus", vm, &count, "--config"];
        if scope == ResourceScope::Maximum {
            args.push("--maximum");
        }
        self.virsh(&args).await.map(|_| ())
    }

    async fn set_memory(&self, vm: &str, mib: u64, scope: ResourceScope) -> Result<(), VmError> {
        let size = format!("{mib}M");
        let args = match scope {
            ResourceScope::Maximum => vec!["setmaxmem", vm, &size, "--config"],
            ResourceScope::Current => vec!["setmem", vm, &size, "--config"],
        };
        self.virsh(&args).await.map(|_| ())
    }

    async fn create_volume(&self, path: &Path, bytes: u64) -> Result<(), VmError> {
        let path = path.display().to_string();
        let size = bytes.to_string();
        self.run("qemu-img", &["create", "-f", "qcow2", &path, &size])
            .await
            .map(|_| ())
    }

    async fn grow_volume(&self, path: &Path, delta: u64) -> Result<(), VmError> {
        let path = path.display().to_string();
        let delta = format!("+{delta}");
        self.run("qemu-img", &["resize", &path, &delta])
            .await
            .map(|_| ())
    }

    async fn volume_size(&self, path: &Path) -> Result<u64, VmError> {
        let path_str = path.display().to_string();
        let output = self
            .run("qemu-img", &["info", "--output=json", &path_str])
            .await?;
        let info: serde_json::Value = serde_json::from_str(&output)
            .map_err(|e| VmError::Driver(format!("unparseable qemu-img info for {path_str}: {e}")))?;
        info["virtual-size"]
            .as_u64()
            .ok_or_else(|| VmError::Driver(format!("no virtual-size reported for {path_str}")))
    }
}
