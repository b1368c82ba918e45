use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::path::Path;

use log::info;
use serde::Serialize;
use serde_json::json;
use uuid::Uuid;

use crate::ansible::Automation;
use crate::config::Config;
use crate::confirm::Confirm;
use crate::errors::VmError;
use crate::power::PowerController;
use crate::resolve;
use crate::units::{format_size, parse_size};
use crate::virsh::{vm_running, DiskAttachment, DiskDef, Hypervisor};
use crate::wait;

pub const DEFAULT_SIZE: &str = "1G";
pub const DEFAULT_FILESYSTEM: &str = "ext4";

/// Command-surface view of one disk, keyed by its (volatile) target label.
#[derive(Debug, Clone, Serialize)]
pub struct DiskView {
    pub location: String,
    pub serial: String,
    pub size_bytes: u64,
    pub size: String,
}

/// Creates, attaches, detaches and grows virtual disks, delegating all
/// in-guest work (partitioning, formatting, mounting, growing filesystems)
/// to the automation runner once the VM is reachable.
pub struct DiskManager<'a, H, A, C> {
    driver: &'a H,
    runner: &'a A,
    confirm: &'a C,
    config: &'a Config,
}

impl<'a, H: Hypervisor, A: Automation, C: Confirm> DiskManager<'a, H, A, C> {
    pub fn new(driver: &'a H, runner: &'a A, confirm: &'a C, config: &'a Config) -> Self {
        DiskManager {
            driver,
            runner,
            confirm,
            config,
        }
    }

    /// Create a backing image, attach it, and (when the VM is running)
    /// partition, format and persistently mount it by UUID. When the VM is
    /// off the disk stays attached but unformatted until the next boot's
    /// provisioning pass. Returns the assigned target label.
    pub async fn add(
        &self,
        vm: &str,
        name: Option<&str>,
        size: &str,
        filesystem: &str,
        mount_point: Option<&str>,
    ) -> Result<String, VmError> {
        let running = vm_running(self.driver, vm).await?;
        let bytes = parse_size(size)?;
        let name = match name {
            Some(name) => name.to_string(),
            None => format!("data-{}", &Uuid::new_v4().simple().to_string()[..8]),
        };
        let image = self.config.vm_path(vm).join(format!("{name}.qcow2"));
        if image.exists() {
            return Err(VmError::InvalidInput(format!(
                "disk image {} already exists",
                image.display()
            )));
        }
        let serial = resolve::disk_serial(vm, &name);

        info!("Creating data disk {name} ({bytes} bytes) for VM {vm}");
        self.driver.create_volume(&image, bytes).await?;
        let disks = self.driver.disks(vm).await?;
        let target = next_target(&disks)?;
        let attachment = DiskAttachment {
            path: image,
            target: target.clone(),
            serial: serial.clone(),
        };
        self.driver.attach_disk(vm, &attachment, running).await?;

        if running {
            let ip = wait::wait_ready(self.driver, vm, self.config.ssh_port).await?;
            let mount_point = match mount_point {
                Some(mp) => mp.to_string(),
                None => format!("/mnt/{name}"),
            };
            // The playbook resolves the by-id link in-guest, creates one
            // primary partition spanning the disk, formats it, and records
            // a UUID-keyed fstab entry with fail-soft options.
            self.runner
                .run_playbook(
                    ip,
                    "provision-disk",
                    json!({
                        "device": resolve::disk_by_id(&serial),
                        "fs_type": filesystem,
                        "mount_point": mount_point,
                    }),
                )
                .await?
                .ensure_ok("provision-disk")?;
            info!("Disk {target} mounted at {mount_point} on VM {vm}");
        } else {
            info!("VM {vm} is not running; disk {target} will be provisioned on next boot");
        }
        Ok(target)
    }

    /// Each disk's location, serial and size. ISO media are not disks and
    /// are skipped.
    pub async fn list(&self, vm: &str) -> Result<BTreeMap<String, DiskView>, VmError> {
        vm_running(self.driver, vm).await?;
        let mut views = BTreeMap::new();
        for disk in self.driver.disks(vm).await? {
            if disk.source.ends_with(".iso") {
                continue;
            }
            let size_bytes = self.driver.volume_size(Path::new(&disk.source)).await?;
            let serial = resolve::disk_serial(vm, resolve::source_stem(&disk.source));
            views.insert(
                disk.target,
                DiskView {
                    location: disk.source,
                    serial,
                    size_bytes,
                    size: format_size(size_bytes),
                },
            );
        }
        Ok(views)
    }

    /// Unmount (if mounted), detach, and delete the backing image. The
    /// unmount always happens strictly before the detach. Prompts up front
    /// unless forced; declining leaves the disk untouched.
    pub async fn remove(&self, vm: &str, target: &str, force: bool) -> Result<(), VmError> {
        let running = vm_running(self.driver, vm).await?;
        let disk = self.find_disk(vm, target).await?;
        let stem = resolve::source_stem(&disk.source);
        if stem == "boot" {
            return Err(VmError::InvalidInput(format!(
                "refusing to remove the boot disk of VM {vm}"
            )));
        }
        if !force
            && !self.confirm.confirm(&format!(
                "Remove disk {target} from VM {vm} and delete {}? This cannot be undone.",
                disk.source
            ))
        {
            return Err(VmError::UserAborted(format!(
                "removal of disk {target} from VM {vm} declined"
            )));
        }
        let serial = resolve::disk_serial(vm, stem);
        if running {
            let ip = wait::wait_ready(self.driver, vm, self.config.ssh_port).await?;
            self.unmount_device(ip, &serial).await?;
        }
        self.driver.detach_disk(vm, target, running).await?;
        tokio::fs::remove_file(&disk.source).await?;
        info!("Deleted backing image {}", disk.source);
        Ok(())
    }

    /// Unmount a disk and drop its persistent-mount entry without detaching.
    pub async fn unmount(&self, vm: &str, target: &str) -> Result<(), VmError> {
        let (disk, ip) = self.find_live_disk(vm, target, "unmount a disk").await?;
        let serial = resolve::disk_serial(vm, resolve::source_stem(&disk.source));
        self.unmount_device(ip, &serial).await
    }

    /// Mount a disk back, optionally at a new mount point.
    pub async fn remount(
        &self,
        vm: &str,
        target: &str,
        mount_point: Option<&str>,
    ) -> Result<(), VmError> {
        let (disk, ip) = self.find_live_disk(vm, target, "remount a disk").await?;
        let stem = resolve::source_stem(&disk.source);
        let serial = resolve::disk_serial(vm, stem);
        let mount_point = match mount_point {
            Some(mp) => mp.to_string(),
            None => format!("/mnt/{stem}"),
        };
        self.runner
            .run_playbook(
                ip,
                "mount-disk",
                json!({
                    "device": resolve::disk_by_id(&serial),
                    "mount_point": mount_point,
                }),
            )
            .await?
            .ensure_ok("mount-disk")?;
        info!("Disk {target} mounted at {mount_point} on VM {vm}");
        Ok(())
    }

    /// Grow the backing image by `delta`, then the partition, then the
    /// filesystem. Requires the VM stopped; a running VM is stopped after a
    /// prompt (or automatically when forced). Existing data survives every
    /// step.
    pub async fn increase_size(
        &self,
        vm: &str,
        target: &str,
        delta: &str,
        force: bool,
    ) -> Result<(), VmError> {
        let running = vm_running(self.driver, vm).await?;
        let disk = self.find_disk(vm, target).await?;
        let delta_bytes = parse_size(delta)?;
        if delta_bytes == 0 {
            return Err(VmError::InvalidInput("size delta must be non-zero".to_string()));
        }
        let power = PowerController::new(self.driver, self.confirm, self.config);
        if running {
            if !force
                && !self.confirm.confirm(&format!(
                    "VM {vm} must be powered off to resize {target}. Stop it now?"
                ))
            {
                return Err(VmError::UserAborted(format!(
                    "resize of disk {target} on running VM {vm} declined"
                )));
            }
            power.stop(vm).await?;
        }

        info!("Growing {} by {delta_bytes} bytes", disk.source);
        self.driver
            .grow_volume(Path::new(&disk.source), delta_bytes)
            .await?;

        let ip = match power.start(vm).await? {
            Some(ip) => ip,
            None => wait::wait_ready(self.driver, vm, self.config.ssh_port).await?,
        };
        let serial = resolve::disk_serial(vm, resolve::source_stem(&disk.source));
        let device = resolve::resolve_disk(self.runner, ip, &serial).await?;
        self.runner
            .run_playbook(
                ip,
                "grow-partition",
                json!({ "device": device, "partition": 1 }),
            )
            .await?
            .ensure_ok("grow-partition")?;
        self.grow_filesystem(ip, &device).await?;
        info!("Grew disk {target} on VM {vm} by {delta_bytes} bytes");
        Ok(())
    }

    /// Detect the filesystem on the first partition and dispatch the
    /// family-specific grow command.
    async fn grow_filesystem(&self, ip: Ipv4Addr, device: &str) -> Result<(), VmError> {
        let part = partition_path(device);
        let fs_type = self
            .runner
            .run_command(ip, &format!("lsblk -no FSTYPE {part}"))
            .await?;
        match fs_type.trim() {
            "ext2" | "ext3" | "ext4" => {
                self.runner
                    .run_command(ip, &format!("resize2fs {part}"))
                    .await?;
            }
            "xfs" => {
                let mount = self
                    .runner
                    .run_command(ip, &format!("lsblk -no MOUNTPOINT {part}"))
                    .await?;
                let mount = mount.trim().to_string();
                if mount.is_empty() {
                    return Err(VmError::Driver(format!(
                        "xfs filesystem on {part} is not mounted; cannot grow"
                    )));
                }
                self.runner
                    .run_command(ip, &format!("xfs_growfs {mount}"))
                    .await?;
            }
            other => {
                return Err(VmError::Driver(format!(
                    "cannot grow unsupported filesystem '{other}' on {part}"
                )));
            }
        }
        Ok(())
    }

    async fn unmount_device(&self, ip: Ipv4Addr, serial: &str) -> Result<(), VmError> {
        self.runner
            .run_playbook(
                ip,
                "unmount-disk",
                json!({ "device": resolve::disk_by_id(serial) }),
            )
            .await?
            .ensure_ok("unmount-disk")
    }

    async fn find_disk(&self, vm: &str, target: &str) -> Result<DiskDef, VmError> {
        self.driver
            .disks(vm)
            .await?
            .into_iter()
            .find(|d| d.target == target)
            .ok_or_else(|| VmError::disk_not_found(target))
    }

    /// Resolve target on a VM that must be running (for in-guest work).
    async fn find_live_disk(
        &self,
        vm: &str,
        target: &str,
        op: &str,
    ) -> Result<(DiskDef, Ipv4Addr), VmError> {
        let instances = self.driver.instances().await?;
        if !instances.contains(vm) {
            return Err(VmError::vm_not_found(vm));
        }
        if !instances.is_running(vm) {
            return Err(VmError::StateConflict {
                vm: vm.to_string(),
                op: op.to_string(),
                required: "running",
                actual: instances.state_label(vm).to_string(),
            });
        }
        let disk = self.find_disk(vm, target).await?;
        let ip = wait::wait_ready(self.driver, vm, self.config.ssh_port).await?;
        Ok((disk, ip))
    }
}

/// Next free sdX target after the highest currently attached one.
fn next_target(disks: &[DiskDef]) -> Result<String, VmError> {
    let mut targets: Vec<&str> = disks.iter().map(|d| d.target.as_str()).collect();
    targets.sort_unstable();
    match targets.last() {
        None => Ok("sda".to_string()),
        Some(last) => {
            let last = last.to_lowercase();
            let tail = last.chars().last().unwrap_or('a');
            if tail == 'z' {
                return Err(VmError::Driver("no scsi targets left".to_string()));
            }
            Ok(format!("{}{}", &last[..last.len() - 1], (tail as u8 + 1) as char))
        }
    }
}

fn partition_path(device: &str) -> String {
    // /dev/sdb -> /dev/sdb1, /dev/nvme0n1 -> /dev/nvme0n1p1
    if device.ends_with(|c: char| c.is_ascii_digit()) {
        format!("{device}p1")
    } else {
        format!("{device}1")
    }
}
