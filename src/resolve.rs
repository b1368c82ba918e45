use std::collections::BTreeMap;
use std::net::Ipv4Addr;
use std::path::Path;

use crate::ansible::Automation;
use crate::errors::VmError;
use crate::virsh::{GuestInterface, NicDef};

/// Stable-by-identity symlink namespace QEMU exposes for SCSI disks attached
/// with an explicit serial.
const BY_ID_PREFIX: &str = "/dev/disk/by-id/scsi-0QEMU_QEMU_HARDDISK_";

/// Serial for a disk, derived from the VM name and the backing file stem
/// ("boot" for the boot disk, "data-<suffix>" for data disks). Unique within
/// a VM and never reused: a fresh disk always gets a fresh suffix.
pub fn disk_serial(vm: &str, stem: &str) -> String {
    format!("{vm}-{stem}")
}

/// File stem of a backing image path, the role half of the serial.
pub fn source_stem(source: &str) -> &str {
    Path::new(source)
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(source)
}

/// The stable in-guest symlink for a serial. Valid regardless of which sdX
/// letter the guest assigned this boot.
pub fn disk_by_id(serial: &str) -> String {
    format!("{BY_ID_PREFIX}{serial}")
}

/// Resolve a serial to the real device path inside the guest, at time of use.
/// Letter-based names shift across attach/detach/reboot, so the result must
/// never be cached across operations.
pub async fn resolve_disk<A: Automation>(
    runner: &A,
    host: Ipv4Addr,
    serial: &str,
) -> Result<String, VmError> {
    let link = disk_by_id(serial);
    let resolved = runner
        .run_command(host, &format!("readlink -f {link}"))
        .await?;
    let resolved = resolved.trim();
    // readlink -f echoes the link path back when there is nothing to resolve
    if resolved.is_empty() || resolved == link {
        return Err(VmError::disk_not_found(serial));
    }
    Ok(resolved.to_string())
}

/// Find a NIC in the static definition by MAC.
pub fn find_static_nic<'a>(nics: &'a [NicDef], mac: &str) -> Option<&'a NicDef> {
    nics.iter().find(|n| n.mac.eq_ignore_ascii_case(mac))
}

/// Find a NIC in the live guest-reported state by MAC.
pub fn find_live_nic<'a>(
    interfaces: &'a BTreeMap<u32, GuestInterface>,
    mac: &str,
) -> Option<&'a GuestInterface> {
    interfaces.values().find(|i| i.mac.eq_ignore_ascii_case(mac))
}
