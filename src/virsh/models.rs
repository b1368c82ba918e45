use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::Serialize;

/// VM names grouped by power state, exactly as the command surface reports
/// them.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Instances {
    pub running: Vec<String>,
    pub stopped: Vec<String>,
    pub paused: Vec<String>,
}

impl Instances {
    pub fn contains(&self, vm: &str) -> bool {
        self.running.iter().any(|n| n == vm)
            || self.stopped.iter().any(|n| n == vm)
            || self.paused.iter().any(|n| n == vm)
    }

    pub fn is_running(&self, vm: &str) -> bool {
        self.running.iter().any(|n| n == vm)
    }

    /// Power-state label for error messages.
    pub fn state_label(&self, vm: &str) -> &'static str {
        if self.is_running(vm) {
            "running"
        } else if self.stopped.iter().any(|n| n == vm) {
            "stopped"
        } else if self.paused.iter().any(|n| n == vm) {
            "paused"
        } else {
            "unknown"
        }
    }

    pub fn sorted(mut self) -> Self {
        self.running.sort();
        self.stopped.sort();
        self.paused.sort();
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VmState {
    Running,
    Stopped,
    Paused,
    /// Transitional states ("in shutdown", "crashed", ...) observed while a
    /// power operation converges.
    Other(String),
}

/// One row of the hypervisor's disk table. The target label is volatile and
/// must never be stored across invocations; the stable key is the serial
/// derived from the backing file.
#[derive(Debug, Clone)]
pub struct DiskDef {
    pub target: String,
    pub source: String,
}

/// Parameters for attaching a qcow2 volume with an explicit serial.
#[derive(Debug, Clone)]
pub struct DiskAttachment {
    pub path: PathBuf,
    pub target: String,
    pub serial: String,
}

/// Static NIC definition, readable while the VM is off.
#[derive(Debug, Clone)]
pub struct NicDef {
    pub mac: String,
    pub source: String,
    pub model: String,
}

/// Live interface state reported by the guest agent. Address and prefix are
/// only present once the guest has configured the interface.
#[derive(Debug, Clone, Default)]
pub struct GuestInterface {
    pub name: String,
    pub mac: String,
    pub address: Option<String>,
    pub prefix: Option<String>,
}

#[derive(Debug, Clone, Copy)]
pub struct DomResources {
    pub cpu: u32,
    pub memory_bytes: u64,
}

/// Whether a resource write targets the persisted maximum or the currently
/// active value. Hypervisors keep these separate; both must be written for a
/// change to be durable and immediately effective.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceScope {
    Maximum,
    Current,
}

/// Parse `virsh list --all` output into state buckets.
pub fn parse_instances(output: &str) -> Instances {
    let mut instances = Instances::default();
    for line in output.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 3 {
            continue;
        }
        let name = fields[1].to_string();
        if line.contains("running") {
            instances.running.push(name);
        } else if line.contains("shut off") {
            instances.stopped.push(name);
        } else if line.contains("paused") {
            instances.paused.push(name);
        }
    }
    instances
}

/// Pull the state line out of `virsh dominfo` output.
pub fn parse_state(output: &str) -> Option<VmState> {
    for line in output.lines() {
        if let Some(rest) = line.strip_prefix("State:") {
            let state = rest.trim();
            return Some(match state {
                "running" => VmState::Running,
                "shut off" => VmState::Stopped,
                "paused" => VmState::Paused,
                other => VmState::Other(other.to_string()),
            });
        }
    }
    None
}

/// Parse CPU count and live memory out of `virsh dominfo` output.
pub fn parse_resources(output: &str) -> Option<DomResources> {
    let mut cpu = None;
    let mut memory_bytes = None;
    for line in output.lines() {
        if let Some(rest) = line.strip_prefix("CPU(s):") {
            cpu = rest.trim().parse::<u32>().ok();
        } else if let Some(rest) = line.strip_prefix("Used memory:") {
            // dominfo reports KiB
            let kib = rest.trim().trim_end_matches("KiB").trim();
            memory_bytes = kib.parse::<u64>().ok().map(|v| v * 1024);
        }
    }
    Some(DomResources {
        cpu: cpu?,
        memory_bytes: memory_bytes?,
    })
}

/// Parse `virsh domblklist` output. Only rows with a backing path are disks;
/// header and separator lines never contain '/'.
pub fn parse_domblklist(output: &str) -> Vec<DiskDef> {
    let mut disks = Vec::new();
    for line in output.lines() {
        if !line.contains('/') {
            continue;
        }
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() >= 2 {
            disks.push(DiskDef {
                target: fields[0].to_string(),
                source: fields[1].to_string(),
            });
        }
    }
    disks
}

/// Parse `virsh domiflist` output into static NIC definitions.
pub fn parse_domiflist(output: &str) -> Vec<NicDef> {
    let mut nics = Vec::new();
    for line in output.lines() {
        let fields: Vec<&str> = line.split_whitespace().collect();
        if fields.len() < 5 || !fields[4].contains(':') {
            continue;
        }
        nics.push(NicDef {
            mac: fields[4].to_string(),
            source: fields[2].to_string(),
            model: fields[3].to_string(),
        });
    }
    nics
}

/// Parse `virsh guestinfo --interface` output. Lines look like
/// `if.1.addr.0.addr : 192.168.122.50`; the first address of each interface
/// is kept, matching what the guest reports for its primary address.
pub fn parse_guestinfo(output: &str) -> BTreeMap<u32, GuestInterface> {
    let mut interfaces: BTreeMap<u32, GuestInterface> = BTreeMap::new();
    for line in output.lines() {
        if !line.starts_with("if.") || line.starts_with("if.count") {
            continue;
        }
        let mut parts = line.split_whitespace();
        let (Some(key), Some(_), Some(value)) = (parts.next(), parts.next(), parts.next()) else {
            continue;
        };
        let Some(num) = key.split('.').nth(1).and_then(|n| n.parse::<u32>().ok()) else {
            continue;
        };
        let entry = interfaces.entry(num).or_default();
        if key.ends_with(".name") {
            entry.name = value.to_string();
        } else if key.ends_with(".hwaddr") {
            entry.mac = value.to_string();
        } else if key.ends_with(".addr.0.addr") {
            entry.address = Some(value.to_string());
        } else if key.ends_with(".addr.0.prefix") {
            entry.prefix = Some(value.to_string());
        }
    }
    interfaces
}
