//! In-memory stand-ins for the hypervisor and the automation runner. Both
//! record every state-changing call into a trace so tests can assert on
//! ordering; the trace can be shared between the two so cross-component
//! ordering (unmount before detach) is observable.

use std::collections::{BTreeMap, HashMap};
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::ansible::{Automation, PlayReport, TaskResult, TaskStatus};
use crate::config::Config;
use crate::errors::VmError;
use crate::virsh::{
    DiskAttachment, DiskDef, DomResources, GuestInterface, Hypervisor, Instances, NicDef,
    ResourceScope, VmState,
};

type Trace = Arc<Mutex<Vec<String>>>;

#[derive(Default)]
struct HypervisorState {
    running: Vec<String>,
    stopped: Vec<String>,
    paused: Vec<String>,
    disks: HashMap<String, Vec<DiskDef>>,
    nics: HashMap<String, Vec<NicDef>>,
    guest: HashMap<String, BTreeMap<u32, GuestInterface>>,
    resources: HashMap<String, DomResources>,
    volumes: HashMap<PathBuf, u64>,
}

pub struct MockHypervisor {
    state: Mutex<HypervisorState>,
    trace: Trace,
    /// Address the guest reports once started, when set.
    boot_ip: Option<String>,
    /// When false, `shutdown` is acknowledged but the VM never stops.
    graceful_shutdown_works: bool,
}

impl MockHypervisor {
    pub fn new() -> Self {
        MockHypervisor {
            state: Mutex::new(HypervisorState::default()),
            trace: Arc::new(Mutex::new(Vec::new())),
            boot_ip: None,
            graceful_shutdown_works: true,
        }
    }

    pub fn with_running(self, vm: &str, ip: &str) -> Self {
        {
            let mut state = self.state.lock().unwrap();
            state.running.push(vm.to_string());
            state.guest.insert(vm.to_string(), primary_interface(ip));
        }
        self
    }

    pub fn with_stopped(self, vm: &str) -> Self {
        self.state.lock().unwrap().stopped.push(vm.to_string());
        self
    }

    pub fn boot_ip(mut self, ip: &str) -> Self {
        self.boot_ip = Some(ip.to_string());
        self
    }

    pub fn ignore_graceful_shutdown(mut self) -> Self {
        self.graceful_shutdown_works = false;
        self
    }

    pub fn with_boot_disk(self, vm: &str) -> Self {
        self.with_data_disk(vm, "sda", &format!("/kvmctl/vms/{vm}/boot.qcow2"))
    }

    pub fn with_data_disk(self, vm: &str, target: &str, source: &str) -> Self {
        self.state
            .lock()
            .unwrap()
            .disks
            .entry(vm.to_string())
            .or_default()
            .push(DiskDef {
                target: target.to_string(),
                source: source.to_string(),
            });
        self
    }

    pub fn with_volume(self, path: &str, bytes: u64) -> Self {
        self.state
            .lock()
            .unwrap()
            .volumes
            .insert(PathBuf::from(path), bytes);
        self
    }

    pub fn with_nic(self, vm: &str, mac: &str) -> Self {
        self.state
            .lock()
            .unwrap()
            .nics
            .entry(vm.to_string())
            .or_default()
            .push(NicDef {
                mac: mac.to_string(),
                source: "virbr0".to_string(),
                model: "virtio".to_string(),
            });
        self
    }

    pub fn with_resources(self, vm: &str, cpu: u32, memory_bytes: u64) -> Self {
        self.state
            .lock()
            .unwrap()
            .resources
            .insert(vm.to_string(), DomResources { cpu, memory_bytes });
        self
    }

    pub fn trace(&self) -> Vec<String> {
        self.trace.lock().unwrap().clone()
    }

    pub fn trace_contains(&self, event: &str) -> bool {
        self.trace.lock().unwrap().iter().any(|e| e == event)
    }

    fn record(&self, event: String) {
        self.trace.lock().unwrap().push(event);
    }

    fn require_known(&self, vm: &str) -> Result<(), VmError> {
        let state = self.state.lock().unwrap();
        let known = state.running.iter().any(|n| n == vm)
            || state.stopped.iter().any(|n| n == vm)
            || state.paused.iter().any(|n| n == vm);
        if known {
            Ok(())
        } else {
            Err(VmError::vm_not_found(vm))
        }
    }
}

fn primary_interface(ip: &str) -> BTreeMap<u32, GuestInterface> {
    let mut interfaces = BTreeMap::new();
    interfaces.insert(
        1,
        GuestInterface {
            name: "eth0".to_string(),
            mac: "52:54:00:aa:bb:cc".to_string(),
            address: Some(ip.to_string()),
            prefix: Some("24".to_string()),
        },
    );
    interfaces
}

fn scope_label(scope: ResourceScope) -> &'static str {
    match scope {
        ResourceScope::Maximum => "maximum",
        ResourceScope::Current => "current",
    }
}

impl Hypervisor for MockHypervisor {
    async fn instances(&self) -> Result<Instances, VmError> {
        let state = self.state.lock().unwrap();
        Ok(Instances {
            running: state.running.clone(),
            stopped: state.stopped.clone(),
            paused: state.paused.clone(),
        })
    }

    async fn state(&self, vm: &str) -> Result<VmState, VmError> {
        let state = self.state.lock().unwrap();
        if state.running.iter().any(|n| n == vm) {
            Ok(VmState::Running)
        } else if state.stopped.iter().any(|n| n == vm) {
            Ok(VmState::Stopped)
        } else if state.paused.iter().any(|n| n == vm) {
            Ok(VmState::Paused)
        } else {
            Err(VmError::vm_not_found(vm))
        }
    }

    async fn start(&self, vm: &str) -> Result<(), VmError> {
        self.require_known(vm)?;
        self.record(format!("start {vm}"));
        let mut state = self.state.lock().unwrap();
        state.stopped.retain(|n| n != vm);
        state.paused.retain(|n| n != vm);
        if !state.running.iter().any(|n| n == vm) {
            state.running.push(vm.to_string());
        }
        if let Some(ip) = &self.boot_ip {
            state.guest.insert(vm.to_string(), primary_interface(ip));
        }
        Ok(())
    }

    async fn shutdown(&self, vm: &str) -> Result<(), VmError> {
        self.require_known(vm)?;
        self.record(format!("shutdown {vm}"));
        if self.graceful_shutdown_works {
            let mut state = self.state.lock().unwrap();
            state.running.retain(|n| n != vm);
            if !state.stopped.iter().any(|n| n == vm) {
                state.stopped.push(vm.to_string());
            }
            state.guest.remove(vm);
        }
        Ok(())
    }

    async fn destroy(&self, vm: &str) -> Result<(), VmError> {
        self.require_known(vm)?;
        self.record(format!("destroy {vm}"));
        let mut state = self.state.lock().unwrap();
        state.running.retain(|n| n != vm);
        state.paused.retain(|n| n != vm);
        if !state.stopped.iter().any(|n| n == vm) {
            state.stopped.push(vm.to_string());
        }
        state.guest.remove(vm);
        Ok(())
    }

    async fn reboot(&self, vm: &str) -> Result<(), VmError> {
        self.require_known(vm)?;
        self.record(format!("reboot {vm}"));
        Ok(())
    }

    async fn reset(&self, vm: &str) -> Result<(), VmError> {
        self.require_known(vm)?;
        self.record(format!("reset {vm}"));
        Ok(())
    }

    async fn undefine(&self, vm: &str) -> Result<(), VmError> {
        self.require_known(vm)?;
        self.record(format!("undefine {vm}"));
        let mut state = self.state.lock().unwrap();
        state.running.retain(|n| n != vm);
        state.stopped.retain(|n| n != vm);
        state.paused.retain(|n| n != vm);
        state.guest.remove(vm);
        Ok(())
    }

    async fn disks(&self, vm: &str) -> Result<Vec<DiskDef>, VmError> {
        self.require_known(vm)?;
        let state = self.state.lock().unwrap();
        Ok(state.disks.get(vm).cloned().unwrap_or_default())
    }

    async fn attach_disk(
        &self,
        vm: &str,
        attachment: &DiskAttachment,
        _live: bool,
    ) -> Result<(), VmError> {
        self.require_known(vm)?;
        self.record(format!("attach-disk {vm} {}", attachment.target));
        self.state
            .lock()
            .unwrap()
            .disks
            .entry(vm.to_string())
            .or_default()
            .push(DiskDef {
                target: attachment.target.clone(),
                source: attachment.path.display().to_string(),
            });
        Ok(())
    }

    async fn detach_disk(&self, vm: &str, target: &str, _live: bool) -> Result<(), VmError> {
        self.require_known(vm)?;
        self.record(format!("detach-disk {vm} {target}"));
        if let Some(disks) = self.state.lock().unwrap().disks.get_mut(vm) {
            disks.retain(|d| d.target != target);
        }
        Ok(())
    }

    async fn interfaces(&self, vm: &str) -> Result<Vec<NicDef>, VmError> {
        self.require_known(vm)?;
        let state = self.state.lock().unwrap();
        Ok(state.nics.get(vm).cloned().unwrap_or_default())
    }

    async fn guest_interfaces(&self, vm: &str) -> Result<BTreeMap<u32, GuestInterface>, VmError> {
        self.require_known(vm)?;
        let state = self.state.lock().unwrap();
        Ok(state.guest.get(vm).cloned().unwrap_or_default())
    }

    async fn attach_interface(&self, vm: &str, bridge: &str, _live: bool) -> Result<(), VmError> {
        self.require_known(vm)?;
        self.record(format!("attach-interface {vm} {bridge}"));
        let mut state = self.state.lock().unwrap();
        let nics = state.nics.entry(vm.to_string()).or_default();
        let mac = format!("52:54:00:00:00:{:02x}", nics.len() + 1);
        nics.push(NicDef {
            mac: mac.clone(),
            source: bridge.to_string(),
            model: "virtio".to_string(),
        });
        let running = state.running.iter().any(|n| n == vm);
        if running {
            let guest = state.guest.entry(vm.to_string()).or_default();
            let index = guest.keys().max().copied().unwrap_or(0) + 1;
            guest.insert(
                index,
                GuestInterface {
                    name: format!("eth{}", index - 1),
                    mac,
                    address: Some("192.168.122.60".to_string()),
                    prefix: Some("24".to_string()),
                },
            );
        }
        Ok(())
    }

    async fn detach_interface(&self, vm: &str, mac: &str, _live: bool) -> Result<(), VmError> {
        self.require_known(vm)?;
        self.record(format!("detach-interface {vm} {mac}"));
        let mut state = self.state.lock().unwrap();
        if let Some(nics) = state.nics.get_mut(vm) {
            nics.retain(|n| !n.mac.eq_ignore_ascii_case(mac));
        }
        if let Some(guest) = state.guest.get_mut(vm) {
            guest.retain(|_, i| !i.mac.eq_ignore_ascii_case(mac));
        }
        Ok(())
    }

    async fn resources(&self, vm: &str) -> Result<DomResources, VmError> {
        self.require_known(vm)?;
        let state = self.state.lock().unwrap();
        Ok(state.resources.get(vm).copied().unwrap_or(DomResources {
            cpu: 2,
            memory_bytes: 2 << 30,
        }))
    }

    async fn set_vcpus(&self, vm: &str, count: u32, scope: ResourceScope) -> Result<(), VmError> {
        self.require_known(vm)?;
        self.record(format!("setvcpus {vm} {count} {}", scope_label(scope)));
        if scope == ResourceScope::Current {
            let mut state = self.state.lock().unwrap();
            let entry = state.resources.entry(vm.to_string()).or_insert(DomResources {
                cpu: 2,
                memory_bytes: 2 << 30,
            });
            entry.cpu = count;
        }
        Ok(())
    }

    async fn set_memory(&self, vm: &str, mib: u64, scope: ResourceScope) -> Result<(), VmError> {
        self.require_known(vm)?;
        self.record(format!("setmem {vm} {mib} {}", scope_label(scope)));
        if scope == ResourceScope::Current {
            let mut state = self.state.lock().unwrap();
            let entry = state.resources.entry(vm.to_string()).or_insert(DomResources {
                cpu: 2,
                memory_bytes: 2 << 30,
            });
            entry.memory_bytes = mib * 1024 * 1024;
        }
        Ok(())
    }

    async fn create_volume(&self, path: &Path, bytes: u64) -> Result<(), VmError> {
        self.record(format!("create-volume {} {bytes}", path.display()));
        self.state
            .lock()
            .unwrap()
            .volumes
            .insert(path.to_path_buf(), bytes);
        Ok(())
    }

    async fn grow_volume(&self, path: &Path, delta: u64) -> Result<(), VmError> {
        self.record(format!("grow-volume {} +{delta}", path.display()));
        let mut state = self.state.lock().unwrap();
        match state.volumes.get_mut(path) {
            Some(size) => {
                *size += delta;
                Ok(())
            }
            None => Err(VmError::Driver(format!(
                "no such volume: {}",
                path.display()
            ))),
        }
    }

    async fn volume_size(&self, path: &Path) -> Result<u64, VmError> {
        let state = self.state.lock().unwrap();
        state
            .volumes
            .get(path)
            .copied()
            .ok_or_else(|| VmError::Driver(format!("no such volume: {}", path.display())))
    }
}

#[derive(Default)]
struct RunnerState {
    responses: HashMap<String, String>,
    playbooks: Vec<(String, serde_json::Value)>,
}

pub struct MockRunner {
    state: Mutex<RunnerState>,
    trace: Trace,
}

impl MockRunner {
    pub fn new() -> Self {
        MockRunner {
            state: Mutex::new(RunnerState::default()),
            trace: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Record into the same trace as the mock hypervisor so tests can assert
    /// ordering across the two.
    pub fn share_trace(mut self, driver: &MockHypervisor) -> Self {
        self.trace = Arc::clone(&driver.trace);
        self
    }

    /// Canned stdout for an exact in-guest command line.
    pub fn respond(&self, command: &str, stdout: &str) {
        self.state
            .lock()
            .unwrap()
            .responses
            .insert(command.to_string(), stdout.to_string());
    }

    pub fn trace(&self) -> Vec<String> {
        self.trace.lock().unwrap().clone()
    }

    pub fn trace_contains(&self, event: &str) -> bool {
        self.trace.lock().unwrap().iter().any(|e| e == event)
    }

    /// Variables the named playbook was last invoked with.
    pub fn playbook_vars(&self, name: &str) -> Option<serde_json::Value> {
        self.state
            .lock()
            .unwrap()
            .playbooks
            .iter()
            .rev()
            .find(|(n, _)| n == name)
            .map(|(_, vars)| vars.clone())
    }
}

impl Automation for MockRunner {
    async fn run_playbook(
        &self,
        _host: Ipv4Addr,
        name: &str,
        vars: serde_json::Value,
    ) -> Result<PlayReport, VmError> {
        self.trace.lock().unwrap().push(format!("playbook:{name}"));
        self.state
            .lock()
            .unwrap()
            .playbooks
            .push((name.to_string(), vars));
        Ok(PlayReport {
            tasks: vec![TaskResult {
                name: name.to_string(),
                status: TaskStatus::Changed,
            }],
        })
    }

    async fn run_command(&self, _host: Ipv4Addr, command: &str) -> Result<String, VmError> {
        self.trace.lock().unwrap().push(format!("cmd:{command}"));
        let state = self.state.lock().unwrap();
        state
            .responses
            .get(command)
            .cloned()
            .ok_or_else(|| VmError::Driver(format!("no canned response for: {command}")))
    }
}

pub fn test_config() -> Config {
    Config {
        vm_dir: PathBuf::from("/nonexistent/vms"),
        playbook_dir: PathBuf::from("/nonexistent/playbooks"),
        ansible_user: "ansible".to_string(),
        ansible_key: PathBuf::from("/nonexistent/key"),
        ssh_port: 22,
    }
}

/// Config whose readiness port is backed by a real listener, so waits
/// against 127.0.0.1 succeed immediately.
pub async fn config_with_listener() -> (Config, tokio::net::TcpListener) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let mut config = test_config();
    config.ssh_port = listener.local_addr().unwrap().port();
    (config, listener)
}
