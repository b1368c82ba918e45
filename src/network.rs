use std::collections::BTreeMap;
use std::time::Duration;

use log::info;
use serde::Serialize;
use tokio::time::sleep;

use crate::errors::VmError;
use crate::resolve;
use crate::virsh::Hypervisor;

/// Bridge every NIC attaches to.
pub const BRIDGE: &str = "virbr0";

/// How long a hot-plugged NIC gets to settle before the live state is read
/// back. The guest needs time to bring the interface up and acquire a lease.
pub const NIC_SETTLE: Duration = Duration::from_secs(15);

/// Static NIC definition as reported while the VM is off, keyed by position.
#[derive(Debug, Clone, Serialize)]
pub struct StaticNicView {
    pub mac: String,
    pub source: String,
    pub model: String,
}

/// Guest-reported NIC state, keyed by the guest's own interface index.
#[derive(Debug, Clone, Serialize)]
pub struct LiveNicView {
    pub name: String,
    pub mac: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subnet: Option<String>,
}

/// The two shapes a NIC listing can take. Static rows carry no address
/// fields at all; a VM that is off has no addresses to report.
#[derive(Debug, Serialize)]
#[serde(untagged)]
pub enum NetworkView {
    Static(BTreeMap<u32, StaticNicView>),
    Live(BTreeMap<u32, LiveNicView>),
}

/// Attaches, detaches and lists NICs. All NICs join the fixed bridge; the
/// MAC is the only stable handle for removal.
pub struct NetworkManager<'a, H> {
    driver: &'a H,
}

impl<'a, H: Hypervisor> NetworkManager<'a, H> {
    pub fn new(driver: &'a H) -> Self {
        NetworkManager { driver }
    }

    /// Live guest-reported state when running, static definition otherwise.
    pub async fn list(&self, vm: &str) -> Result<NetworkView, VmError> {
        let instances = self.driver.instances().await?;
        if !instances.contains(vm) {
            return Err(VmError::vm_not_found(vm));
        }
        if instances.is_running(vm) {
            self.live_view(vm).await
        } else {
            self.static_view(vm).await
        }
    }

    /// Attach a NIC to the bridge, hot-plugged when the VM is running. The
    /// returned view reflects post-attach state; for a running VM it is read
    /// back only after the settle delay.
    pub async fn add(&self, vm: &str) -> Result<NetworkView, VmError> {
        let instances = self.driver.instances().await?;
        if !instances.contains(vm) {
            return Err(VmError::vm_not_found(vm));
        }
        let running = instances.is_running(vm);
        info!("Attaching a NIC on bridge {BRIDGE} to VM {vm}");
        self.driver.attach_interface(vm, BRIDGE, running).await?;
        if running {
            info!("Waiting {NIC_SETTLE:?} for the guest to configure the NIC");
            sleep(NIC_SETTLE).await;
            self.live_view(vm).await
        } else {
            self.static_view(vm).await
        }
    }

    /// Detach the NIC with this MAC, hot-unplugged when the VM is running.
    pub async fn remove(&self, vm: &str, mac: &str) -> Result<(), VmError> {
        let instances = self.driver.instances().await?;
        if !instances.contains(vm) {
            return Err(VmError::vm_not_found(vm));
        }
        let nics = self.driver.interfaces(vm).await?;
        let nic = resolve::find_static_nic(&nics, mac).ok_or_else(|| VmError::nic_not_found(mac))?;
        info!("Detaching NIC {} from VM {vm}", nic.mac);
        self.driver
            .detach_interface(vm, &nic.mac, instances.is_running(vm))
            .await
    }

    async fn static_view(&self, vm: &str) -> Result<NetworkView, VmError> {
        let nics = self.driver.interfaces(vm).await?;
        let view = nics
            .into_iter()
            .enumerate()
            .map(|(i, nic)| {
                (
                    i as u32 + 1,
                    StaticNicView {
                        mac: nic.mac,
                        source: nic.source,
                        model: nic.model,
                    },
                )
            })
            .collect();
        Ok(NetworkView::Static(view))
    }

    async fn live_view(&self, vm: &str) -> Result<NetworkView, VmError> {
        let interfaces = self.driver.guest_interfaces(vm).await?;
        let view = interfaces
            .into_iter()
            .filter(|(_, iface)| iface.name.starts_with("eth"))
            .map(|(index, iface)| {
                (
                    index,
                    LiveNicView {
                        name: iface.name,
                        mac: iface.mac,
                        ip: iface.address,
                        subnet: iface.prefix,
                    },
                )
            })
            .collect();
        Ok(NetworkView::Live(view))
    }
}
