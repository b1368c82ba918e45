use std::future::Future;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use log::info;
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout, Instant};

use crate::errors::VmError;
use crate::virsh::{Hypervisor, VmState};

/// Boot readiness: how long to wait for the guest to report an address.
pub const READY_MAX_WAIT: Duration = Duration::from_secs(120);
pub const READY_INTERVAL: Duration = Duration::from_secs(10);

/// How long to wait for the SSH port once an address is known.
pub const PORT_MAX_WAIT: Duration = Duration::from_secs(60);
pub const PORT_INTERVAL: Duration = Duration::from_secs(2);

/// Graceful shutdown convergence bound, and the shorter bound applied after
/// a forced power-off.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(60);
pub const FORCE_GRACE: Duration = Duration::from_secs(10);
pub const SHUTDOWN_INTERVAL: Duration = Duration::from_secs(1);

/// Bounded polling primitive shared by every wait in the controller. Probes
/// immediately, then at the fixed interval; expires with `Timeout` once the
/// deadline passes. Probe errors propagate unchanged.
pub async fn poll_until<T, F, Fut>(
    what: &str,
    interval: Duration,
    max_wait: Duration,
    mut probe: F,
) -> Result<T, VmError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<Option<T>, VmError>>,
{
    let started = Instant::now();
    loop {
        if let Some(value) = probe().await? {
            return Ok(value);
        }
        if started.elapsed() >= max_wait {
            return Err(VmError::Timeout {
                what: what.to_string(),
                waited: max_wait,
            });
        }
        sleep(interval).await;
    }
}

/// Wait for the guest to report an IPv4 address on an eth interface. Driver
/// errors while polling mean the guest agent is not reachable yet and count
/// as "not ready".
pub async fn wait_for_guest_ip<H: Hypervisor>(driver: &H, vm: &str) -> Result<Ipv4Addr, VmError> {
    info!("Waiting for VM {vm} to report an address");
    poll_until(
        &format!("VM {vm} to report an address"),
        READY_INTERVAL,
        READY_MAX_WAIT,
        move || async move {
            let interfaces = match driver.guest_interfaces(vm).await {
                Ok(interfaces) => interfaces,
                Err(_) => return Ok(None),
            };
            for iface in interfaces.values() {
                if !iface.name.starts_with("eth") {
                    continue;
                }
                if let Some(ip) = iface.address.as_deref().and_then(|a| a.parse().ok()) {
                    return Ok(Some(ip));
                }
            }
            Ok(None)
        },
    )
    .await
}

/// Wait for a TCP port on the guest to accept connections.
pub async fn wait_for_port(ip: Ipv4Addr, port: u16) -> Result<(), VmError> {
    let addr = SocketAddr::from((ip, port));
    info!("Waiting for {addr} to accept connections");
    poll_until(
        &format!("{addr} to accept connections"),
        PORT_INTERVAL,
        PORT_MAX_WAIT,
        move || async move {
            match timeout(PORT_INTERVAL, TcpStream::connect(addr)).await {
                Ok(Ok(_)) => Ok(Some(())),
                _ => Ok(None),
            }
        },
    )
    .await
}

/// Full readiness gate used after create/start/reboot/reset: an address from
/// the guest agent, then an open SSH port.
pub async fn wait_ready<H: Hypervisor>(
    driver: &H,
    vm: &str,
    ssh_port: u16,
) -> Result<Ipv4Addr, VmError> {
    let ip = wait_for_guest_ip(driver, vm).await?;
    wait_for_port(ip, ssh_port).await?;
    info!("VM {vm} is up. IP: {ip}");
    Ok(ip)
}

/// Poll until the VM reports shut off.
pub async fn wait_until_stopped<H: Hypervisor>(
    driver: &H,
    vm: &str,
    max_wait: Duration,
) -> Result<(), VmError> {
    poll_until(
        &format!("VM {vm} to shut down"),
        SHUTDOWN_INTERVAL,
        max_wait,
        move || async move {
            Ok((driver.state(vm).await? == VmState::Stopped).then_some(()))
        },
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[tokio::test(start_paused = true)]
    async fn times_out_after_the_configured_bound() {
        let probes = Cell::new(0u32);
        let started = Instant::now();
        let result: Result<(), VmError> = poll_until(
            "a condition that never holds",
            Duration::from_secs(10),
            Duration::from_secs(120),
            || {
                probes.set(probes.get() + 1);
                async { Ok(None) }
            },
        )
        .await;
        match result {
            Err(VmError::Timeout { waited, .. }) => {
                assert_eq!(waited, Duration::from_secs(120))
            }
            other => panic!("expected timeout, got {other:?}"),
        }
        // probes at t = 0, 10, ..., 120
        assert_eq!(probes.get(), 13);
        assert_eq!(started.elapsed(), Duration::from_secs(120));
    }

    #[tokio::test(start_paused = true)]
    async fn returns_as_soon_as_the_probe_succeeds() {
        let probes = Cell::new(0u32);
        let value = poll_until(
            "third time lucky",
            Duration::from_secs(5),
            Duration::from_secs(60),
            || {
                probes.set(probes.get() + 1);
                let hit = probes.get() == 3;
                async move { Ok(hit.then_some(42)) }
            },
        )
        .await
        .unwrap();
        assert_eq!(value, 42);
        assert_eq!(probes.get(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn probe_errors_propagate_immediately() {
        let result: Result<(), VmError> = poll_until(
            "a failing probe",
            Duration::from_secs(1),
            Duration::from_secs(60),
            || async { Err(VmError::Driver("boom".to_string())) },
        )
        .await;
        assert!(matches!(result, Err(VmError::Driver(_))));
    }

    #[tokio::test]
    async fn port_wait_succeeds_against_a_listener() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        wait_for_port(Ipv4Addr::LOCALHOST, port).await.unwrap();
    }
}
