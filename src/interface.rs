use std::collections::BTreeMap;
use std::time::Duration;

use crate::driver::{Driver, InterfaceStatus};
use crate::error::NetworkError;

pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Delay between enumeration attempts while the device table settles.
pub const SETTLE_DELAY: Duration = Duration::from_millis(100);

pub const LOOPBACK: &str = "lo";

/// Synthetic interfaces that never carry user traffic: loopback, the USB
/// gadget link and the SIT tunnel.
pub const UNUSABLE_INTERFACES: [&str; 3] = [LOOPBACK, "usb0", "sit0"];

/// List usable interfaces with their current status.
///
/// At boot the kernel may report nothing but loopback for a short while.
/// That case is retried every [`SETTLE_DELAY`] for up to `max_attempts`
/// attempts; when the budget runs out an empty map is returned, which callers
/// must read as "no interfaces yet" rather than as a failure.
pub async fn list_interfaces(
    driver: &dyn Driver,
    max_attempts: u32,
) -> Result<BTreeMap<String, InterfaceStatus>, NetworkError> {
    let mut attempts = max_attempts;

    let names = loop {
        if attempts == 0 {
            tracing::debug!(max_attempts, "device table never settled");
            return Ok(BTreeMap::new());
        }
        attempts -= 1;

        let names = driver.enumerate_interfaces().await?;
        if names.len() == 1 && names[0] == LOOPBACK {
            tracing::trace!(remaining = attempts, "only loopback present, retrying");
            tokio::time::sleep(SETTLE_DELAY).await;
            continue;
        }
        break names;
    };

    let mut interfaces = BTreeMap::new();
    for name in names {
        if UNUSABLE_INTERFACES.contains(&name.as_str()) {
            continue;
        }
        match driver.interface_status(&name).await {
            Ok(status) => {
                interfaces.insert(name, status);
            }
            // The interface may vanish between enumeration and lookup.
            Err(NetworkError::InterfaceNotFound(_)) => {
                tracing::debug!(interface = %name, "interface disappeared during listing");
            }
            Err(e) => return Err(e),
        }
    }

    Ok(interfaces)
}

/// Get a specific interface by name.
pub async fn get_interface(driver: &dyn Driver, name: &str) -> Result<InterfaceStatus, NetworkError> {
    list_interfaces(driver, DEFAULT_MAX_ATTEMPTS)
        .await?
        .remove(name)
        .ok_or_else(|| NetworkError::InterfaceNotFound(name.to_string()))
}

/// Resolve interface: use provided name or pick the first wireless
/// interface, preferring USB adapters.
pub async fn resolve_interface(
    driver: &dyn Driver,
    interface: Option<&str>,
) -> Result<InterfaceStatus, NetworkError> {
    if let Some(name) = interface {
        return get_interface(driver, name).await;
    }

    let interfaces = list_interfaces(driver, DEFAULT_MAX_ATTEMPTS).await?;
    let mut wireless: Vec<InterfaceStatus> =
        interfaces.into_values().filter(|i| i.wireless).collect();
    wireless.sort_by_key(|i| !i.is_usb);

    wireless
        .into_iter()
        .next()
        .ok_or_else(|| NetworkError::InterfaceNotFound("<any wireless>".to_string()))
}
