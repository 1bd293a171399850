//! Peripheral lookup.
//!
//! Bridged devices are configured by MAC address, so unlike a general
//! scanner this module only needs to locate one known peripheral.

use std::time::Duration;

use btleplug::api::{Central, Manager as _, Peripheral as _, ScanFilter};
use btleplug::platform::{Adapter, Manager, Peripheral};
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// Number of scan attempts before giving up on a peripheral.
const MAX_SCAN_ATTEMPTS: u32 = 3;

/// Get the first available Bluetooth adapter.
pub async fn get_adapter() -> Result<Adapter> {
    let manager = Manager::new().await?;
    let adapters = manager.adapters().await?;

    adapters.into_iter().next().ok_or(Error::NoAdapter)
}

/// Find a peripheral by MAC address.
///
/// The adapter's cache of already-seen peripherals is checked first; after
/// that up to three scans of increasing length are run, since a peripheral
/// can miss a single scan window because of advertisement timing.
pub async fn find_peripheral(
    adapter: &Adapter,
    address: &str,
    scan_duration: Duration,
) -> Result<Peripheral> {
    let address_lower = address.to_lowercase();

    if let Some(peripheral) = find_known_peripheral(adapter, &address_lower).await? {
        debug!("Found {} in adapter cache (no scan needed)", address);
        return Ok(peripheral);
    }

    let base_duration = (scan_duration / 2).max(Duration::from_secs(2));

    for attempt in 1..=MAX_SCAN_ATTEMPTS {
        let duration = base_duration * attempt;
        info!(
            "Scanning for {} (attempt {}/{}, {}s)...",
            address,
            attempt,
            MAX_SCAN_ATTEMPTS,
            duration.as_secs()
        );

        adapter.start_scan(ScanFilter::default()).await?;
        sleep(duration).await;
        adapter.stop_scan().await?;

        if let Some(peripheral) = find_known_peripheral(adapter, &address_lower).await? {
            info!("Found {} on attempt {}", address, attempt);
            return Ok(peripheral);
        }
    }

    warn!(
        "Device not found after {} attempts: {}",
        MAX_SCAN_ATTEMPTS, address
    );
    Err(Error::DeviceNotFound(address.to_string()))
}

/// Search the adapter's known peripherals for one with a matching address.
async fn find_known_peripheral(adapter: &Adapter, address_lower: &str) -> Result<Option<Peripheral>> {
    let peripherals = adapter.peripherals().await?;

    for peripheral in peripherals {
        if let Ok(Some(props)) = peripheral.properties().await
            && addresses_match(&props.address.to_string(), address_lower)
        {
            return Ok(Some(peripheral));
        }
    }

    Ok(None)
}

/// Compare two MAC addresses ignoring case and separators.
pub fn addresses_match(a: &str, b: &str) -> bool {
    normalize_address(a) == normalize_address(b)
}

/// Lower-case a MAC address and strip its separators.
pub fn normalize_address(address: &str) -> String {
    address
        .chars()
        .filter(|c| *c != ':' && *c != '-')
        .flat_map(char::to_lowercase)
        .collect()
}
