use std::ffi::CString;
use std::fs;
use std::path::Path;
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use esp_idf_svc::ipv4::IpInfo;
use esp_idf_svc::sntp::{EspSntp, SyncStatus};
use esp_idf_sys::*;
use esp_idf_svc::wifi::{AuthMethod, BlockingWifi, ClientConfiguration, Configuration, EspWifi};
use log::{info, warn};

use crate::config::{WifiCredentials, STORAGE_PARTITION, STORAGE_ROOT};

const WIFI_CONNECT_ATTEMPTS: u32 = 3;
const WIFI_RETRY_DELAY: Duration = Duration::from_secs(2);
const SNTP_WAIT_SECS: u32 = 30;

/// Mounts the FAT data partition at [`STORAGE_ROOT`]. Never formats.
pub fn mount_storage() -> Result<()> {
    let base_path = CString::new(STORAGE_ROOT)?;
    let label = CString::new(STORAGE_PARTITION)?;
    let config = esp_vfs_fat_mount_config_t {
        format_if_mount_failed: false,
        max_files: 4,
        allocation_unit_size: 4096,
        ..Default::default()
    };
    let mut handle: wl_handle_t = -1;
    let res = unsafe {
        esp_vfs_fat_spiflash_mount_rw_wl(base_path.as_ptr(), label.as_ptr(), &config, &mut handle)
    };
    if res != ESP_OK {
        return Err(anyhow!("Failed to mount FAT filesystem: {}", res));
    }
    info!("FAT filesystem mounted at {}", STORAGE_ROOT);
    Ok(())
}

pub fn connect_wifi(
    wifi: &mut BlockingWifi<EspWifi<'static>>,
    credentials: &WifiCredentials,
) -> Result<()> {
    let auth_method = if credentials.password.is_empty() {
        AuthMethod::None
    } else {
        AuthMethod::WPA2Personal
    };
    wifi.set_configuration(&Configuration::Client(ClientConfiguration {
        ssid: heapless::String::try_from(credentials.ssid.as_str())
            .map_err(|_| anyhow!("wifi ssid too long"))?,
        password: heapless::String::try_from(credentials.password.as_str())
            .map_err(|_| anyhow!("wifi password too long"))?,
        auth_method,
        ..Default::default()
    }))?;
    wifi.start()?;
    info!("WiFi started, connecting to `{}`", credentials.ssid);

    let mut attempt = 1;
    loop {
        match wifi.connect().and_then(|()| wifi.wait_netif_up()) {
            Ok(()) => break,
            Err(e) if attempt < WIFI_CONNECT_ATTEMPTS => {
                warn!("WiFi attempt {}/{} failed: {:?}", attempt, WIFI_CONNECT_ATTEMPTS, e);
                let _ = wifi.disconnect();
                thread::sleep(WIFI_RETRY_DELAY);
                attempt += 1;
            }
            Err(e) => return Err(e).context("WiFi connection failed"),
        }
    }
    let ip_info: IpInfo = wifi.wifi().sta_netif().get_ip_info()?;
    info!("WiFi Connected, IP: {}", ip_info.ip);
    Ok(())
}

/// Starts SNTP and waits a while for the first sync. Certificate checks need
/// a sane clock, but a slow sync is not fatal.
pub fn init_sntp() -> Result<EspSntp<'static>> {
    let sntp = EspSntp::new_default()?;
    info!("SNTP initialized, waiting for sync...");
    for _ in 0..SNTP_WAIT_SECS {
        if sntp.get_sync_status() == SyncStatus::Completed {
            info!("SNTP sync completed");
            return Ok(sntp);
        }
        thread::sleep(Duration::from_secs(1));
    }
    warn!("SNTP sync not completed after {} s, continuing", SNTP_WAIT_SECS);
    Ok(sntp)
}

/// Installs a PEM bundle as the global CA store for TLS connections.
pub fn install_ca_store(path: &Path) -> Result<()> {
    let mut pem = fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    pem.push(0);
    let len = u32::try_from(pem.len()).map_err(|_| anyhow!("CA bundle too large"))?;
    let res = unsafe { esp_tls_set_global_ca_store(pem.as_ptr(), len) };
    if res != ESP_OK {
        return Err(anyhow!("Failed to set global CA store: {}", res));
    }
    info!("Installed CA bundle from {}", path.display());
    Ok(())
}
