use std::ffi::{c_void, CStr};

use anyhow::{anyhow, Result};
use esp_idf_sys::*;
use log::{error, info, warn};

use crate::platform::{ImageSlot, ImageWriter};

/// The OTA app partitions, driven through the raw `esp_ota_*` API.
pub struct EspImageSlot;

impl EspImageSlot {
    pub fn new() -> Self {
        unsafe {
            let running = esp_ota_get_running_partition();
            if running.is_null() {
                error!("No running partition detected");
            } else {
                info!(
                    "Current running partition: {}, address: 0x{:x}, size: 0x{:x}",
                    label(running),
                    (*running).address,
                    (*running).size
                );
            }
        }
        Self
    }
}

impl Default for EspImageSlot {
    fn default() -> Self {
        Self::new()
    }
}

unsafe fn label(partition: *const esp_partition_t) -> String {
    CStr::from_ptr((*partition).label.as_ptr())
        .to_str()
        .unwrap_or("unknown")
        .to_string()
}

impl ImageSlot for EspImageSlot {
    fn begin(&mut self, size_hint: Option<u64>) -> Result<Box<dyn ImageWriter + '_>> {
        unsafe {
            let partition = esp_ota_get_next_update_partition(core::ptr::null());
            if partition.is_null() {
                return Err(anyhow!("No valid OTA partition found"));
            }
            info!(
                "Selected OTA partition: {}, address: 0x{:x}, size: 0x{:x}",
                label(partition),
                (*partition).address,
                (*partition).size
            );
            let image_size = match size_hint {
                Some(size) if size <= (*partition).size as u64 => size as usize,
                Some(size) => {
                    return Err(anyhow!(
                        "Image of {} bytes does not fit partition of {} bytes",
                        size,
                        (*partition).size
                    ))
                }
                None => OTA_SIZE_UNKNOWN as usize,
            };
            let mut handle: esp_ota_handle_t = 0;
            let res = esp_ota_begin(partition, image_size, &mut handle);
            if res != ESP_OK {
                return Err(anyhow!("Failed to begin OTA: {}", res));
            }
            Ok(Box::new(EspImageWriter {
                handle,
                partition,
                ended: false,
            }))
        }
    }

    fn running_pending_verify(&mut self) -> Result<bool> {
        let mut state: esp_ota_img_states_t = esp_ota_img_states_t_ESP_OTA_IMG_UNDEFINED;
        let res = unsafe {
            let running = esp_ota_get_running_partition();
            if running.is_null() {
                return Err(anyhow!("No running partition detected"));
            }
            esp_ota_get_state_partition(running, &mut state)
        };
        if res == ESP_OK {
            Ok(state == esp_ota_img_states_t_ESP_OTA_IMG_PENDING_VERIFY)
        } else if res == ESP_ERR_NOT_SUPPORTED as esp_err_t || res == ESP_ERR_NOT_FOUND as esp_err_t {
            // Factory image, no OTA state to report.
            Ok(false)
        } else {
            Err(anyhow!("Failed to read running image state: {}", res))
        }
    }

    fn mark_running_valid(&mut self) -> Result<()> {
        let res = unsafe { esp_ota_mark_app_valid_cancel_rollback() };
        if res != ESP_OK {
            return Err(anyhow!("Failed to cancel rollback: {}", res));
        }
        info!("Running image marked valid");
        Ok(())
    }
}

struct EspImageWriter {
    handle: esp_ota_handle_t,
    partition: *const esp_partition_t,
    /// `esp_ota_end` was called, the handle is released.
    ended: bool,
}

impl ImageWriter for EspImageWriter {
    fn write(&mut self, chunk: &[u8]) -> Result<()> {
        let res = unsafe { esp_ota_write(self.handle, chunk.as_ptr() as *const c_void, chunk.len()) };
        if res != ESP_OK {
            return Err(anyhow!("Failed to write OTA data: {}", res));
        }
        Ok(())
    }

    fn finalize(&mut self) -> Result<()> {
        self.ended = true;
        let res = unsafe { esp_ota_end(self.handle) };
        if res != ESP_OK {
            return Err(anyhow!("Failed to end OTA: {}", res));
        }
        Ok(())
    }

    fn activate(self: Box<Self>) -> Result<()> {
        if !self.ended {
            return Err(anyhow!("Image activated before it was finalized"));
        }
        let res = unsafe { esp_ota_set_boot_partition(self.partition) };
        if res != ESP_OK {
            return Err(anyhow!("Failed to set boot partition: {}", res));
        }
        Ok(())
    }
}

impl Drop for EspImageWriter {
    fn drop(&mut self) {
        if !self.ended {
            warn!("Aborting unfinished OTA write");
            unsafe {
                esp_ota_abort(self.handle);
            }
        }
    }
}
