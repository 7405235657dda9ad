use std::time::Duration;

use esp_idf_sys::{esp_deep_sleep_start, esp_restart, esp_sleep_enable_timer_wakeup, ESP_OK};
use log::{error, info};

use crate::platform::Power;

pub struct EspPower;

impl Power for EspPower {
    fn restart(&self) {
        info!("Restarting...");
        unsafe { esp_restart() };
    }

    fn deep_sleep(&self, duration: Duration) {
        let micros = u64::try_from(duration.as_micros()).unwrap_or(u64::MAX);
        unsafe {
            let res = esp_sleep_enable_timer_wakeup(micros);
            if res != ESP_OK {
                error!("Failed to arm wakeup timer: {}", res);
                return;
            }
            info!("Entering deep sleep for {} ms", duration.as_millis());
            esp_deep_sleep_start();
        }
    }
}
