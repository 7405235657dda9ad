#[cfg(target_os = "espidf")]
fn main() {
    node::boot();
}

#[cfg(not(target_os = "espidf"))]
fn main() {
    eprintln!("sensor-node only runs on ESP-IDF targets; use `cargo test` on the host");
}

#[cfg(target_os = "espidf")]
mod node {
    use std::sync::mpsc;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    use anyhow::{Context, Result};
    use esp_idf_svc::eventloop::EspSystemEventLoop;
    use esp_idf_hal::peripherals::Peripherals;
    use esp_idf_svc::nvs::EspDefaultNvsPartition;
    use esp_idf_svc::sntp::EspSntp;
    use esp_idf_svc::wifi::{BlockingWifi, EspWifi};
    use log::{error, info, warn};

    use sensor_node::bot::{self, mask_token, BotApi, BotCredentials, CommandDispatcher, IngestLoop};
    use sensor_node::config::{
        AccessToken, DeviceConfig, Storage, WifiCredentials, FIRMWARE_TITLE, FIRMWARE_VERSION,
        STORAGE_ROOT,
    };
    use sensor_node::esp::{self, EspImageSlot, EspPower, EspTransport, SimpleMqttClient};
    use sensor_node::firmware::{self, FirmwareLocator, UpdateController, UpdateHandle};
    use sensor_node::platform::ImageSlot;
    use sensor_node::sleep::{self, SleepHandle};
    use sensor_node::telemetry::Telemetry;

    /// Services that must stay alive for the lifetime of the firmware.
    struct Node {
        _wifi: BlockingWifi<EspWifi<'static>>,
        _sntp: Option<EspSntp<'static>>,
        _mqtt: Option<Arc<SimpleMqttClient>>,
    }

    pub fn boot() {
        esp_idf_sys::link_patches();
        esp_idf_svc::log::EspLogger::initialize_default();
        info!("Starting {} {}", FIRMWARE_TITLE, FIRMWARE_VERSION);

        let _node = start().map_err(|e| error!("Startup failed: {:?}", e)).ok();
        loop {
            thread::sleep(Duration::from_secs(60));
        }
    }

    fn start() -> Result<Node> {
        esp::mount_storage()?;
        let storage = Storage::new(STORAGE_ROOT);
        let config = storage.device_config().unwrap_or_else(|e| {
            warn!("{:?}, using defaults", e);
            DeviceConfig::default()
        });

        let sleep = sleep::spawn(storage.sleep(), EspPower)?;

        let wifi_credentials: WifiCredentials = storage
            .wifi()
            .load()?
            .context("wifi.txt is missing or has no SSID")?;
        let peripherals = Peripherals::take()?;
        let sys_loop = EspSystemEventLoop::take()?;
        let nvs = EspDefaultNvsPartition::take()?;
        let mut wifi = BlockingWifi::wrap(
            EspWifi::new(peripherals.modem, sys_loop.clone(), Some(nvs))?,
            sys_loop,
        )?;
        esp::connect_wifi(&mut wifi, &wifi_credentials)?;

        let sntp = esp::init_sntp()
            .map_err(|e| warn!("SNTP unavailable: {:?}", e))
            .ok();

        let use_global_ca = match storage.ca_certificate() {
            Some(path) => match esp::install_ca_store(&path) {
                Ok(()) => true,
                Err(e) => {
                    warn!("{:?}, falling back to the certificate bundle", e);
                    false
                }
            },
            None => false,
        };

        let (firmware, mqtt) = start_updates(&storage, &config, use_global_ca);
        start_bot(&storage, &config, use_global_ca, sleep, firmware)?;

        Ok(Node {
            _wifi: wifi,
            _sntp: sntp,
            _mqtt: mqtt,
        })
    }

    fn start_updates(
        storage: &Storage,
        config: &DeviceConfig,
        use_global_ca: bool,
    ) -> (Option<UpdateHandle>, Option<Arc<SimpleMqttClient>>) {
        let token = match storage.mqtt().load::<AccessToken>() {
            Ok(Some(token)) => token.0,
            Ok(None) => {
                warn!("No access token in mqtt.txt, firmware updates disabled");
                confirm_without_cloud();
                return (None, None);
            }
            Err(e) => {
                error!("Failed to read mqtt.txt: {}", e);
                confirm_without_cloud();
                return (None, None);
            }
        };
        info!("Connecting to MQTT broker as {}", mask_token(&token));

        let (tx, rx) = mpsc::channel();
        let updates = UpdateHandle::new(tx);
        let mqtt = match SimpleMqttClient::new(&config.mqtt_broker_url, &token, updates.clone()) {
            Ok(client) => Arc::new(client),
            Err(e) => {
                error!("Failed to connect to MQTT: {:?}", e);
                confirm_without_cloud();
                return (None, None);
            }
        };

        let controller = UpdateController::new(
            EspTransport::new(use_global_ca),
            EspImageSlot::new(),
            EspPower,
            mqtt.clone() as Arc<dyn Telemetry>,
            storage.firmware(),
            FirmwareLocator::new(config.firmware_api_base.clone(), Some(token)),
            config.update_settings(),
        );
        match firmware::spawn(controller, rx) {
            Ok(_) => (Some(updates), Some(mqtt)),
            Err(e) => {
                error!("Failed to start update task: {:?}", e);
                (None, Some(mqtt))
            }
        }
    }

    /// Without the update task nothing else would cancel the rollback.
    fn confirm_without_cloud() {
        if let Err(e) = EspImageSlot::new().mark_running_valid() {
            error!("{:?}", e);
        }
    }

    fn start_bot(
        storage: &Storage,
        config: &DeviceConfig,
        use_global_ca: bool,
        sleep: SleepHandle,
        firmware: Option<UpdateHandle>,
    ) -> Result<()> {
        let credentials = match storage.bot().load::<BotCredentials>() {
            Ok(Some(credentials)) => credentials,
            Ok(None) => {
                info!("No bot token, chat commands disabled");
                sleep.start_idle_countdown();
                return Ok(());
            }
            Err(e) => {
                error!("Failed to read bot credentials: {}", e);
                sleep.start_idle_countdown();
                return Ok(());
            }
        };
        info!(
            "Bot token {} loaded, cursor {}",
            mask_token(&credentials.token),
            credentials.cursor
        );

        let api = BotApi::new(
            EspTransport::new(use_global_ca),
            config.bot_api_base.clone(),
            credentials.token.clone(),
        );
        let mut dispatcher = CommandDispatcher::new(sleep.clone());
        if let Some(firmware) = firmware {
            dispatcher = dispatcher.with_firmware(firmware);
        }
        let ingest = IngestLoop::new(
            api,
            dispatcher,
            storage.bot(),
            credentials,
            config.ingest_settings(),
        );
        bot::start(ingest, sleep)?;
        Ok(())
    }
}
