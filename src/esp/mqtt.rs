use std::ffi::{c_void, CString};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use anyhow::{anyhow, Result};
use esp_idf_sys::*;
use log::{debug, error, info, warn};
use serde_json::json;

use crate::firmware::UpdateHandle;
use crate::telemetry::{
    Telemetry, ATTRIBUTES_REQUEST_TOPIC, ATTRIBUTES_RESPONSE_TOPIC, ATTRIBUTES_TOPIC,
    TELEMETRY_TOPIC,
};

const BUFFER_SIZE: i32 = 8192;

/// State shared with the event handler.
struct Context {
    updates: UpdateHandle,
    /// Reassembly buffer for messages larger than the client buffer.
    partial: Mutex<Vec<u8>>,
}

/// Cloud connection over the raw ESP-MQTT client. Attribute pushes and
/// attribute responses are forwarded to the update task.
pub struct SimpleMqttClient {
    client: esp_mqtt_client_handle_t,
    context: *mut Context,
    request_id: AtomicU32,
}

// The ESP-MQTT client serialises access internally.
unsafe impl Send for SimpleMqttClient {}
unsafe impl Sync for SimpleMqttClient {}

impl SimpleMqttClient {
    pub fn new(broker_url: &str, access_token: &str, updates: UpdateHandle) -> Result<Self> {
        let broker_url_cstr = CString::new(broker_url)?;
        let username_cstr = CString::new(access_token)?;
        let context = Box::into_raw(Box::new(Context {
            updates,
            partial: Mutex::new(Vec::new()),
        }));
        unsafe {
            let config = esp_mqtt_client_config_t {
                broker: esp_mqtt_client_config_t_broker_t {
                    address: esp_mqtt_client_config_t_broker_t_address_t {
                        uri: broker_url_cstr.as_ptr(),
                        ..Default::default()
                    },
                    ..Default::default()
                },
                credentials: esp_mqtt_client_config_t_credentials_t {
                    username: username_cstr.as_ptr(),
                    ..Default::default()
                },
                buffer: esp_mqtt_client_config_t_buffer_t {
                    size: BUFFER_SIZE,
                    out_size: BUFFER_SIZE,
                    ..Default::default()
                },
                ..Default::default()
            };
            let client = esp_mqtt_client_init(&config);
            if client.is_null() {
                drop(Box::from_raw(context));
                return Err(anyhow!("Failed to initialize MQTT client"));
            }
            esp_mqtt_client_register_event(
                client,
                esp_mqtt_event_id_t_MQTT_EVENT_ANY,
                Some(Self::mqtt_event_handler),
                context as *mut c_void,
            );
            let err = esp_mqtt_client_start(client);
            if err != ESP_OK {
                esp_mqtt_client_destroy(client);
                drop(Box::from_raw(context));
                return Err(anyhow!("Failed to start MQTT client, error code: {}", err));
            }
            info!("MQTT client started for {}", broker_url);
            Ok(Self {
                client,
                context,
                request_id: AtomicU32::new(0),
            })
        }
    }

    unsafe extern "C" fn mqtt_event_handler(
        handler_args: *mut c_void,
        _base: esp_event_base_t,
        event_id: i32,
        event_data: *mut c_void,
    ) {
        let context = handler_args as *const Context;
        if context.is_null() || event_data.is_null() {
            error!("MQTT event without context");
            return;
        }
        let context = &*context;
        let event = &*(event_data as *const esp_mqtt_event_t);
        match event_id {
            id if id == esp_mqtt_event_id_t_MQTT_EVENT_CONNECTED as i32 => {
                info!("MQTT connected to broker");
                let responses = format!("{}+", ATTRIBUTES_RESPONSE_TOPIC);
                for topic in [ATTRIBUTES_TOPIC, responses.as_str()] {
                    if let Err(e) = subscribe(event.client, topic) {
                        error!("{:?}", e);
                    }
                }
                // Attributes that changed while offline.
                context.updates.check_now();
            }
            id if id == esp_mqtt_event_id_t_MQTT_EVENT_DISCONNECTED as i32 => {
                warn!("MQTT disconnected from broker");
            }
            id if id == esp_mqtt_event_id_t_MQTT_EVENT_DATA as i32 => {
                Self::on_data(context, event);
            }
            _ => debug!("Unhandled MQTT event, event_id: {}", event_id),
        }
    }

    unsafe fn on_data(context: &Context, event: &esp_mqtt_event_t) {
        let data_len = event.data_len.max(0) as usize;
        let total_len = event.total_data_len.max(0) as usize;
        let offset = event.current_data_offset.max(0) as usize;
        let data: &[u8] = if data_len > 0 {
            core::slice::from_raw_parts(event.data as *const u8, data_len)
        } else {
            &[]
        };

        let Ok(mut partial) = context.partial.lock() else {
            error!("MQTT reassembly buffer poisoned");
            return;
        };
        if offset == 0 {
            partial.clear();
            // Only the first fragment carries the topic.
            let topic_len = event.topic_len.max(0) as usize;
            let topic = if topic_len > 0 {
                let slice = core::slice::from_raw_parts(event.topic as *const u8, topic_len);
                core::str::from_utf8(slice).unwrap_or("")
            } else {
                ""
            };
            if topic != ATTRIBUTES_TOPIC && !topic.starts_with(ATTRIBUTES_RESPONSE_TOPIC) {
                info!("Received MQTT message on unexpected topic: {}", topic);
                return;
            }
            info!("Received attributes on {}, {} bytes", topic, total_len);
        } else if partial.is_empty() {
            return;
        }
        partial.extend_from_slice(data);
        if offset + data_len < total_len {
            return;
        }

        let payload = core::mem::take(&mut *partial);
        match String::from_utf8(payload) {
            Ok(text) => {
                if !context.updates.attributes(text) {
                    error!("Update task is gone, attributes dropped");
                }
            }
            Err(_) => error!("Invalid UTF-8 in attribute message"),
        }
    }

    fn publish(&self, topic: &str, data: &str) -> Result<()> {
        let topic_cstr = CString::new(topic)?;
        let data_cstr = CString::new(data)?;
        let len = i32::try_from(data.len())?;
        let msg_id = unsafe {
            esp_mqtt_client_publish(self.client, topic_cstr.as_ptr(), data_cstr.as_ptr(), len, 1, 0)
        };
        if msg_id < 0 {
            Err(anyhow!("Failed to publish message to {}: {}", topic, msg_id))
        } else {
            debug!("Published message to {} with ID: {}", topic, msg_id);
            Ok(())
        }
    }
}

unsafe fn subscribe(client: esp_mqtt_client_handle_t, topic: &str) -> Result<()> {
    let topic_cstr = CString::new(topic)?;
    let result = esp_mqtt_client_subscribe_single(client, topic_cstr.as_ptr(), 1);
    if result < 0 {
        return Err(anyhow!("Failed to subscribe to topic: {}", topic));
    }
    info!("Subscribed to topic: {}", topic);
    Ok(())
}

impl Telemetry for SimpleMqttClient {
    fn publish_telemetry(&self, payload: &str) -> Result<()> {
        self.publish(TELEMETRY_TOPIC, payload)
    }

    fn publish_attributes(&self, payload: &str) -> Result<()> {
        self.publish(ATTRIBUTES_TOPIC, payload)
    }

    fn request_attributes(&self, shared_keys: &[&str]) -> Result<()> {
        let id = self.request_id.fetch_add(1, Ordering::Relaxed) + 1;
        let topic = format!("{}{}", ATTRIBUTES_REQUEST_TOPIC, id);
        let payload = json!({ "sharedKeys": shared_keys.join(",") });
        self.publish(&topic, &payload.to_string())?;
        info!("Requested firmware info, topic: {}", topic);
        Ok(())
    }
}

impl Drop for SimpleMqttClient {
    fn drop(&mut self) {
        unsafe {
            esp_mqtt_client_stop(self.client);
            esp_mqtt_client_destroy(self.client);
            drop(Box::from_raw(self.context));
        }
    }
}
