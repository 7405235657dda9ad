//! Chat commands controlling deep sleep and firmware.
//!
//! Every command gets exactly one reply. Arguments are validated before the
//! policy is touched, so a rejected command leaves the stored policy as is.

use std::time::Duration;

use log::{info, warn};

use super::api::ChatId;
use super::ingest::{Dispatch, IncomingMessage, Replier};
use crate::firmware::UpdateHandle;
use crate::sleep::{PolicyError, SleepHandle, IDLE_TIMEOUT_RANGE_MS, INTERVAL_RANGE_MS};

pub const NOT_A_COMMAND: &str = "Not a valid command";
pub const UNKNOWN_COMMAND: &str = "Unknown command";

const STATUS_TIMEOUT: Duration = Duration::from_secs(2);

pub enum HandlerReply {
    Reply(String),
    /// Consumed without a reply.
    Handled,
    /// Not for this handler, the default reply applies.
    Declined,
}

/// Application hook for messages that are not commands. Messages without
/// text arrive with `text == None`.
pub trait MessageHandler: Send {
    fn on_message(&mut self, chat: ChatId, text: Option<&str>) -> HandlerReply;
}

enum Action {
    Reply(String),
    /// Reply first, then force deep sleep.
    Sleep(String),
}

pub struct CommandDispatcher {
    sleep: SleepHandle,
    firmware: Option<UpdateHandle>,
    handler: Option<Box<dyn MessageHandler>>,
}

impl CommandDispatcher {
    pub fn new(sleep: SleepHandle) -> Self {
        Self {
            sleep,
            firmware: None,
            handler: None,
        }
    }

    pub fn with_firmware(mut self, firmware: UpdateHandle) -> Self {
        self.firmware = Some(firmware);
        self
    }

    pub fn with_handler(mut self, handler: Box<dyn MessageHandler>) -> Self {
        self.handler = Some(handler);
        self
    }

    fn execute(&mut self, chat: ChatId, command: &str, arg: &str) -> Action {
        match command {
            "/setdeepsleepduration" => Action::Reply(self.set_interval(arg)),
            "/setdeepsleepdelay" => Action::Reply(self.set_idle_timeout(arg)),
            "/toggledeepsleep" => Action::Reply(self.toggle(arg)),
            "/getdeepsleepstatus" => Action::Reply(self.sleep_status()),
            "/getid" => Action::Reply(chat.to_string()),
            "/deepsleep" => self.deep_sleep(),
            "/firmware" => Action::Reply(self.firmware_status()),
            "/checkupdate" => Action::Reply(self.check_update()),
            _ => Action::Reply(UNKNOWN_COMMAND.to_string()),
        }
    }

    fn set_interval(&self, arg: &str) -> String {
        if arg.is_empty() {
            return "Usage: /setdeepsleepduration <milliseconds>".to_string();
        }
        let Some(ms) = parse_ms(arg).filter(|ms| INTERVAL_RANGE_MS.contains(ms)) else {
            return format!(
                "Invalid value. Provide milliseconds between {} and {}.",
                INTERVAL_RANGE_MS.start(),
                INTERVAL_RANGE_MS.end()
            );
        };
        match self.sleep.set_interval(ms) {
            Ok(_) => format!("deepsleep interval set to {} ms", ms),
            Err(_) => "Failed to persist deepsleep interval.".to_string(),
        }
    }

    fn set_idle_timeout(&self, arg: &str) -> String {
        if arg.is_empty() {
            return "Usage: /setdeepsleepdelay <milliseconds>".to_string();
        }
        let Some(ms) = parse_ms(arg).filter(|ms| IDLE_TIMEOUT_RANGE_MS.contains(ms)) else {
            return format!(
                "Invalid value. Provide milliseconds between {} and {}.",
                IDLE_TIMEOUT_RANGE_MS.start(),
                IDLE_TIMEOUT_RANGE_MS.end()
            );
        };
        match self.sleep.set_idle_timeout(ms) {
            Ok(_) => format!("idle timeout set to {} ms", ms),
            Err(_) => "Failed to persist idle timeout.".to_string(),
        }
    }

    fn toggle(&self, arg: &str) -> String {
        match arg.to_ascii_lowercase().as_str() {
            "off" => match self.sleep.set_enabled(false) {
                Ok(_) => "deepsleep disabled".to_string(),
                Err(_) => "Failed to disable deepsleep.".to_string(),
            },
            "on" => match self.sleep.set_enabled(true) {
                Ok(policy) => format!("deepsleep enabled (interval: {} ms)", policy.interval_ms),
                Err(PolicyError::NoInterval) => {
                    "No interval set. Use /setdeepsleepduration <ms> first.".to_string()
                }
                Err(_) => "Failed to enable deepsleep.".to_string(),
            },
            _ => "Usage: /toggledeepsleep on|off".to_string(),
        }
    }

    fn sleep_status(&self) -> String {
        match self.sleep.status() {
            Ok(policy) if policy.interval_ms == 0 => format!(
                "deepsleep interval not set; enabled={}; idle timeout={} ms",
                u8::from(policy.enabled),
                policy.idle_timeout_ms
            ),
            Ok(policy) => format!(
                "deepsleep interval={} ms; enabled={}; idle timeout={} ms",
                policy.interval_ms,
                u8::from(policy.enabled),
                policy.idle_timeout_ms
            ),
            Err(e) => format!("Sleep status unavailable: {}", e),
        }
    }

    fn deep_sleep(&self) -> Action {
        match self.sleep.status() {
            Ok(policy) if policy.interval_ms == 0 => Action::Reply(
                "No deepsleep interval set. Use /setdeepsleepduration <ms> first.".to_string(),
            ),
            Ok(policy) if !policy.enabled => Action::Reply(
                "Deep-sleep is currently disabled. Use /toggledeepsleep on to enable, or use /deepsleep to force immediate sleep after enabling.".to_string(),
            ),
            Ok(policy) => Action::Sleep(format!("Entering deep sleep for {} ms", policy.interval_ms)),
            Err(e) => Action::Reply(format!("Sleep status unavailable: {}", e)),
        }
    }

    fn firmware_status(&self) -> String {
        let Some(firmware) = &self.firmware else {
            return "Firmware updates are not configured.".to_string();
        };
        let Some(status) = firmware.status(STATUS_TIMEOUT) else {
            return "Firmware status unavailable.".to_string();
        };
        let mut reply = format!(
            "firmware {} {} ({}); state={:?}",
            status.record.title,
            status.record.version,
            if status.record.confirmed { "confirmed" } else { "unconfirmed" },
            status.state
        );
        if let Some(version) = status.pending_version {
            reply.push_str(&format!(
                "; pending={} after {} attempt(s)",
                version, status.pending_attempts
            ));
        }
        if let Some(tag) = status.last_error {
            reply.push_str(&format!("; last error={}", tag));
        }
        reply
    }

    fn check_update(&self) -> String {
        match &self.firmware {
            Some(firmware) if firmware.check_now() => "Requested firmware info".to_string(),
            Some(_) => "Firmware status unavailable.".to_string(),
            None => "Firmware updates are not configured.".to_string(),
        }
    }
}

impl Dispatch for CommandDispatcher {
    fn dispatch(&mut self, message: &IncomingMessage, replier: &mut dyn Replier) {
        let chat = message.chat;
        let Some(text) = message.text.as_deref().map(str::trim) else {
            if let Some(handler) = self.handler.as_mut() {
                if let HandlerReply::Reply(reply) = handler.on_message(chat, None) {
                    replier.reply(chat, &reply);
                }
            }
            return;
        };

        if !text.starts_with('/') {
            let outcome = self
                .handler
                .as_mut()
                .map(|handler| handler.on_message(chat, Some(text)));
            match outcome {
                Some(HandlerReply::Reply(reply)) => replier.reply(chat, &reply),
                Some(HandlerReply::Handled) => {}
                Some(HandlerReply::Declined) | None => replier.reply(chat, NOT_A_COMMAND),
            }
            return;
        }

        let (command, arg) = split_command(text);
        info!("Command {} from chat {}", command, chat);
        match self.execute(chat, &command, arg) {
            Action::Reply(reply) => replier.reply(chat, &reply),
            Action::Sleep(reply) => {
                replier.reply(chat, &reply);
                if let Err(e) = self.sleep.force_sleep() {
                    warn!("Force-sleep refused: {}", e);
                    replier.reply(
                        chat,
                        "Failed to force deep sleep (check enabled flag and interval)",
                    );
                }
            }
        }
    }
}

/// Lowercased command without any `@botname` suffix, and the trimmed rest.
fn split_command(text: &str) -> (String, &str) {
    let (head, arg) = text
        .split_once(char::is_whitespace)
        .unwrap_or((text, ""));
    let command = head.split('@').next().unwrap_or(head);
    (command.to_ascii_lowercase(), arg.trim())
}

fn parse_ms(arg: &str) -> Option<u64> {
    arg.split_whitespace().next()?.parse().ok()
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;
    use crate::line_store::LineStore;
    use crate::sleep::{self, PolicyRecord};
    use crate::testing::FakePower;

    #[derive(Default)]
    struct Replies(Vec<(ChatId, String)>);

    impl Replier for Replies {
        fn reply(&mut self, chat: ChatId, text: &str) {
            self.0.push((chat, text.to_string()));
        }
    }

    struct Rig {
        dispatcher: CommandDispatcher,
        store: LineStore,
        power: FakePower,
        _dir: tempfile::TempDir,
    }

    fn rig(policy: Option<PolicyRecord>) -> Rig {
        let dir = tempfile::tempdir().unwrap();
        let store = LineStore::new(dir.path().join("sleep.txt"));
        if let Some(policy) = policy {
            store.save(&policy).unwrap();
        }
        let power = FakePower::default();
        let sleep = sleep::spawn(store.clone(), power.clone()).unwrap();
        Rig {
            dispatcher: CommandDispatcher::new(sleep),
            store,
            power,
            _dir: dir,
        }
    }

    fn send(rig: &mut Rig, text: Option<&str>) -> Vec<String> {
        let message = IncomingMessage {
            update_id: 1,
            chat: ChatId(77),
            text: text.map(str::to_string),
        };
        let mut replies = Replies::default();
        rig.dispatcher.dispatch(&message, &mut replies);
        replies.0.into_iter().map(|(_, text)| text).collect()
    }

    #[test]
    fn below_minimum_interval_is_rejected_without_writing() {
        let mut rig = rig(Some(PolicyRecord {
            interval_ms: 60_000,
            idle_timeout_ms: 1_000,
            enabled: false,
        }));
        let before = fs::read(rig.store.path()).unwrap();

        assert_eq!(
            send(&mut rig, Some("/setdeepsleepduration 500")),
            vec!["Invalid value. Provide milliseconds between 1000 and 604800000."]
        );
        assert_eq!(fs::read(rig.store.path()).unwrap(), before);
    }

    #[test]
    fn valid_interval_is_persisted_and_echoed() {
        let mut rig = rig(None);
        assert_eq!(
            send(&mut rig, Some("/SetDeepSleepDuration@node_bot  5000")),
            vec!["deepsleep interval set to 5000 ms"]
        );
        assert_eq!(
            rig.store.load::<PolicyRecord>().unwrap().unwrap().interval_ms,
            5000
        );
    }

    #[test]
    fn argument_errors_get_usage_or_range_reply() {
        let mut rig = rig(None);
        assert_eq!(
            send(&mut rig, Some("/setdeepsleepduration")),
            vec!["Usage: /setdeepsleepduration <milliseconds>"]
        );
        assert_eq!(
            send(&mut rig, Some("/setdeepsleepdelay soon")),
            vec!["Invalid value. Provide milliseconds between 100 and 86400000."]
        );
        assert_eq!(
            send(&mut rig, Some("/setdeepsleepdelay 86400001")),
            vec!["Invalid value. Provide milliseconds between 100 and 86400000."]
        );
        assert_eq!(
            send(&mut rig, Some("/toggledeepsleep maybe")),
            vec!["Usage: /toggledeepsleep on|off"]
        );
        assert!(rig.store.read(3).unwrap().is_none());
    }

    #[test]
    fn toggle_requires_interval_then_reports_status() {
        let mut rig = rig(None);
        assert_eq!(
            send(&mut rig, Some("/toggledeepsleep on")),
            vec!["No interval set. Use /setdeepsleepduration <ms> first."]
        );
        assert_eq!(
            send(&mut rig, Some("/getdeepsleepstatus")),
            vec!["deepsleep interval not set; enabled=0; idle timeout=0 ms"]
        );
        send(&mut rig, Some("/setdeepsleepduration 60000"));
        send(&mut rig, Some("/setdeepsleepdelay 100000"));
        assert_eq!(
            send(&mut rig, Some("/toggledeepsleep ON")),
            vec!["deepsleep enabled (interval: 60000 ms)"]
        );
        assert_eq!(
            send(&mut rig, Some("/getdeepsleepstatus")),
            vec!["deepsleep interval=60000 ms; enabled=1; idle timeout=100000 ms"]
        );
        assert_eq!(
            send(&mut rig, Some("/toggledeepsleep off")),
            vec!["deepsleep disabled"]
        );
    }

    #[test]
    fn forced_sleep_replies_once_then_sleeps() {
        let mut rig = rig(Some(PolicyRecord {
            interval_ms: 30_000,
            idle_timeout_ms: 0,
            enabled: true,
        }));
        assert_eq!(
            send(&mut rig, Some("/deepsleep")),
            vec!["Entering deep sleep for 30000 ms"]
        );
        // The service answers before it goes to sleep.
        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while rig.power.sleeps().is_empty() && std::time::Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(rig.power.sleeps(), vec![Duration::from_millis(30_000)]);
    }

    #[test]
    fn forced_sleep_refused_when_disabled() {
        let mut rig = rig(Some(PolicyRecord {
            interval_ms: 30_000,
            idle_timeout_ms: 0,
            enabled: false,
        }));
        let replies = send(&mut rig, Some("/deepsleep"));
        assert_eq!(replies.len(), 1);
        assert!(replies[0].starts_with("Deep-sleep is currently disabled."));
        assert!(rig.power.sleeps().is_empty());
    }

    #[test]
    fn getid_and_unknown_commands() {
        let mut rig = rig(None);
        assert_eq!(send(&mut rig, Some("/getid")), vec!["77"]);
        assert_eq!(send(&mut rig, Some("/reboot")), vec![UNKNOWN_COMMAND]);
        assert_eq!(send(&mut rig, Some("hello")), vec![NOT_A_COMMAND]);
        assert!(send(&mut rig, None).is_empty());
        assert_eq!(
            send(&mut rig, Some("/firmware")),
            vec!["Firmware updates are not configured."]
        );
    }

    struct Echo {
        seen: std::sync::Arc<std::sync::Mutex<Vec<Option<String>>>>,
    }

    impl MessageHandler for Echo {
        fn on_message(&mut self, _chat: ChatId, text: Option<&str>) -> HandlerReply {
            self.seen.lock().unwrap().push(text.map(str::to_string));
            match text {
                Some("ignore me") => HandlerReply::Declined,
                Some(text) => HandlerReply::Reply(format!("echo: {text}")),
                None => HandlerReply::Handled,
            }
        }
    }

    #[test]
    fn registered_handler_sees_text_first() {
        let seen = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        let mut rig = rig(None);
        rig.dispatcher = CommandDispatcher::new(rig.dispatcher.sleep.clone())
            .with_handler(Box::new(Echo { seen: seen.clone() }));

        assert_eq!(send(&mut rig, Some("hi")), vec!["echo: hi"]);
        assert_eq!(send(&mut rig, Some("ignore me")), vec![NOT_A_COMMAND]);
        assert!(send(&mut rig, None).is_empty());
        assert_eq!(send(&mut rig, Some("/getid")), vec!["77"]);

        assert_eq!(
            *seen.lock().unwrap(),
            vec![Some("hi".to_string()), Some("ignore me".to_string()), None]
        );
    }

    #[test]
    fn command_split_handles_suffix_and_spacing() {
        assert_eq!(split_command("/GetId@bot"), ("/getid".to_string(), ""));
        assert_eq!(
            split_command("/setdeepsleepdelay   250 "),
            ("/setdeepsleepdelay".to_string(), "250")
        );
    }
}
