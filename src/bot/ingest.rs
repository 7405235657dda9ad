use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, error, info, warn};

use super::api::{ApiError, BotChannel, ChatId, Update, UpdatesQuery};
use super::cursor::BotCredentials;
use crate::line_store::LineStore;
use crate::sleep::SleepHandle;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingMessage {
    pub update_id: i64,
    pub chat: ChatId,
    /// `None` for updates without text (photos, stickers, membership changes).
    pub text: Option<String>,
}

impl From<&Update> for IncomingMessage {
    fn from(update: &Update) -> Self {
        Self {
            update_id: update.update_id,
            chat: update.chat_id(),
            text: update.text().map(str::to_string),
        }
    }
}

pub trait Replier {
    fn reply(&mut self, chat: ChatId, text: &str);
}

/// Receives every delivered message, in order.
pub trait Dispatch {
    fn dispatch(&mut self, message: &IncomingMessage, replier: &mut dyn Replier);
}

struct ChannelReplier<'a, C>(&'a mut C);

impl<C: BotChannel> Replier for ChannelReplier<'_, C> {
    fn reply(&mut self, chat: ChatId, text: &str) {
        match self.0.send_message(chat, text) {
            Ok(()) => debug!("Replied to chat {}", chat),
            Err(e) => error!("Failed to reply to chat {}: {}", chat, e),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestSettings {
    pub long_poll_timeout_s: u64,
    pub poll_interval: Duration,
    pub error_backoff: Duration,
    pub preflight_attempts: u32,
    pub preflight_delay: Duration,
}

impl Default for IngestSettings {
    fn default() -> Self {
        Self {
            long_poll_timeout_s: 20,
            poll_interval: Duration::from_millis(500),
            error_backoff: Duration::from_secs(2),
            preflight_attempts: 5,
            preflight_delay: Duration::from_secs(2),
        }
    }
}

/// Long-polls the bot API and hands each new message to the dispatcher.
///
/// The persisted cursor is the id of the last update handed over. Updates are
/// requested from `cursor + 1`. When that comes back empty the loop asks once
/// more without an offset: if the cursor id is not in that answer the server
/// has dropped it from its history and everything returned is delivered.
pub struct IngestLoop<C, D> {
    channel: C,
    dispatcher: D,
    store: LineStore,
    credentials: BotCredentials,
    settings: IngestSettings,
    /// Highest id delivered by a stale-cursor recovery during this boot.
    recovered_through: Option<i64>,
}

impl<C: BotChannel, D: Dispatch> IngestLoop<C, D> {
    pub fn new(
        channel: C,
        dispatcher: D,
        store: LineStore,
        credentials: BotCredentials,
        settings: IngestSettings,
    ) -> Self {
        Self {
            channel,
            dispatcher,
            store,
            credentials,
            settings,
            recovered_through: None,
        }
    }

    pub fn cursor(&self) -> i64 {
        self.credentials.cursor
    }

    pub fn dispatcher(&self) -> &D {
        &self.dispatcher
    }

    /// Checks the bot API is reachable. Polling starts regardless.
    pub fn preflight(&mut self) -> bool {
        for attempt in 1..=self.settings.preflight_attempts {
            match self.channel.get_me() {
                Ok(me) => {
                    info!(
                        "Bot API reachable as @{} ({})",
                        me.username.as_deref().unwrap_or("?"),
                        me.id
                    );
                    return true;
                }
                Err(e) => {
                    warn!(
                        "getMe attempt {}/{} failed: {}",
                        attempt, self.settings.preflight_attempts, e
                    );
                    if attempt < self.settings.preflight_attempts {
                        thread::sleep(self.settings.preflight_delay);
                    }
                }
            }
        }
        warn!("Bot API not reachable, polling anyway");
        false
    }

    /// Skips the backlog: moves the cursor to the newest update without
    /// dispatching anything.
    pub fn startup_sync(&mut self) {
        self.preflight();
        let query = UpdatesQuery {
            offset: Some(-1),
            limit: Some(1),
            timeout_s: 1,
        };
        match self.channel.get_updates(query) {
            Ok(updates) => {
                match updates.iter().map(|u| u.update_id).max() {
                    Some(newest) if newest > self.credentials.cursor => {
                        info!(
                            "Skipping backlog: cursor {} -> {}",
                            self.credentials.cursor, newest
                        );
                        self.advance_cursor(newest);
                    }
                    _ => info!("No backlog, cursor stays at {}", self.credentials.cursor),
                }
            }
            Err(e) => warn!("Startup sync failed: {}", e),
        }
    }

    /// One poll cycle. Returns how many messages were dispatched.
    pub fn poll_once(&mut self) -> Result<usize, ApiError> {
        let cursor = self.credentials.cursor;
        let offset = (cursor != 0).then_some(cursor + 1);
        let updates = self.channel.get_updates(UpdatesQuery {
            offset,
            limit: None,
            timeout_s: self.settings.long_poll_timeout_s,
        })?;

        let (batch, stale) = if !updates.is_empty() || offset.is_none() {
            (updates, false)
        } else {
            debug!("No updates after {}, checking server history", cursor);
            let history = self.channel.get_updates(UpdatesQuery::default())?;
            let found = history.iter().any(|u| u.update_id == cursor);
            if found {
                // Server history caught up with the cursor again; a later
                // loss of it is a new recovery.
                self.recovered_through = None;
            } else if !history.is_empty() {
                warn!(
                    "Cursor {} is no longer in server history, delivering {} update(s)",
                    cursor,
                    history.len()
                );
            }
            (history, !found)
        };
        Ok(self.deliver(&batch, stale))
    }

    fn deliver(&mut self, batch: &[Update], stale: bool) -> usize {
        let cursor = self.credentials.cursor;
        let mut last = if stale {
            self.recovered_through.unwrap_or(i64::MIN)
        } else {
            cursor
        };
        let mut delivered = 0;
        for update in batch {
            if update.update_id <= last {
                debug!("Skipping update {} (<= {})", update.update_id, last);
                continue;
            }
            last = update.update_id;
            let message = IncomingMessage::from(update);
            info!(
                "update_id={} chat={} text={:?}",
                message.update_id, message.chat, message.text
            );
            self.dispatcher
                .dispatch(&message, &mut ChannelReplier(&mut self.channel));
            delivered += 1;
        }
        if stale && delivered > 0 {
            self.recovered_through = Some(last);
        }

        if let Some(newest) = batch.iter().map(|u| u.update_id).max() {
            if newest > cursor {
                self.advance_cursor(newest);
            }
        }
        delivered
    }

    fn advance_cursor(&mut self, id: i64) {
        self.credentials.cursor = id;
        if let Err(e) = self.store.save(&self.credentials) {
            error!("Failed to persist cursor {}: {}", id, e);
        }
    }

    pub fn run(mut self) -> ! {
        loop {
            match self.poll_once() {
                Ok(_) => thread::sleep(self.settings.poll_interval),
                Err(e) => {
                    warn!("Poll failed: {}", e);
                    thread::sleep(self.settings.error_backoff);
                }
            }
        }
    }
}

/// Runs the startup sync, releases the idle countdown and then polls forever
/// on a dedicated thread.
pub fn start<C, D>(mut ingest: IngestLoop<C, D>, sleep: SleepHandle) -> anyhow::Result<JoinHandle<()>>
where
    C: BotChannel + 'static,
    D: Dispatch + Send + 'static,
{
    let handle = thread::Builder::new()
        .name("bot-ingest".into())
        .stack_size(16 * 1024)
        .spawn(move || {
            ingest.startup_sync();
            sleep.start_idle_countdown();
            ingest.run()
        })?;
    Ok(handle)
}
