use std::fmt;
use std::time::Duration;

use log::debug;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use thiserror::Error;

use crate::transport::{percent_encode, Request, Transport, TransportError};

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_TIMEOUT_S: u64 = 120;

/// Conversation an update came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ChatId(pub i64);

impl ChatId {
    /// Stand-in for updates that carry no chat.
    pub const UNKNOWN: ChatId = ChatId(0);
}

impl fmt::Display for ChatId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("bot API answered HTTP {0}")]
    Status(u16),
    #[error("malformed bot API response: {0}")]
    Malformed(String),
    #[error("bot API rejected the request: {0}")]
    Rejected(String),
}

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    ok: bool,
    result: Option<T>,
    #[serde(default)]
    description: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Chat {
    pub id: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Message {
    #[serde(default)]
    pub chat: Option<Chat>,
    #[serde(default)]
    pub text: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct Update {
    pub update_id: i64,
    #[serde(default)]
    pub message: Option<Message>,
    #[serde(default)]
    pub edited_message: Option<Message>,
    #[serde(default)]
    pub channel_post: Option<Message>,
    #[serde(default)]
    pub edited_channel_post: Option<Message>,
}

impl Update {
    fn body(&self) -> Option<&Message> {
        self.message
            .as_ref()
            .or(self.edited_message.as_ref())
            .or(self.channel_post.as_ref())
            .or(self.edited_channel_post.as_ref())
    }

    pub fn chat_id(&self) -> ChatId {
        self.body()
            .and_then(|message| message.chat.as_ref())
            .map_or(ChatId::UNKNOWN, |chat| ChatId(chat.id))
    }

    pub fn text(&self) -> Option<&str> {
        self.body().and_then(|message| message.text.as_deref())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct BotUser {
    pub id: i64,
    #[serde(default)]
    pub username: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpdatesQuery {
    pub offset: Option<i64>,
    pub limit: Option<u32>,
    /// Server-side long-poll wait.
    pub timeout_s: u64,
}

impl UpdatesQuery {
    fn to_query(self) -> String {
        let mut query = format!("?timeout={}", self.timeout_s);
        if let Some(offset) = self.offset {
            query.push_str(&format!("&offset={}", offset));
        }
        if let Some(limit) = self.limit {
            query.push_str(&format!("&limit={}", limit));
        }
        query
    }

    /// Client-side deadline: the long-poll wait plus a margin.
    fn http_timeout(self) -> Duration {
        if self.timeout_s == 0 {
            DEFAULT_TIMEOUT
        } else {
            Duration::from_secs((self.timeout_s + 5).min(MAX_TIMEOUT_S))
        }
    }
}

/// The chat-bot endpoints the node relies on.
pub trait BotChannel: Send {
    fn get_me(&mut self) -> Result<BotUser, ApiError>;

    fn get_updates(&mut self, query: UpdatesQuery) -> Result<Vec<Update>, ApiError>;

    fn send_message(&mut self, chat: ChatId, text: &str) -> Result<(), ApiError>;
}

/// Bot API client over a [`Transport`].
pub struct BotApi<T> {
    transport: T,
    base: String,
    token: String,
}

impl<T: Transport> BotApi<T> {
    pub fn new(transport: T, base: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            transport,
            base: base.into().trim_end_matches('/').to_string(),
            token: token.into(),
        }
    }

    fn call<R: DeserializeOwned>(
        &mut self,
        method: &str,
        query: &str,
        timeout: Duration,
    ) -> Result<R, ApiError> {
        let url = format!("{}/bot{}/{}{}", self.base, self.token, method, query);
        debug!("Bot API {} (token {})", method, mask_token(&self.token));
        let reply = self.transport.fetch(&Request::get(&url, timeout))?;

        let envelope: Envelope<R> = match serde_json::from_slice(&reply.body) {
            Ok(envelope) => envelope,
            Err(_) if !reply.is_success() => return Err(ApiError::Status(reply.status)),
            Err(e) => return Err(ApiError::Malformed(e.to_string())),
        };
        if !envelope.ok {
            return Err(ApiError::Rejected(
                envelope
                    .description
                    .unwrap_or_else(|| format!("HTTP {}", reply.status)),
            ));
        }
        envelope
            .result
            .ok_or_else(|| ApiError::Malformed("missing result".to_string()))
    }
}

impl<T: Transport> BotChannel for BotApi<T> {
    fn get_me(&mut self) -> Result<BotUser, ApiError> {
        self.call("getMe", "", DEFAULT_TIMEOUT)
    }

    fn get_updates(&mut self, query: UpdatesQuery) -> Result<Vec<Update>, ApiError> {
        self.call("getUpdates", &query.to_query(), query.http_timeout())
    }

    fn send_message(&mut self, chat: ChatId, text: &str) -> Result<(), ApiError> {
        let query = format!("?chat_id={}&text={}", chat, percent_encode(text));
        let _: serde_json::Value = self.call("sendMessage", &query, DEFAULT_TIMEOUT)?;
        Ok(())
    }
}

/// Token suitable for logs.
pub fn mask_token(token: &str) -> String {
    if token.len() <= 12 || !token.is_ascii() {
        return "<redacted>".to_string();
    }
    format!("{}...{}", &token[..6], &token[token.len() - 6..])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeTransport;
    use crate::transport::Method;

    fn api(transport: &FakeTransport) -> BotApi<FakeTransport> {
        BotApi::new(transport.clone(), "https://bot.example/", "123:SECRET")
    }

    #[test]
    fn updates_decode_with_optional_parts() {
        let transport = FakeTransport::default();
        transport.respond(
            200,
            r#"{"ok":true,"result":[
                {"update_id":7,"message":{"chat":{"id":42},"text":"/getid"}},
                {"update_id":8,"message":{"chat":{"id":42},"photo":[]}},
                {"update_id":9,"message":{"text":"orphan"}},
                {"update_id":10,"my_chat_member":{}}
            ]}"#,
        );
        let updates = api(&transport)
            .get_updates(UpdatesQuery {
                offset: Some(7),
                limit: None,
                timeout_s: 20,
            })
            .unwrap();

        assert_eq!(updates.len(), 4);
        assert_eq!(updates[0].chat_id(), ChatId(42));
        assert_eq!(updates[0].text(), Some("/getid"));
        assert_eq!(updates[1].text(), None);
        assert_eq!(updates[2].chat_id(), ChatId::UNKNOWN);
        assert_eq!(updates[3].chat_id(), ChatId::UNKNOWN);
        assert_eq!(
            transport.requests(),
            vec![(
                Method::Get,
                "https://bot.example/bot123:SECRET/getUpdates?timeout=20&offset=7".to_string()
            )]
        );
    }

    #[test]
    fn update_without_id_rejects_the_batch() {
        let transport = FakeTransport::default();
        transport.respond(200, r#"{"ok":true,"result":[{"message":{"text":"hi"}}]}"#);
        assert!(matches!(
            api(&transport).get_updates(UpdatesQuery::default()),
            Err(ApiError::Malformed(_))
        ));
    }

    #[test]
    fn error_envelope_and_bare_status_are_distinguished() {
        let transport = FakeTransport::default();
        transport.respond(401, r#"{"ok":false,"error_code":401,"description":"Unauthorized"}"#);
        transport.respond(502, "<html>bad gateway</html>");
        let mut api = api(&transport);

        match api.get_me() {
            Err(ApiError::Rejected(description)) => assert_eq!(description, "Unauthorized"),
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(api.get_me(), Err(ApiError::Status(502))));
    }

    #[test]
    fn send_message_encodes_text() {
        let transport = FakeTransport::default();
        transport.respond(200, r#"{"ok":true,"result":{"message_id":1}}"#);
        api(&transport)
            .send_message(ChatId(-100), "deepsleep interval set to 5000 ms")
            .unwrap();
        assert_eq!(
            transport.requests()[0].1,
            "https://bot.example/bot123:SECRET/sendMessage?chat_id=-100&text=deepsleep%20interval%20set%20to%205000%20ms"
        );
    }

    #[test]
    fn long_poll_timeout_gets_margin_and_cap() {
        let query = |timeout_s| UpdatesQuery {
            timeout_s,
            ..UpdatesQuery::default()
        };
        assert_eq!(query(20).http_timeout(), Duration::from_secs(25));
        assert_eq!(query(300).http_timeout(), Duration::from_secs(120));
        assert_eq!(query(0).http_timeout(), DEFAULT_TIMEOUT);
    }

    #[test]
    fn tokens_are_masked() {
        assert_eq!(
            mask_token("123456789:ABCDEFGHIJKLMNOP"),
            "123456...KLMNOP"
        );
        assert_eq!(mask_token("short"), "<redacted>");
    }
}
