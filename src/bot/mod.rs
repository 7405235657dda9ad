//! Chat-bot control channel: the API client, the long-poll ingestion loop
//! with its persisted cursor, and the command dispatcher.

mod api;
mod commands;
mod cursor;
mod ingest;

pub use api::{
    mask_token, ApiError, BotApi, BotChannel, BotUser, Chat, ChatId, Message, Update,
    UpdatesQuery,
};
pub use commands::{CommandDispatcher, HandlerReply, MessageHandler, NOT_A_COMMAND, UNKNOWN_COMMAND};
pub use cursor::BotCredentials;
pub use ingest::{start, Dispatch, IncomingMessage, IngestLoop, IngestSettings, Replier};
