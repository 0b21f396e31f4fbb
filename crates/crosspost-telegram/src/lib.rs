//! Telegram integration for crosspost.
//!
//! - A minimal Bot API client (long polling, messages, media groups)
//! - [`TelegramChannelPublisher`], which posts albums to the target channel
//! - [`TelegramUserNotifier`], which tells requesters about their jobs

mod client;
mod error;
mod notifier;
mod publisher;
mod types;

pub use client::{DEFAULT_API_BASE, TelegramClient};
pub use error::TelegramError;
pub use notifier::TelegramUserNotifier;
pub use publisher::TelegramChannelPublisher;
pub use types::{
    ApiResponse, Chat, ChatId, InputMedia, MediaUpload, Message, ParseMode, ResponseParameters,
    Update, User,
};
