//! TeleForward — relays Telegram channel posts to Discord webhooks and Telegram chats.

pub mod channels;
pub mod config;
pub mod delivery;
pub mod error;
pub mod pipeline;
pub mod store;
