pub mod commands;
pub mod config;
pub mod data;
pub mod guild;
pub mod handlers;
pub mod logging;
pub mod notify;
pub mod repository;
pub mod store;
pub mod sweep;

// Customize these constants for your bot
pub const BOT_NAME: &str = "steward";
pub const COMMAND_TARGET: &str = "steward::command";
pub const ERROR_TARGET: &str = "steward::error";
pub const EVENT_TARGET: &str = "steward::handlers";
pub const CONSOLE_TARGET: &str = "steward";
pub const STORE_TARGET: &str = "steward::store";
pub const SWEEP_TARGET: &str = "steward::sweep";

pub use config::BotConfig;
pub use data::{Data, DataInner};
pub use store::FileStore;
pub type Error = Box<dyn std::error::Error + Send + Sync>;
pub type Context<'a> = poise::Context<'a, Data, Error>;
