pub mod commands;
pub mod config;
pub mod data;
pub mod data_ext;
pub mod duration;
pub mod handlers;
pub mod logging;
pub mod moderation;

// Log targets
pub const BOT_NAME: &str = "group_sentinel";
pub const COMMAND_TARGET: &str = "group_sentinel::command";
pub const ERROR_TARGET: &str = "group_sentinel::error";
pub const EVENT_TARGET: &str = "group_sentinel::handlers";
pub const CONSOLE_TARGET: &str = "group_sentinel";
pub const SCHEDULER_TARGET: &str = "group_sentinel::scheduler";
pub const AUDIT_TARGET: &str = "group_sentinel::audit";

pub use config::Config;
pub use data::{Data, DataInner};
pub use data_ext::DataAdminExt;
pub type Error = Box<dyn std::error::Error + Send + Sync>;
pub type Context<'a> = poise::Context<'a, Data, Error>;
