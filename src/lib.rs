// Schedule Sync library entry
// 本地日程 / 消息日志与云端文档库的同步引擎，bin 目标只负责装配与命令行。

pub mod config;
pub mod database;
pub mod events;
pub mod message_source;
pub mod models;
pub mod remote;
pub mod session;
pub mod state_store;
pub mod sync;
pub mod watcher;

pub use config::SyncConfig;
pub use models::{Message, ScheduleItem, ScheduleKind};
pub use sync::{SyncEngine, SyncError};
