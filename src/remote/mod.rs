//! 远端存储模块
//!
//! ## 支持的后端
//! - **Firestore**: REST API（`runQuery` 读取，`commit` 批量写入）
//! - **Memory**: 进程内存储，用于离线运行与测试
//!
//! ## 使用示例
//! ```rust,ignore
//! use schedule_sync_lib::remote::{create_remote_store, RemoteStoreConfig};
//!
//! let remote = create_remote_store(&config.remote)?;
//! let items = remote.query_items(&user, Some(last_sync_time)).await?;
//! ```

mod config;
pub mod firestore;
mod memory;
mod traits;

pub use config::{RemoteProvider, RemoteStoreConfig, FIRESTORE_COMMIT_LIMIT};
pub use firestore::FirestoreStore;
pub use memory::MemoryRemoteStore;
pub use traits::{
    LegacyCollection, RemoteError, RemoteStore, Result, DEFAULT_MAX_BATCH_SIZE,
    EVENTS_COLLECTION, MESSAGES_COLLECTION,
};

use std::sync::Arc;

/// 根据配置创建远端存储实例
pub fn create_remote_store(config: &RemoteStoreConfig) -> Result<Arc<dyn RemoteStore>> {
    config.validate().map_err(|e| RemoteError::Rejected {
        status: 0,
        message: e,
    })?;

    match config.provider {
        RemoteProvider::Firestore => {
            let store = FirestoreStore::new(config)?;
            tracing::info!(
                "[Remote] Using Firestore project {} at {}",
                config.project_id,
                config.api_base
            );
            Ok(Arc::new(store))
        }
        RemoteProvider::Memory => {
            tracing::info!("[Remote] Using in-memory remote store");
            Ok(Arc::new(MemoryRemoteStore::with_max_batch_size(
                config.max_batch_size,
            )))
        }
    }
}
