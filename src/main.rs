use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::EnvFilter;

use schedule_sync_lib::database::{LocalStore, ScheduleDatabase, WatermarkStore};
use schedule_sync_lib::events::{BroadcastBus, NotificationBus};
use schedule_sync_lib::message_source::{MessageSource, UdbMessageSource};
use schedule_sync_lib::models::{format_timestamp, DateRange};
use schedule_sync_lib::remote::{create_remote_store, RemoteStore};
use schedule_sync_lib::session::{SessionProvider, StaticSession};
use schedule_sync_lib::state_store::StateStore;
use schedule_sync_lib::sync::{
    migrate_legacy_collections, ChunkedUploader, EngineDeps, PassMode, ProgressFn, SyncEngine,
    TriggerScheduler,
};
use schedule_sync_lib::watcher::MessageSourceWatcher;
use schedule_sync_lib::SyncConfig;

#[derive(Parser)]
#[command(name = "schedule-sync", version, about = "日程 / 消息日志与云端的同步")]
struct Cli {
    /// 配置文件路径（默认读取当前目录下的 schedule-sync.toml）
    #[arg(long, global = true, env = "SCHEDULE_SYNC_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// 立即执行一次手动同步
    Sync,
    /// 常驻运行：定时同步、监听消息源变化
    Daemon,
    /// 只上传新消息
    PushMessages,
    /// 输出本地同步状态
    Status,
    /// 将旧版 todos / schedules 集合迁移到 events
    MigrateLegacy,
}

/// 装配好的运行时依赖
struct Runtime {
    config: SyncConfig,
    db: Arc<ScheduleDatabase>,
    remote: Arc<dyn RemoteStore>,
    session: Arc<StaticSession>,
    bus: Arc<BroadcastBus>,
    source: Option<Arc<dyn MessageSource>>,
}

impl Runtime {
    fn build(config: SyncConfig) -> anyhow::Result<Self> {
        let db = Arc::new(ScheduleDatabase::open(&config.data_dir)?);
        let remote = create_remote_store(&config.remote)?;
        let session = Arc::new(config.session());
        let source = config
            .udb_path
            .as_ref()
            .map(|path| Arc::new(UdbMessageSource::new(path)) as Arc<dyn MessageSource>);
        Ok(Self {
            config,
            db,
            remote,
            session,
            bus: Arc::new(BroadcastBus::default()),
            source,
        })
    }

    fn engine(&self) -> SyncEngine {
        let bus: Arc<dyn NotificationBus> = self.bus.clone();
        let deps = EngineDeps {
            local: self.db.clone(),
            watermarks: self.db.clone(),
            remote: Arc::clone(&self.remote),
            session: self.session.clone(),
            bus: Arc::clone(&bus),
            state: Arc::new(StateStore::new(bus)),
            source: self.source.clone(),
        };
        SyncEngine::new(
            deps,
            self.config.orchestrator_config(),
            self.config.uploader_config(),
        )
    }
}

fn print_progress() -> ProgressFn {
    Arc::new(|current: u64, total: u64| eprintln!("messages: {}/{}", current, total))
}

async fn run_sync(rt: &Runtime) -> anyhow::Result<()> {
    let report = rt
        .engine()
        .run_pass(PassMode::Manual, Some(print_progress()))
        .await?;
    println!(
        "{}",
        serde_json::to_string_pretty(&json!({
            "reconcile": report.reconcile,
            "upload": report.upload,
        }))?
    );
    Ok(())
}

async fn run_daemon(rt: &Runtime) -> anyhow::Result<()> {
    let engine = Arc::new(rt.engine());
    let scheduler = TriggerScheduler::new(engine, rt.config.scheduler_config());
    let handle = scheduler.start(rt.bus.as_ref());

    let cancel = CancellationToken::new();
    let watcher_task = rt
        .source
        .as_ref()
        .zip(rt.config.udb_path.as_deref())
        .map(|(source, udb_path)| {
            Arc::new(
                MessageSourceWatcher::new(
                    Arc::clone(source),
                    rt.bus.clone(),
                    rt.config.watcher_fallback_interval(),
                )
                .with_wal_of(udb_path),
            )
            .spawn(cancel.clone())
        });

    // 启动后先同步一次
    {
        let scheduler = Arc::clone(&scheduler);
        tokio::spawn(async move {
            scheduler.trigger_silent().await;
        });
    }

    info!("[Daemon] Running, press Ctrl+C to stop");
    tokio::signal::ctrl_c().await?;
    info!("[Daemon] Shutting down");

    cancel.cancel();
    if let Some(task) = watcher_task {
        task.await.ok();
    }
    handle.shutdown().await;
    Ok(())
}

async fn run_push_messages(rt: &Runtime) -> anyhow::Result<()> {
    let source = rt
        .source
        .clone()
        .context("udb_path is not configured")?;
    let uploader = ChunkedUploader::new(
        source,
        Arc::clone(&rt.remote),
        rt.session.clone(),
        rt.config.uploader_config(),
    );
    let progress = print_progress();
    let outcome = uploader.push_new_messages(progress.as_ref()).await?;
    println!("{}", serde_json::to_string_pretty(&outcome)?);
    Ok(())
}

async fn run_status(rt: &Runtime) -> anyhow::Result<()> {
    let last_sync = rt.db.load_last_sync_time().await?;
    let items = rt.db.list_items(DateRange::all()).await?;
    let deleted = items.iter().filter(|i| i.deleted).count();
    let latest_message = match &rt.source {
        Some(source) => source.latest_message_id().await?,
        None => None,
    };
    println!(
        "{}",
        serde_json::to_string_pretty(&json!({
            "dataDir": rt.config.data_dir,
            "provider": rt.remote.provider_name(),
            "signedIn": rt.session.current_user().is_some(),
            "lastSyncTime": last_sync.map(format_timestamp),
            "items": items.len(),
            "deletedItems": deleted,
            "latestSourceMessageId": latest_message,
        }))?
    );
    Ok(())
}

async fn run_migrate(rt: &Runtime) -> anyhow::Result<()> {
    let user = rt
        .session
        .current_user()
        .context("no signed-in user (set session.uid and session.id_token)")?;
    let migrated = migrate_legacy_collections(rt.remote.as_ref(), &user).await?;
    println!("migrated {} legacy records", migrated);
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(LevelFilter::INFO.into()))
        .init();

    let cli = Cli::parse();
    let config = SyncConfig::from_env_and_file(cli.config.as_deref())?;
    let rt = Runtime::build(config)?;

    match cli.command {
        Command::Sync => run_sync(&rt).await,
        Command::Daemon => run_daemon(&rt).await,
        Command::PushMessages => run_push_messages(&rt).await,
        Command::Status => run_status(&rt).await,
        Command::MigrateLegacy => run_migrate(&rt).await,
    }
}
