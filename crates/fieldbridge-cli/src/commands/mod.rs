//! Subcommands and the wiring they share.

pub mod audit;
pub mod auth;
pub mod config;
pub mod mapping;
pub mod migrate;
pub mod sync;

use std::sync::Arc;

use chrono::Duration;
use fieldbridge_core::storage::data_dir;
use fieldbridge_core::sync::{Alerter, LogAlerter, WebhookAlerter};
use fieldbridge_core::{Config, CrmClient, JsonFileSource, SqliteStore, SyncOrchestrator, SyncQueue};

pub type CliResult = Result<(), Box<dyn std::error::Error>>;

/// Configuration plus the state store, opened once per invocation.
///
/// `config` carries environment overrides and must not be saved.
pub struct Context {
    pub config: Config,
    pub store: Arc<SqliteStore>,
}

impl Context {
    pub fn open() -> Result<Self, Box<dyn std::error::Error>> {
        let config = Config::load()?.with_env_overrides();
        config.validate()?;
        let store = Arc::new(SqliteStore::open()?);
        Ok(Self { config, store })
    }

    pub fn orchestrator(&self) -> Result<SyncOrchestrator<CrmClient>, Box<dyn std::error::Error>> {
        let queue_path = data_dir()?.join("sync_queue.json");
        let mut queue = SyncQueue::new_with_path(
            queue_path,
            Duration::seconds(self.config.sync.coalesce_window_secs as i64),
        );
        queue.load()?;
        let client = CrmClient::new(&self.config.remote, self.store.clone())?;
        let alerter: Box<dyn Alerter> = match WebhookAlerter::from_config(&self.config.alert) {
            Some(webhook) => Box::new(webhook),
            None => Box::new(LogAlerter),
        };
        Ok(SyncOrchestrator::new(&self.config, self.store.clone(), client, queue).with_alerter(alerter))
    }

    /// The record export named by `source.records_path`, or `records` when given.
    pub fn source(&self, records: Option<&str>) -> Result<JsonFileSource, Box<dyn std::error::Error>> {
        let path = records
            .or(self.config.source.records_path.as_deref())
            .ok_or("no record source: set source.records_path or pass --records")?;
        Ok(JsonFileSource::open(path)?)
    }
}

/// Single-threaded runtime for the async commands.
pub fn runtime() -> std::io::Result<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
}
