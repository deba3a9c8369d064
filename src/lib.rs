//! Point Art Hub - offline-first sales engine
//!
//! Sales recorded while the device is offline are written to a local durable
//! store and queued for replay. When connectivity returns, the reconciler
//! replays the queue against the hosted table service and clears the local
//! offline lists. A small response cache supports offline loading of the
//! app shell.

use std::sync::Arc;
use tracing::{info, warn};

pub mod cache;
pub mod config;
pub mod credentials;
pub mod db;
pub mod diagnostics;
pub mod error;
pub mod network;
pub mod queue;
pub mod recorder;
pub mod reconciler;
pub mod remote;
pub mod runtime;
pub mod sale;
pub mod store;

pub use config::{ClearPolicy, RemoteConfig, SyncConfig};
pub use error::{RemoteError, StoreError, SyncError};
pub use network::{NetworkMonitor, NetworkSubscription};
pub use queue::{QueueEntry, SyncQueue};
pub use recorder::{OfflineLedger, OfflineSaleRecorder, PendingCounts};
pub use reconciler::{SyncReconciler, SyncReport};
pub use remote::{RemoteTables, RestClient};
pub use runtime::SyncRuntime;
pub use sale::{
    GiftSale, OfflineSale, SaleCategory, SalePayload, StationeryDailySale, StationerySale,
};
pub use store::{KeyValueStore, LocalStore, MemoryStore, SqliteStore};

/// Start the engine with settings from the environment.
///
/// Installs logging (skipped with a warning if a subscriber is already set),
/// resolves service credentials, opens the local database and spawns the
/// background sync loop. Must be called from within a tokio runtime. Keep the
/// returned log guard alive for the lifetime of the process.
pub fn launch(
    initially_online: bool,
) -> Result<
    (
        Arc<SyncRuntime<RestClient>>,
        Option<tracing_appender::non_blocking::WorkerGuard>,
    ),
    SyncError,
> {
    let config = SyncConfig::from_env();

    let log_guard = match diagnostics::init_logging(&config.data_dir) {
        Ok(guard) => Some(guard),
        Err(e) => {
            warn!("File logging disabled: {e}");
            None
        }
    };

    info!(
        version = env!("CARGO_PKG_VERSION"),
        data_dir = %config.data_dir.display(),
        clear_policy = ?config.clear_policy,
        "Point Art Hub sync engine starting"
    );

    let remote = RemoteConfig::resolve()?;
    let runtime = Arc::new(SyncRuntime::open(config, remote, initially_online)?);

    let orphans = runtime.stationery().find_unqueued().len()
        + runtime.gifts().find_unqueued().len()
        + runtime.stationery_daily().find_unqueued().len();
    if orphans > 0 {
        warn!(orphans, "Offline sales found without a queue entry");
    }

    runtime.start_sync_loop()?;
    Ok((runtime, log_guard))
}
