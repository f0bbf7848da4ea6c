// ravenly-core: Topology-aware request execution and change feed on top of ravenly-api.

pub mod cache;
pub mod changes;
pub mod config;
pub mod error;
pub mod executor;
pub mod store;

// ── Primary re-exports ──────────────────────────────────────────────
pub use cache::HttpCache;
pub use changes::{
    ChangeKind, ChangesObservable, ChangesStream, ChangesSubscription, ConnectionStatus,
    DatabaseChanges,
};
pub use config::{
    BackoffConfig, CacheConfig, ChangesConfig, ClientCertificate, ExecutorConfig,
    ReadBalanceBehavior, ReconnectConfig, StoreConfig, TlsVerification,
};
pub use error::CoreError;
pub use executor::{
    AggressiveCacheGuard, AggressiveCacheMode, AggressiveCacheOptions, CacheScope, ExecuteOptions,
    ExecutorEvent, ExecutorStats, ExecutorStatsSnapshot, RequestExecutor,
    UpdateTopologyParameters,
};
pub use store::DocumentStore;

// Wire types callers need to write commands and handle notifications.
pub use ravenly_api::changes::{
    AggressiveCacheChange, ChangesSupportedFeatures, CounterChange, CounterChangeType,
    DocumentChange, DocumentChangeType, IndexChange, IndexChangeType, OperationStatusChange,
    TimeSeriesChange, TimeSeriesChangeType,
};
pub use ravenly_api::{Command, JsonCommand, ServerNode, ServerRole, Topology};
