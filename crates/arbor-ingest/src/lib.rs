pub mod auth;
pub mod broadcast;
pub mod config;
pub mod db;
pub mod error;
pub mod intake;
pub mod pipeline;
pub mod queue;
pub mod reconciler;
pub mod retry;
pub mod sanitize;
pub mod secrets;
pub mod server;
pub mod stages;
pub mod storage;
pub mod telemetry;
pub mod worker;

pub use auth::AuthContext;
pub use broadcast::{QueueEvent, QueueEventBroadcaster};
pub use config::{load_config, Config};
pub use db::Database;
pub use error::{ConfigError, IngestError, Result, StorageError};
pub use intake::{Intake, IntakeError, UploadFile};
pub use pipeline::{Pipeline, ProcessReport};
pub use queue::{QueueCoordinator, QueueError};
pub use reconciler::{CleanupReport, OrphanReconciler, OrphanRecord};
pub use secrets::{resolve_secret, SecretError};
pub use stages::{ErrorKind, StageError};
pub use storage::{FilesystemStore, ObjectStore};
pub use worker::QueueWorker;
