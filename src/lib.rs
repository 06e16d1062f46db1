pub mod command;
pub mod config;
pub mod crypto;
pub mod error;
pub mod log;
pub mod material;
pub mod publisher;
pub mod storage;

// Stream processing
pub mod aggregation;
pub mod correlator;
pub mod view;
pub mod worker;

// PostgreSQL backend
pub mod postgres_storage;

pub mod service;

pub use command::Command;
pub use config::KeyStoreConfig;
pub use crypto::{
    Aes256GcmGenerator, AesGcmCipher, EncryptedData, GeneratedKey, MaterialGenerator, SecureKey,
    AES_256_GCM,
};
pub use error::{KeyMaterialError, Result};
pub use log::{partition_for, CommitLog, InMemoryCommitLog, LogRecord, RecordPosition};
pub use material::{Material, MaterialAggregate, Subject};
pub use publisher::CommandPublisher;
pub use storage::{AggregateStore, InMemoryAggregateStore, StoredAggregate};

pub use aggregation::{reduce, AggregateUpdate, AggregationStage, ReduceOutcome, Reduction};
pub use correlator::{CompletionCorrelator, PendingCompletion};
pub use view::{ReplicatedView, ViewEvent};

pub use postgres_storage::PostgresAggregateStore;
pub use service::{ForgetOutcome, KeyMaterialService};
