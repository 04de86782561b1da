//! # kudu-connect
//!
//! Sink connector that applies streamed records as row mutations on tables of
//! a Kudu-style columnar cluster, with at-least-once delivery.
//!
//! ## Features
//!
//! - **Routing**: table taken from the record topic or a configured value
//!   field, optionally restricted by a substring filter
//! - **Translation**: record fields checked against the live table schema,
//!   optional merge of record key fields
//! - **Session Pool**: bounded worker sessions with master failover and
//!   operation/socket-read timeouts
//! - **Batching and Retry**: per-table batches, fixed-backoff resubmission of
//!   only the transiently failed rows
//! - **Offset Tracking**: per-partition watermarks that advance in strict
//!   offset order, only past durably written rows
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use kudu_connect::prelude::*;
//!
//! let config = KuduSinkConfig::from_file("kudu-connect.yaml")?;
//! let mut task = KuduSinkTask::start(&config, connector).await?;
//!
//! task.put(records).await?;
//! let offsets = task.flush().await?; // commit these upstream
//!
//! let report = task.close().await;
//! ```

#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod batch;
pub mod client;
pub mod config;
pub mod error;
pub mod memory;
pub mod mutation;
pub mod offsets;
pub mod pool;
pub mod record;
pub mod retry;
pub mod router;
pub mod schema;
pub mod stats;
pub mod task;
pub mod translator;

pub use config::{KuduSinkConfig, ResolvedConfig};
pub use error::{ConnectError, ErrorCategory, Result};
pub use task::{KuduSinkTask, ShutdownReport};

/// Prelude module for convenient imports
pub mod prelude {
    // Error types
    pub use crate::error::{ConnectError, ErrorCategory, Result};

    // Records and values
    pub use crate::record::{Field, FieldType, Record, StructValue, TopicPartition, Value};

    // Table schema
    pub use crate::schema::{ColumnSchema, ColumnType, TableSchema};

    // Cluster client seam
    pub use crate::client::{ClusterConnector, MasterAddress, Session, SessionOptions};

    // Pipeline
    pub use crate::batch::{Batch, BatchId, BatchSettings, BatchState, WriteBatcher};
    pub use crate::mutation::{Cell, OperationKind, RecordRef, RowMutation};
    pub use crate::offsets::OffsetCoordinator;
    pub use crate::pool::{PoolConfig, PoolStats, SessionPool};
    pub use crate::retry::{BatchOutcome, RetryController, RetryPolicy, RowErrorPolicy};
    pub use crate::router::{RecordRouter, Route, RoutingConfig, TableTarget};
    pub use crate::translator::RowTranslator;

    // Task
    pub use crate::config::{KuduSinkConfig, ResolvedConfig};
    pub use crate::stats::TaskStats;
    pub use crate::task::{KuduSinkTask, ShutdownReport};

    // In-memory cluster
    pub use crate::memory::{Fault, MemoryCluster, MemoryConnector};
}
