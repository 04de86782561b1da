//! Storage client seam
//!
//! The connector talks to the cluster through two traits: a
//! [`ClusterConnector`] that opens sessions against a master, and the
//! [`Session`] it returns. The pool owns sessions; the rest of the pipeline
//! never sees them.

use async_trait::async_trait;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{ConnectError, Result};
use crate::mutation::RowMutation;
use crate::schema::TableSchema;

/// Port used when a master address omits one
pub const DEFAULT_MASTER_PORT: u16 = 7051;

/// A `host:port` master endpoint
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MasterAddress {
    host: String,
    port: u16,
}

impl MasterAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Parse a comma-separated master list, e.g. `"m1:7051,m2"`
    pub fn parse_list(list: &str) -> Result<Vec<MasterAddress>> {
        let masters = list
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::parse)
            .collect::<Result<Vec<_>>>()?;

        if masters.is_empty() {
            return Err(ConnectError::config("master address list is empty"));
        }
        Ok(masters)
    }
}

impl FromStr for MasterAddress {
    type Err = ConnectError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || ConnectError::config(format!("invalid master address '{}'", s));

        // [v6::addr]:port
        let (host, port) = if let Some(rest) = s.strip_prefix('[') {
            let (host, tail) = rest.split_once(']').ok_or_else(invalid)?;
            match tail {
                "" => (host, None),
                _ => (host, Some(tail.strip_prefix(':').ok_or_else(invalid)?)),
            }
        } else {
            match s.rsplit_once(':') {
                Some((host, port)) => (host, Some(port)),
                None => (s, None),
            }
        };

        if host.is_empty() || host.contains(char::is_whitespace) {
            return Err(invalid());
        }
        let port = match port {
            Some(p) => p.parse::<u16>().map_err(|_| invalid())?,
            None => DEFAULT_MASTER_PORT,
        };
        if port == 0 {
            return Err(invalid());
        }

        Ok(Self::new(host, port))
    }
}

impl fmt::Display for MasterAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

/// Timeouts handed to every session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionOptions {
    /// Outer bound on a whole user operation
    pub operation_timeout: Duration,
    /// Bound on a single read from the server
    pub socket_read_timeout: Duration,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            operation_timeout: Duration::from_secs(30),
            socket_read_timeout: Duration::from_secs(10),
        }
    }
}

/// A session against the cluster
///
/// Implementations report failures with the write taxonomy:
/// `TransientWrite` for timeouts (including socket-read timeouts), unavailable
/// tablets and leadership changes; `NonRetryableWrite` for rows the cluster
/// rejects; `FatalConnection` when the session lost its masters for good.
#[async_trait]
pub trait Session: Send + Sync {
    /// Fetch the schema of a table; a missing table is a routing error
    async fn table_schema(&self, table: &str) -> Result<TableSchema>;

    /// Apply one row mutation and wait for the server to confirm it
    async fn apply(&self, mutation: &RowMutation) -> Result<()>;

    /// Whether the session can still be reused
    async fn is_valid(&self) -> bool;

    /// Close the session
    async fn close(&self) -> Result<()>;
}

/// Factory for sessions
#[async_trait]
pub trait ClusterConnector: Send + Sync {
    /// Open a session through the given master
    async fn connect(
        &self,
        master: &MasterAddress,
        options: &SessionOptions,
    ) -> Result<Box<dyn Session>>;
}
