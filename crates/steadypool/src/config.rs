//! Pool configuration, loadable from TOML.
//!
//! ```toml
//! min_cached = 2
//! max_cached = 5
//! max_shared = 3
//! max_connections = 10
//! blocking = true
//! max_usage = 1000
//! set_session = ["set datestyle to german"]
//! reset = "on_transaction"
//! failures = ["operational", "internal", "interface"]
//! acquire_timeout_ms = 5000
//!
//! [ping]
//! on_fetch = true
//! on_execute = true
//! ```

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use steadypool_driver::{Failures, ThreadSafety};

/// Where a liveness check may run.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PingContext {
    /// A connection is fetched from the pool.
    Fetch,
    /// A cursor is created.
    Cursor,
    /// A query is executed.
    Execute,
}

/// When hardened connections check liveness with `ping()`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PingPolicy {
    pub on_fetch: bool,
    pub on_cursor: bool,
    pub on_execute: bool,
}

impl PingPolicy {
    pub const NEVER: Self = Self {
        on_fetch: false,
        on_cursor: false,
        on_execute: false,
    };
    pub const ON_FETCH: Self = Self {
        on_fetch: true,
        ..Self::NEVER
    };
    pub const ON_CURSOR: Self = Self {
        on_cursor: true,
        ..Self::NEVER
    };
    pub const ON_EXECUTE: Self = Self {
        on_execute: true,
        ..Self::NEVER
    };
    pub const ALWAYS: Self = Self {
        on_fetch: true,
        on_cursor: true,
        on_execute: true,
    };

    /// Decode the bit-flag form: 1 = fetch, 2 = cursor, 4 = execute.
    pub fn from_bits(bits: u8) -> Self {
        Self {
            on_fetch: bits & 1 != 0,
            on_cursor: bits & 2 != 0,
            on_execute: bits & 4 != 0,
        }
    }

    pub fn bits(self) -> u8 {
        u8::from(self.on_fetch) | u8::from(self.on_cursor) << 1 | u8::from(self.on_execute) << 2
    }

    pub fn union(self, other: Self) -> Self {
        Self::from_bits(self.bits() | other.bits())
    }

    pub fn covers(self, context: PingContext) -> bool {
        match context {
            PingContext::Fetch => self.on_fetch,
            PingContext::Cursor => self.on_cursor,
            PingContext::Execute => self.on_execute,
        }
    }
}

impl Default for PingPolicy {
    fn default() -> Self {
        Self::ON_FETCH
    }
}

/// How a connection is reset when it goes back to the idle cache.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResetPolicy {
    /// Always roll back.
    #[default]
    Always,
    /// Roll back only connections that began a transaction explicitly.
    OnTransaction,
}

/// Settings for [`ConnectionPool`](crate::ConnectionPool) and the hardened
/// connections it creates.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolConfig {
    /// Idle connections opened at construction.
    pub min_cached: usize,
    /// Idle cache bound, 0 for no bound.
    pub max_cached: usize,
    /// Shared cache bound, 0 disables sharing.
    pub max_shared: usize,
    /// Outstanding-connection bound, 0 for no bound.
    pub max_connections: usize,
    /// Wait for capacity instead of failing with `TooManyConnections`.
    pub blocking: bool,
    /// Operations per raw connection before it is reopened, 0 for no limit.
    pub max_usage: u64,
    /// Statements run on every freshly opened raw connection.
    pub set_session: Vec<String>,
    pub reset: ResetPolicy,
    /// Recoverable error kinds; the driver's default when unset.
    pub failures: Option<Failures>,
    pub ping: PingPolicy,
    /// Deadline for blocking acquisition, unbounded when unset.
    pub acquire_timeout_ms: Option<u64>,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_cached: 0,
            max_cached: 0,
            max_shared: 0,
            max_connections: 0,
            blocking: false,
            max_usage: 0,
            set_session: Vec::new(),
            reset: ResetPolicy::default(),
            failures: None,
            ping: PingPolicy::default(),
            acquire_timeout_ms: None,
        }
    }
}

impl PoolConfig {
    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(content)?)
    }

    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn to_toml_string(&self) -> anyhow::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn acquire_timeout(&self) -> Option<Duration> {
        self.acquire_timeout_ms.map(Duration::from_millis)
    }

    /// Reconcile the limits with each other and with the driver's thread safety.
    pub fn normalized(mut self, threadsafety: ThreadSafety) -> Self {
        if self.max_cached > 0 {
            self.max_cached = self.max_cached.max(self.min_cached);
        }
        if !threadsafety.allows_sharing() {
            self.max_shared = 0;
        }
        if self.max_connections > 0 {
            self.max_connections = self
                .max_connections
                .max(self.max_cached)
                .max(self.max_shared);
        }
        self
    }
}
