//! steadypool: hardened database connections and a thread-safe pool.
//!
//! Built on the driver capability from `steadypool-driver`:
//! - **steady**: `HardenedConnection` / `HardenedCursor`, which reopen lost
//!   raw connections and retry the interrupted statement
//! - **pool**: `ConnectionPool` with dedicated and shared `PooledConnection` leases
//! - **persistent**: `PersistentPool`, one connection per thread
//! - **config**: `PoolConfig` (TOML), `PingPolicy`, `ResetPolicy`

pub mod config;
pub mod error;
pub mod persistent;
pub mod pool;
pub mod steady;

pub use config::{PingContext, PingPolicy, PoolConfig, ResetPolicy};
pub use error::{PoolError, PoolResult};
pub use persistent::PersistentPool;
pub use pool::{ConnectionPool, PoolStats, PooledConnection};
pub use steady::{Connection, HardenedConnection, HardenedCursor, SteadyOptions};
pub use steadypool_driver as driver;
