//! Offline sync engine.
//!
//! Local writes land in the store together with an outbox entry. A sync
//! cycle then pushes the outbox to the remote service and pulls remote
//! changes back, entity by entity.
//!
//! ```text
//!   UI write ──► patients_local / appointments_local
//!                  + sync_outbox  (one transaction)
//!
//!   SyncScheduler (foreground / every 5 min / sync now)
//!       │
//!       ├─► PushWorker::drain   sync_outbox ──► POST / PUT / DELETE
//!       │
//!       └─► PullWorker::pull    GET ?updatedAfter=cursor ──► upsert, advance cursor
//! ```

mod clock;
mod config;
mod error;
pub mod http;
pub mod mock;
mod platform;
mod pull;
mod push;
pub mod remote;
mod scheduler;

pub use clock::*;
pub use config::*;
pub use error::*;
pub use http::HttpRemote;
pub use mock::{MockCall, MockOp, MockRemote};
pub use platform::*;
pub use pull::*;
pub use push::*;
pub use remote::{Fetched, RemoteApi, RemoteRecord};
pub use scheduler::*;

use std::future::Future;
use std::time::Duration;

use crate::db::{Database, DbResult, SharedDatabase};

/// Bound a remote call by `limit`; expiry is reported as [`RemoteError::Timeout`].
pub(crate) async fn with_timeout<T, F>(limit: Duration, call: F) -> Result<T, RemoteError>
where
    F: Future<Output = Result<T, RemoteError>>,
{
    match tokio::time::timeout(limit, call).await {
        Ok(result) => result,
        Err(_) => Err(RemoteError::Timeout),
    }
}

/// Run `f` against the shared store. The lock is released before returning,
/// so callers never hold it across an await point.
pub(crate) fn with_db<T, F>(db: &SharedDatabase, f: F) -> SyncResult<T>
where
    F: FnOnce(&Database) -> DbResult<T>,
{
    let guard = db.lock()?;
    Ok(f(&guard)?)
}
