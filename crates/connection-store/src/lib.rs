//! Persistence for cloud storage connections
//!
//! Two JSON-file backed stores keyed by (user, provider):
//! - `TokenStore` holds OAuth tokens plus refresh bookkeeping (failure
//!   counter, intervention flag, proactive-refresh marker, version)
//! - `HealthStore` holds the per-connection `HealthStatus`
//!
//! Both serve reads from an in-memory copy. Every mutation re-reads the file
//! under an exclusive `flock`, applies the change, writes it with an atomic
//! temp-file + rename, and only then updates memory, so worker processes can
//! share one data directory. Consolidated health is recomputed inside the
//! same critical section as the raw status it derives from.

pub mod error;
pub mod health;
mod persist;
pub mod token;

pub use error::{Error, Result};
pub use health::{ConsolidatedStatus, HealthStatus, HealthStore, RawStatus, TokenState};
pub use token::{Token, TokenKey, TokenStore};
