//! In-memory caches in front of the backend.
//!
//! - [`ConditionalCache`] remembers ETag validators per resource
//! - [`QueryCache`] keeps last-known-good bodies and their freshness
//! - [`CacheLayer`] combines both into revalidating reads with offline fallback
//! - [`IdempotencyRegistry`] de-duplicates side-effecting operations
//!
//! All of these are session scoped and cleared by the session controller.

pub mod conditional;
pub mod idempotency;
mod layer;
pub mod query;
mod traits;

pub use conditional::{ConditionalCache, Observation};
pub use idempotency::{fingerprint, Begin, IdempotencyRegistry, Reservation, Waiter};
pub use layer::{CacheLayer, Fetched};
pub use query::QueryCache;
pub use traits::{CacheResult, CacheSource};
