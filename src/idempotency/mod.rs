//! Exactly-once response delivery keyed by a client-supplied header.

pub mod layer;
pub mod store;

pub use layer::{IdempotencyLayer, IdempotencyService};
pub use store::{Claim, IdempotencyRecord, IdempotencyStore, InFlight, InMemoryIdempotencyStore};
