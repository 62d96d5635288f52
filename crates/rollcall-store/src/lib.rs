//! rollcall-store: durable identity records keyed by numeric id.

pub mod record;
pub mod schema;
pub mod store;

pub use record::{IdentityRecord, Profile};
pub use store::{IdentityStore, StoreError};
