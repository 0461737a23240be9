//! Entity store
//!
//! The authoritative, versioned tables for suppliers, products, rates,
//! collections and payments.

mod store;
mod types;

pub use store::{next_change_seq, EntityRepository, RowUpdate};
pub(crate) use store::{EntityRow, ENTITY_COLUMNS};
pub use types::{format_timestamp, merge_payload, parse_timestamp, EntityType, SyncableEntity};
