//! Common types for client-side transactions
//!
//! This crate defines:
//! - Table identifiers and key hashes used to route objects to tablets
//! - Object keys with their (table-scoped) 64-bit hash
//! - Client leases and the transaction identifiers derived from them

mod key;
mod lease;
mod transaction_id;

pub use key::{Key, KeyHash, TableId};
pub use lease::ClientLease;
pub use transaction_id::{RpcId, TransactionId};
