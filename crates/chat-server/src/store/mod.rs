//! Tenant storage module
//!
//! Every tenant gets its own SQLite database, opened on first use and
//! cached for the lifetime of the process.

pub mod tenant;

pub use tenant::{normalize_tenant_id, TenantStore, TenantStoreRouter};
