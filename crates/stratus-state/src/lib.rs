//! stratus-state — the director's datastore.
//!
//! Backed by [redb](https://docs.rs/redb), stores deployments, instances,
//! VMs, persistent disks, uploaded stemcells and releases, DNS records and
//! advisory locks.
//!
//! # Architecture
//!
//! All records are JSON-serialized into redb's `&[u8]` value columns.
//! Deployment-scoped tables use `{deployment}:` key prefixes so one
//! deployment's rows come back from a single prefix scan.
//!
//! The `StateStore` is `Clone` + `Send` + `Sync` (backed by `Arc<Database>`)
//! and can be shared across async tasks. The [`repository`] module layers
//! the read-only existing-state view used by the reconciliation core on
//! top of it.

pub mod error;
pub mod repository;
pub mod store;
pub mod tables;
pub mod types;

pub use error::{StateError, StateResult};
pub use repository::ExistingInstance;
pub use store::StateStore;
pub use types::*;
