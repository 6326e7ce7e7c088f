//! rollgrid-state — embedded state store for rollgrid.
//!
//! Backed by [redb](https://docs.rs/redb), holds targets, distribution sets,
//! actions with their status log, rollouts, rollout groups and the
//! target-to-group claims made when a rollout is partitioned.
//!
//! # Architecture
//!
//! All records are JSON-serialized into redb's `&[u8]` value columns.
//! Numeric ids are zero-padded inside keys (`{rollout:020}/{target}`) so
//! range scans come back in id order.
//!
//! Reads go through the [`StateView`] trait, implemented by a read-only
//! [`Snapshot`] and by [`UnitOfWork`]. Every multi-record change goes
//! through [`StateStore::transaction`], which hands a `UnitOfWork` to a
//! closure and commits only when the closure succeeds. Versioned records
//! carry a `revision` that is compared and bumped on update; a mismatch
//! surfaces as [`StateError::Conflict`].

/// Convert any `Display` error into a `StateError` variant via a closure factory.
macro_rules! map_err {
    ($variant:ident) => {
        |e| $crate::error::StateError::$variant(e.to_string())
    };
}

pub mod error;
pub mod filter;
pub mod store;
pub mod tables;
pub mod types;
pub mod unit;
pub mod view;

pub use error::{StateError, StateResult};
pub use filter::{FilterError, FilterErrorReason, TargetFilter, TargetQuery};
pub use store::StateStore;
pub use types::*;
pub use unit::{Removal, UnitOfWork};
pub use view::{Snapshot, StateView};
