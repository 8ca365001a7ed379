//! Foundation types for Ember.
//!
//! This crate provides the identity and descriptor types shared by the
//! storage contract (`ember-store`) and the persistence layer
//! (`ember-persist`). Every other Ember crate depends on `ember-types`.
//!
//! # Key Types
//!
//! - [`EntityId`]: 128-bit random identifier of a persisted object
//! - [`PersistenceState`]: save state of an entity
//! - [`ReferenceData`]: descriptor that names a target entity without loading it
//! - [`SerializedReference`]: wire format of an object reference
//! - [`QualifiedCacheName`]: backend identity + cache name pair

pub mod error;
pub mod id;
pub mod reference;
pub mod state;

pub use error::TypeError;
pub use id::EntityId;
pub use reference::{QualifiedCacheName, ReferenceData, SerializedReference};
pub use state::PersistenceState;
