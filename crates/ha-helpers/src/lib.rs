//! Integration helpers
//!
//! Building blocks shared by polling integrations:
//!
//! - [`DataUpdateCoordinator`] - Periodic single-flight refresh of remote data
//! - [`CoordinatorEntity`] - An entity whose state derives from coordinator data
//! - [`EntityPlatform`] - Writes a set of entities into the state store and
//!   keeps them in sync with their coordinator

pub mod entity;
pub mod entity_platform;
pub mod update_coordinator;

pub use entity::CoordinatorEntity;
pub use entity_platform::EntityPlatform;
pub use update_coordinator::{
    CoordinatorStatus, DataUpdateCoordinator, UpdateFailed, UpdateMethod,
};
