//! Kubernetes operator for Keva clustered key-value databases
//!
//! Watches `KevaDatabase` resources and reconciles the Services,
//! StatefulSets, Secrets and AppBindings needed to run the declared
//! topology. Deletion runs through a termination policy engine that decides
//! what survives; databases with a preserving policy are parked as
//! `DormantDatabase` records and can be resumed by an equivalent re-creation.

pub mod admission;
pub mod controller;
pub mod crd;
pub mod dormant;
pub mod ensure;
pub mod error;
pub mod events;
pub mod monitor;
pub mod resources;
pub mod termination;
pub mod validation;

pub use error::{OperatorError, Result};
