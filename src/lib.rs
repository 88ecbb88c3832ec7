//! CNI Router - chained plugin reconciling overlay and underlay pod routing
//!
//! This library provides the components that steer a pod's traffic between
//! the overlay interface created by the primary network plugin and an
//! additional (underlay) interface, using per-interface policy routing
//! tables in the pod and host network namespaces.

pub mod cni;
pub mod config;
pub mod error;
pub mod network;
pub mod reconciler;
pub mod routing;

#[cfg(test)]
mod testing;

pub use error::RouterError;
pub use reconciler::RouterReconciler;
