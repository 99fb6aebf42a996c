//! clb-controller: listener reconciliation for managed cloud load balancers
//!
//! Converges the listeners, forwarding rules and backend bindings of a
//! load balancer towards a desired set through a rate-limited, batched
//! provider client, and guards shared load balancers against port clashes
//! with an admission webhook.

pub mod cloud;
pub mod config;
pub mod conflict;
pub mod controller;
pub mod error;
pub mod model;

#[cfg(feature = "admission-webhook")]
pub mod webhook;

pub use crate::error::{Error, Result};
