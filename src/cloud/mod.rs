//! Provider access: transport, throttling, retries and task tracking

pub mod api;
pub mod client;
pub mod error;
pub mod rate_limit;
pub mod registry;
pub mod task;
pub mod types;

#[cfg(test)]
pub(crate) mod fake;

pub use api::{ClbApi, HttpClbApi};
pub use client::{CloudClient, TargetBinding};
pub use error::{ApiError, CloudError, ErrorClass};
pub use rate_limit::RateLimiter;
pub use registry::{ApiFactory, ClientRegistry};
pub use task::{Sleeper, TaskTracker, TokioSleeper};
pub use types::{Action, TaskHandle};
