//! Webhook Module
//!
//! Validating admission webhook that refuses Services, Ingresses and other
//! annotated objects whose listen ports collide on a shared load balancer.
//!
//! # Example
//!
//! ```rust,ignore
//! use clb_controller::conflict::{ConflictDetector, KubeClaimSource};
//! use clb_controller::webhook::WebhookServer;
//!
//! let source = KubeClaimSource::new(client, "ap-guangzhou");
//! let server = WebhookServer::new(ConflictDetector::new(source), "ap-guangzhou")
//!     .with_fail_open(false);
//!
//! server.start("0.0.0.0:8443".parse()?).await?;
//! ```

pub mod server;

pub use server::{HealthResponse, WebhookServer};
