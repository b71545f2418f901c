//! Relay pipeline.
//!
//! Every inbound message flows through:
//! 1. `MessageSource::start()` — source-specific I/O
//! 2. `ResolvedRoutes::get()` — which destinations watch this channel
//! 3. `MessageTransformer::transform()` — filter and rewrite
//! 4. `Renderer` — destination-shaped payloads
//! 5. `DeliveryDispatcher::enqueue()` — per-destination ordered delivery

pub mod forwarder;
pub mod render;
pub mod routes;
pub mod transform;
pub mod types;

pub use forwarder::Forwarder;
pub use render::{RenderContext, Renderer};
pub use routes::{ResolvedRoute, ResolvedRoutes, resolve};
pub use transform::{MessageTransformer, RuleKind, TransformResult, TransformRule};
pub use types::{AttachmentRef, InboundMessage};
