//! Clash subscription core.
//!
//! Share links go through [`LinkParser`], optionally through the
//! [`HealthChecker`] TCP probe, and come out as Clash YAML via [`render`].
//! Nothing in here touches the filesystem; persistence lives in
//! [`crate::store`].

pub mod generator;
pub mod health;
pub mod node;
pub mod subscription;

pub use generator::{
    render, render_at, GenerationOptions, RulesInput, AUTO_GROUP_NAME, DIRECT_GROUP_NAME, SELECTOR_GROUP_NAME,
};
pub use health::{online_only, summarize, HealthChecker, NodeStatus, ProbeState, ProbeSummary};
pub use node::{Network, NodeKind, ProxyNode, RealityOptions, TlsSettings, TransportOptions};
pub use subscription::{LineError, LinkParser, ParseError, ParseReport, SubscriptionError};
