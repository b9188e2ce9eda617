//! clashlink turns vmess/vless share links into Clash subscriptions.
//!
//! The pipeline lives in [`generate`]: links are parsed by
//! [`clash::LinkParser`], optionally probed by [`clash::HealthChecker`],
//! rendered by [`clash::render`] and saved through [`store::SubscriptionStore`].
//! [`gateway`] exposes it over HTTP; the `clashlink` binary over a CLI.

pub mod clash;
pub mod config;
pub mod gateway;
pub mod generate;
pub mod logging;
pub mod store;

pub use config::AppConfig;
pub use generate::{GenerateError, GenerateOutcome, GenerateRequest};
pub use store::{Owner, StoreError, SubscriptionStore};
