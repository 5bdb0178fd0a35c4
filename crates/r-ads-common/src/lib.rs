//! ---
//! ads_section: "01-core-functionality"
//! ads_subsection: "module"
//! ads_type: "source"
//! ads_scope: "code"
//! ads_description: "Shared primitives and utilities for the adapter SDK."
//! ads_version: "v0.0.0-prealpha"
//! ads_owner: "tbd"
//! ---
//! Shared primitives for the R-ADS workspace.
//! This crate exposes configuration loading and tracing initialisation
//! consumed by hosts and adapters.

pub mod config;
pub mod logging;

pub use config::{
    AuthorizationConfig, LoadedSdkConfig, LoggingConfig, MetricsConfig, OverflowPolicy,
    RelayConfig, SdkConfig, SimulationConfig, SubscriptionConfig,
};
pub use logging::{init_tracing, LogFormat};
