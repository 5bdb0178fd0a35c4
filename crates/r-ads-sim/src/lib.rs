//! ---
//! ads_section: "04-simulation"
//! ads_subsection: "bootstrap"
//! ads_type: "source"
//! ads_scope: "code"
//! ads_description: "Simulated adapter module exports."
//! ads_version: "v0.0.0-prealpha"
//! ads_owner: "tbd"
//! ---
//! Simulated adapter for the R-ADS SDK.
//!
//! [`SimulatedAdapter`] implements every standard feature on top of in-memory upstreams
//! that record their subscribe calls, plus the `vendor/custom/` demo extension. It backs
//! the `r-adsd` demo host and the integration suite.

pub mod adapter;
pub mod extension;
pub mod generator;
pub mod upstream;

pub use adapter::{SimulatedAdapter, SimulatedAdapterBuilder};
pub use extension::{CustomExtension, CUSTOM_EXTENSION_URI};
pub use generator::TagValueGenerator;
pub use upstream::{CallCounters, UpstreamRecorder};
