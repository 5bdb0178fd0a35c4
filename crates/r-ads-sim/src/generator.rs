//! ---
//! ads_section: "04-simulation"
//! ads_subsection: "module"
//! ads_type: "source"
//! ads_scope: "code"
//! ads_description: "Seeded tag value generator for the simulated adapter."
//! ads_version: "v0.0.0-prealpha"
//! ads_owner: "tbd"
//! ---
use std::f64::consts::PI;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use r_ads_core::model::{TagValue, TagValueQueryResult};
use rand::prelude::*;
use rand_distr::Normal;

/// Waveform of one simulated tag.
#[derive(Debug, Clone)]
struct TagProfile {
    name: String,
    base: f64,
    amplitude: f64,
    frequency_hz: f64,
}

/// Produces sine-plus-noise samples for a fixed set of tags.
///
/// Samples depend only on the seed and the tick, so two generators with the same seed
/// agree.
#[derive(Debug)]
pub struct TagValueGenerator {
    profiles: Vec<TagProfile>,
    rng: StdRng,
    noise: Normal<f64>,
    interval: Duration,
}

impl TagValueGenerator {
    pub fn new(tags: &[String], interval: Duration, seed: u64) -> Result<Self> {
        let profiles = tags
            .iter()
            .enumerate()
            .map(|(index, name)| TagProfile {
                name: name.clone(),
                base: 20.0 + 10.0 * index as f64,
                amplitude: 5.0,
                frequency_hz: 0.05 * (index + 1) as f64,
            })
            .collect();
        Ok(Self {
            profiles,
            rng: StdRng::seed_from_u64(seed),
            noise: Normal::new(0.0, 0.2).context("invalid noise distribution")?,
            interval,
        })
    }

    /// Tags this generator produces values for.
    pub fn tags(&self) -> impl Iterator<Item = &str> {
        self.profiles.iter().map(|profile| profile.name.as_str())
    }

    /// One sample per tag for `tick`.
    pub fn next_values(&mut self, tick: u64) -> Vec<TagValueQueryResult> {
        let t = self.interval.as_secs_f64() * tick as f64;
        let timestamp = Utc::now();
        let mut values = Vec::with_capacity(self.profiles.len());
        for index in 0..self.profiles.len() {
            let noise = self.noise.sample(&mut self.rng);
            let profile = &self.profiles[index];
            let reading =
                profile.base + profile.amplitude * (2.0 * PI * profile.frequency_hz * t).sin() + noise;
            let rounded = (reading * 1000.0).round() / 1000.0;
            values.push(TagValueQueryResult::new(
                profile.name.clone(),
                TagValue::new(timestamp, rounded),
            ));
        }
        values
    }
}
