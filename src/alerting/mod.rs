//! Alerting: rule evaluation, cooldowns, maintenance suppression, and
//! template rendering.

pub mod engine;
pub mod template;

pub use engine::{AlertEngine, AlertOutcome};
