#![allow(clippy::missing_errors_doc, clippy::missing_panics_doc, clippy::doc_markdown)]

//! Autoscaling runner set controller core library
//!
//! This crate reconciles `AutoscalingRunnerSet` resources against a remote
//! scale-set registry: remote identity bootstrap, hash-gated replacement of
//! the owned `EphemeralRunnerSet`/`Listener` children, cascading
//! finalizer-guarded deletion, and status rollup.

pub mod crds;
pub mod remote;
pub mod scalesets;

// Re-export commonly used types
pub use crds::{
    AutoscalingRunnerSet, AutoscalingRunnerSetSpec, AutoscalingRunnerSetStatus,
    EphemeralRunnerSet, EphemeralRunnerSetSpec, EphemeralRunnerSetStatus, Listener, ListenerSpec,
};
pub use scalesets::config::ControllerConfig;
pub use scalesets::run_scale_set_controller;
