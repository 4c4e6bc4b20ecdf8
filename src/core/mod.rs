//! Core domain models for the provisioning orchestrator
//!
//! This module defines the fundamental data structures: services and their
//! lifecycle state machine, templates and their step pipelines, pipeline
//! runs, and structured log events.

pub mod error;
pub mod log;
pub mod run;
pub mod service;
pub mod template;

pub use error::*;
pub use log::*;
pub use run::*;
pub use service::*;
pub use template::*;
