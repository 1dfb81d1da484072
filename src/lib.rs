#![allow(clippy::doc_markdown)] // Allow technical terms like PostgreSQL, pgBackRest in docs
#![allow(clippy::missing_errors_doc)] // Allow public functions without # Errors sections
#![allow(clippy::must_use_candidate)] // Allow methods without must_use when context is clear

//! # pgcontrol Core
//!
//! Reconciliation core for PostgreSQL instances and their satellite services.
//!
//! ## Overview
//!
//! A caller declares what an instance should look like in an
//! [`InstanceManifest`](models::InstanceManifest); the
//! [`Orchestrator`](orchestration::Orchestrator) compares it with the host and
//! runs the steps needed to get there. Satellite services (HA coordinator,
//! backups, log shipping) take part through typed lifecycle hooks without the
//! orchestrator knowing them concretely.
//!
//! ## Module Organization
//!
//! - [`registry`] - Hook names, dispatch policies and the satellite service registry
//! - [`orchestration`] - Lifecycle operations, revertible pipelines, processes and polling
//! - [`pgconf`] - Setting values, merging, change detection and `postgresql.conf` files
//! - [`state_machine`] - Instance states, transitions and guards
//! - [`services`] - Built-in PostgreSQL, Patroni, pgBackRest and rsyslog services
//! - [`databases`] - Databases inside a running instance
//! - [`config`] - Layered site configuration
//! - [`error`] - Structured error handling
//! - [`logging`] - Structured logging setup
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use pgcontrol_core::config::ConfigManager;
//! use pgcontrol_core::models::InstanceManifest;
//! use pgcontrol_core::orchestration::{Orchestrator, SystemProcessRunner};
//! use pgcontrol_core::services::default_registry;
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! pgcontrol_core::logging::init_structured_logging();
//! let config = Arc::new(ConfigManager::load()?.config().clone());
//! let registry = default_registry(config.clone(), Arc::new(SystemProcessRunner)).await?;
//! let orchestrator = Orchestrator::new(config, registry);
//!
//! let manifest = InstanceManifest::new("main").with_port(5433);
//! let result = orchestrator.apply(&manifest).await?;
//! println!("{:?}", result.change_state);
//! # Ok(())
//! # }
//! ```
//!
//! ## Testing
//!
//! ```bash
//! cargo test --lib    # Unit tests
//! cargo test          # Unit and integration tests
//! ```

pub mod config;
pub mod databases;
pub mod db;
pub mod error;
pub mod logging;
pub mod models;
pub mod orchestration;
pub mod pgconf;
pub mod registry;
pub mod services;
pub mod state_machine;

pub use config::{ConfigManager, ControlConfig};
pub use error::{ControlError, ControlResult, ErrorKind};
pub use models::{Instance, InstanceKey, InstanceManifest};
pub use orchestration::Orchestrator;
pub use registry::{HookName, HookRegistry, SatelliteService};
