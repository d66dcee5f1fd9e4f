//! Sandbox Core Library
//!
//! Builds multi-service applications into container images and runs them,
//! driving a local container engine through its command line.

pub mod build;
pub mod bundle;
pub mod config;
pub mod container;
pub mod engine;
pub mod fakes;
pub mod image;
pub mod revspec;
pub mod run;
pub mod service;
pub mod telemetry;

pub use build::{BuildError, BuildOrchestrator, BuildOutcome, BuildStage};
pub use bundle::{BundleError, BundleRenderer, TarBundler};
pub use config::{SandboxConfig, DEFAULT_ENGINE_PROGRAM, ENGINE_ENV_VAR};
pub use container::{
    bytes_to_human, Container, ContainerError, ContainerStopper, RunHandle, RunOptions,
    StreamHandle,
};
pub use engine::{Engine, EngineError, EngineOutput, EngineProcess, ProcessEngine, ProcessIo};
pub use image::{Image, ImageError};
pub use revspec::{RevisionSpec, RevisionSpecError, LATEST_TAG};
pub use run::{OutputFactory, RunError, RunOrchestrator, ServiceSupervisor};
pub use service::{Application, ServiceConfig, ServiceError};
pub use telemetry::{init_tracing, level_for_verbosity};

/// Sandbox version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
