//! # simforge
//!
//! Client-side orchestrator for remote CPU-simulation experiments.
//!
//! Given an ELF workload and a target core, this crate drives the full
//! protocol: gateway discovery, capability negotiation, hybrid-encrypted
//! packaging, signed-URL upload, status polling, and decrypted result
//! retrieval.
//!
//! ## Quick start
//!
//! ```no_run
//! use simforge::config::ResolvedConfig;
//! use simforge::experiment::Experiment;
//! use simforge::cancel::CancellationToken;
//!
//! # async fn run() -> Result<(), simforge::error::ExperimentError> {
//! let config = ResolvedConfig::builder("api-key", "channel", "us-west")
//!     .gateway("https://gateway.example.com")
//!     .build()
//!     .unwrap();
//!
//! let mut experiment = Experiment::new("./experiments", config, None)?;
//! experiment.add_workload(std::path::Path::new("dhrystone_rv64.elf"))?;
//! experiment.set_core("I8500_(1_thread)");
//!
//! let (token, _handle) = CancellationToken::new();
//! let summary = experiment.run(None, &token).await?;
//! println!("total cycles: {}", summary.total_cycles());
//! # Ok(())
//! # }
//! ```
//!
//! ## What this crate does not do
//!
//! - Load credentials from environment or config files — callers resolve a
//!   [`config::ResolvedConfig`] themselves.
//! - Parse CLI arguments or drive an interactive wizard.
//! - Schedule multiple experiments concurrently within one process — one
//!   [`experiment::Experiment`] per run.
//! - Retry a fully-failed experiment — callers re-invoke.

#![deny(unsafe_code)]

pub mod cancel;
pub mod config;
pub mod crypto;
pub mod elf_snapshot;
pub mod error;
pub mod experiment;
pub mod package;
pub mod report;
pub mod transport;

pub use cancel::{CancellationHandle, CancellationToken};
pub use config::{ClientOptions, CloudCapabilities, ResolvedConfig};
pub use error::{EncryptionErrorKind, ExperimentError, NetworkErrorKind, ProtocolErrorKind, ReportErrorKind};
pub use experiment::{Experiment, ExperimentBuilder, ExperimentState, LoadedExperiment};
pub use report::SummaryReport;

/// Semver of this crate, exposed for the compatibility headers every
/// request carries (spec §6.2).
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Run an [`experiment::Experiment`] from a synchronous caller by spinning
/// up a dedicated multi-thread runtime. Bridges sync entry points (a CLI
/// wrapper living outside this crate) into the async core (spec §5).
pub fn run_blocking(experiment: &mut Experiment, name: Option<&str>, cancel: &CancellationToken) -> Result<SummaryReport, ExperimentError> {
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|e| ExperimentError::internal(format!("failed to start runtime: {e}")))?;
    runtime.block_on(experiment.run(name, cancel))
}
