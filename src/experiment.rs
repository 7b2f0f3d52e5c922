//! Experiment state machine and public contract (C5, spec §4.4/§4.5).

use std::collections::BTreeSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use rand::RngCore;
use serde::Serialize;
use tracing::{error, info};
use uuid::Uuid;

use crate::cancel::CancellationToken;
use crate::config::{ClientOptions, ResolvedConfig};
use crate::crypto::{hybrid_encrypt_file, otp_decrypt_file, secure_delete};
use crate::elf_snapshot::snapshot_source_files;
use crate::error::ExperimentError;
use crate::package::{self, Workload};
use crate::report::{self, SummaryReport};
use crate::transport::{self, TransportClient};

const ELF_MAGIC: [u8; 4] = [0x7f, b'E', b'L', b'F'];
const POLL_DEADLINE_SLACK: Duration = Duration::from_secs(60);

/// State-machine states (spec §4.4). `Failed` is absorbing and carries a
/// human-readable reason; it is reachable from any non-terminal state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExperimentState {
    New,
    Configured,
    CapabilitiesFetched,
    Packaged,
    UrlsIssued,
    Encrypted,
    Uploaded,
    Polling,
    Downloading,
    Decrypting,
    Unpacking,
    Succeeded,
    Failed(String),
}

impl fmt::Display for ExperimentState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::New => write!(f, "new"),
            Self::Configured => write!(f, "configured"),
            Self::CapabilitiesFetched => write!(f, "capabilities_fetched"),
            Self::Packaged => write!(f, "packaged"),
            Self::UrlsIssued => write!(f, "urls_issued"),
            Self::Encrypted => write!(f, "encrypted"),
            Self::Uploaded => write!(f, "uploaded"),
            Self::Polling => write!(f, "polling"),
            Self::Downloading => write!(f, "downloading"),
            Self::Decrypting => write!(f, "decrypting"),
            Self::Unpacking => write!(f, "unpacking"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed(reason) => write!(f, "failed({reason})"),
        }
    }
}

#[derive(Debug, Serialize)]
struct ArchConfig {
    num_threads: u32,
}

#[derive(Debug, Serialize)]
struct ReportRequest {
    uuid: String,
    #[serde(rename = "type")]
    kind: String,
    name: String,
    #[serde(rename = "outputFormat")]
    output_format: String,
}

#[derive(Debug, Serialize)]
struct WorkloadEntry {
    elf: String,
    reports: Vec<ReportRequest>,
}

/// JSON document sent to the server, packed into the encrypted tar
/// (spec §3.1/§6.3).
#[derive(Debug, Serialize)]
struct ExperimentConfig {
    uuid: String,
    name: String,
    date: String,
    core: String,
    #[serde(rename = "toolsVersion")]
    tools_version: String,
    #[serde(rename = "pluginVersion")]
    plugin_version: String,
    #[serde(rename = "clientType")]
    client_type: String,
    otp: String,
    arch: ArchConfig,
    workload: Vec<WorkloadEntry>,
    timeout: u64,
}

/// Rehydrated view of a previously-succeeded experiment (spec §4.5's
/// `load`), built without any network traffic.
pub struct LoadedExperiment {
    pub exp_dir: PathBuf,
    summary: SummaryReport,
}

impl LoadedExperiment {
    pub fn get_summary(&self) -> &SummaryReport {
        &self.summary
    }
}

/// A single, single-use experiment run (spec §3.1/§3.3). Create with
/// [`Experiment::new`], mutate with `add_workload`/`set_core`/`set_name`,
/// then drive to completion with [`Experiment::run`].
pub struct Experiment {
    root_dir: PathBuf,
    exp_dir: Option<PathBuf>,
    name: Option<String>,
    // The name actually used to derive `expDir`/temp file names for this run
    // (`name`, or the generated timestamp when the caller never called
    // `set_name`) — distinct from `name` so cleanup can find the files that
    // were really written even on an unnamed run.
    effective_name: Option<String>,
    workloads: Vec<Workload>,
    core: Option<String>,
    timeout_secs: u64,
    uuid: Option<String>,
    otp: Option<[u8; 32]>,
    state: ExperimentState,
    status_url: Option<String>,
    upload_url: Option<String>,
    result_url: Option<String>,
    summary: Option<SummaryReport>,
    source_files: BTreeSet<PathBuf>,

    config: ResolvedConfig,
    transport: TransportClient,
}

/// Thin builder wrapping `add_workload`/`set_core`/`set_name` (spec §4.5 /
/// SPEC_FULL §4.5); desugars to the same mutators.
pub struct ExperimentBuilder {
    experiment: Result<Experiment, ExperimentError>,
}

impl ExperimentBuilder {
    pub fn add_workload(mut self, path: impl AsRef<Path>) -> Self {
        self.experiment = self.experiment.and_then(|mut e| {
            e.add_workload(path.as_ref())?;
            Ok(e)
        });
        self
    }

    pub fn core(mut self, core: impl Into<String>) -> Self {
        if let Ok(e) = &mut self.experiment {
            e.set_core(core);
        }
        self
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        if let Ok(e) = &mut self.experiment {
            e.set_name(name);
        }
        self
    }

    pub fn timeout_secs(mut self, timeout_secs: u64) -> Self {
        if let Ok(e) = &mut self.experiment {
            e.timeout_secs = timeout_secs;
        }
        self
    }

    pub fn build(self) -> Result<Experiment, ExperimentError> {
        self.experiment
    }
}

impl Experiment {
    /// Create a new single-use experiment rooted at `root_dir`, using
    /// `config` for credentials/addressing. `options` defaults when `None`.
    pub fn new(root_dir: impl Into<PathBuf>, config: ResolvedConfig, options: Option<ClientOptions>) -> Result<Self, ExperimentError> {
        let transport = TransportClient::new(options.unwrap_or_default())?;
        Ok(Self {
            root_dir: root_dir.into(),
            exp_dir: None,
            name: None,
            effective_name: None,
            workloads: Vec::new(),
            core: None,
            timeout_secs: 300,
            uuid: None,
            otp: None,
            state: ExperimentState::New,
            status_url: None,
            upload_url: None,
            result_url: None,
            summary: None,
            source_files: BTreeSet::new(),
            config,
            transport,
        })
    }

    pub fn builder(root_dir: impl Into<PathBuf>, config: ResolvedConfig, options: Option<ClientOptions>) -> ExperimentBuilder {
        ExperimentBuilder { experiment: Self::new(root_dir, config, options) }
    }

    pub fn state(&self) -> &ExperimentState {
        &self.state
    }

    /// Validate that `path` exists, is readable, and begins with the ELF
    /// magic bytes; fails fast otherwise (spec §4.5, scenario S5).
    pub fn add_workload(&mut self, path: &Path) -> Result<(), ExperimentError> {
        let basename = path
            .file_name()
            .ok_or_else(|| ExperimentError::invalid_input(format!("workload path has no file name: {}", path.display())))?
            .to_os_string();

        let mut magic = [0u8; 4];
        let contents = std::fs::read(path).map_err(|e| ExperimentError::invalid_input(format!("cannot read workload {}: {e}", path.display())))?;
        if contents.len() < 4 {
            return Err(ExperimentError::invalid_input(format!("workload {} is too short to be an ELF file", path.display())));
        }
        magic.copy_from_slice(&contents[0..4]);
        if magic != ELF_MAGIC {
            return Err(ExperimentError::invalid_input(format!("workload {} is not an ELF file", path.display())));
        }

        if self.workloads.iter().any(|w| w.basename == basename) {
            return Err(ExperimentError::invalid_input(format!("duplicate workload basename: {}", basename.to_string_lossy())));
        }

        self.workloads.push(Workload { path: path.to_path_buf(), basename });
        Ok(())
    }

    /// Pure assignment; validated against capabilities at `run()` time.
    pub fn set_core(&mut self, core: impl Into<String>) {
        self.core = Some(core.into());
    }

    pub fn set_name(&mut self, name: impl Into<String>) {
        self.name = Some(name.into());
    }

    pub fn get_summary(&self) -> Option<&SummaryReport> {
        self.summary.as_ref()
    }

    pub fn source_files(&self) -> &BTreeSet<PathBuf> {
        &self.source_files
    }

    pub fn exp_dir(&self) -> Option<&Path> {
        self.exp_dir.as_deref()
    }

    /// Rehydrate a succeeded experiment from disk, reading
    /// `expDir/summary/summary.json`. No network traffic.
    pub async fn load(exp_dir: impl Into<PathBuf>) -> Result<LoadedExperiment, ExperimentError> {
        let exp_dir = exp_dir.into();
        let summary = report::load_summary(&exp_dir.join("summary")).await?;
        Ok(LoadedExperiment { exp_dir, summary })
    }

    fn transition(&mut self, to: ExperimentState) {
        info!(from = %self.state, to = %to, "state transition");
        self.state = to;
    }

    fn fail(&mut self, err: ExperimentError) -> ExperimentError {
        let err = err.with_phase(self.state.clone());
        error!(error = %err, phase = %self.state, "experiment failed");
        self.state = ExperimentState::Failed(err.to_string());
        err
    }

    /// Drive the state machine to `Succeeded` or `Failed` (spec §4.4/§4.5).
    /// `name` overrides a prior `set_name` if provided.
    pub async fn run(&mut self, name: Option<&str>, cancel: &CancellationToken) -> Result<SummaryReport, ExperimentError> {
        if let Some(name) = name {
            self.set_name(name);
        }
        match self.run_inner(cancel).await {
            Ok(summary) => {
                self.summary = Some(summary.clone());
                self.transition(ExperimentState::Succeeded);
                Ok(summary)
            }
            Err(e) => {
                let err = self.fail(e);
                self.cleanup_temp_files().await;
                Err(err)
            }
        }
    }

    async fn run_inner(&mut self, cancel: &CancellationToken) -> Result<SummaryReport, ExperimentError> {
        self.check_cancelled(cancel)?;

        // New -> Configured
        if self.workloads.is_empty() {
            return Err(ExperimentError::invalid_input("no workloads added"));
        }
        let core = self.core.clone().ok_or_else(|| ExperimentError::invalid_input("no core set"))?;
        self.transition(ExperimentState::Configured);

        // Configured -> CapabilitiesFetched
        self.check_cancelled(cancel)?;
        transport::check_workers(&self.transport, &self.config.gateway, &self.config.api_key, &self.config.client_version, cancel).await?;
        let capabilities = transport::fetch_capabilities(
            &self.transport,
            &self.config.gateway,
            &self.config.api_key,
            &self.config.client_version,
            &self.config.tools_version,
            cancel,
        )
        .await?;
        if capabilities.find_core(&core).is_none() {
            return Err(ExperimentError::invalid_input(format!("core {core} not in capability catalog")));
        }
        self.transition(ExperimentState::CapabilitiesFetched);

        // CapabilitiesFetched -> Packaged
        self.check_cancelled(cancel)?;
        let timestamp = generate_timestamp();
        let uuid = format!("{timestamp}_{}", Uuid::new_v4());
        let mut otp = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut otp);
        let name = self.name.clone().unwrap_or_else(|| timestamp.clone());
        self.effective_name = Some(name.clone());
        self.exp_dir = Some(self.root_dir.join(format!("{timestamp}_{name}")));
        let exp_dir = self.exp_dir.clone().unwrap();
        tokio::fs::create_dir_all(&exp_dir)
            .await
            .map_err(|e| ExperimentError::packaging(format!("create experiment directory: {e}")))?;

        let core_descriptor = capabilities
            .find_core(&core)
            .ok_or_else(|| ExperimentError::internal("core disappeared from capability catalog after validation"))?;

        let config_doc = ExperimentConfig {
            uuid: uuid.clone(),
            name: name.clone(),
            date: chrono::Utc::now().to_rfc3339(),
            core: core.clone(),
            tools_version: self.config.tools_version.clone(),
            plugin_version: self.config.client_version.clone(),
            client_type: "simforge".to_string(),
            otp: encode_otp(&otp),
            arch: ArchConfig { num_threads: core_descriptor.num_threads },
            workload: self
                .workloads
                .iter()
                .map(|w| WorkloadEntry {
                    elf: w.basename.to_string_lossy().to_string(),
                    reports: vec![ReportRequest {
                        uuid: uuid.clone(),
                        kind: "summary".to_string(),
                        name: "summary".to_string(),
                        output_format: "json".to_string(),
                    }],
                })
                .collect(),
            timeout: self.timeout_secs,
        };
        let config_json = serde_json::to_string(&config_doc).map_err(|e| ExperimentError::packaging(format!("serialize config.json: {e}")))?;
        tokio::fs::write(exp_dir.join("config.json"), &config_json)
            .await
            .map_err(|e| ExperimentError::packaging(format!("write config.json: {e}")))?;

        let tar_path = exp_dir.join(format!("{name}.tar.gz"));
        package::pack(&tar_path, &config_json, &self.workloads).await?;

        self.uuid = Some(uuid.clone());
        self.otp = Some(otp);
        self.transition(ExperimentState::Packaged);

        for workload in &self.workloads {
            self.source_files.extend(snapshot_source_files(&workload.path));
        }

        // Packaged -> URLsIssued
        self.check_cancelled(cancel)?;
        let workload_label = self.workloads.iter().map(|w| w.basename.to_string_lossy().to_string()).collect::<Vec<_>>().join(",");
        let signed = transport::get_signed_urls(&self.transport, &self.config, &uuid, &workload_label, &core, cancel).await?;
        self.status_url = Some(signed.status_url.clone());
        self.upload_url = Some(signed.upload_url.clone());
        self.transition(ExperimentState::UrlsIssued);

        // URLsIssued -> Encrypted
        self.check_cancelled(cancel)?;
        hybrid_encrypt_file(&tar_path, &signed.public_key_pem).await?;
        self.transition(ExperimentState::Encrypted);

        // Encrypted -> Uploaded
        self.check_cancelled(cancel)?;
        transport::upload(&self.transport, &signed.upload_url, &tar_path, cancel).await?;
        secure_delete(&tar_path).await;
        self.transition(ExperimentState::Uploaded);

        // Uploaded -> Polling -> Downloading
        self.transition(ExperimentState::Polling);
        let deadline = Duration::from_secs(self.timeout_secs) + POLL_DEADLINE_SLACK;
        let outcome = transport::poll_status(&self.transport, &signed.status_url, deadline, cancel).await?;
        let result_url = match outcome {
            transport::StatusOutcome::Completed { result_url } => result_url,
            transport::StatusOutcome::NotFound => {
                return Err(ExperimentError::protocol(crate::error::ProtocolErrorKind::Rejected, "status endpoint returned 404"));
            }
            transport::StatusOutcome::ServerFailure { message } => {
                return Err(ExperimentError::ServiceUnavailable { message });
            }
        };
        self.result_url = Some(result_url.clone());
        self.transition(ExperimentState::Downloading);

        // Downloading -> Decrypting
        self.check_cancelled(cancel)?;
        let result_path = exp_dir.join(format!("{name}_result.tar.gz"));
        transport::download(&self.transport, &result_url, &result_path, cancel).await?;
        self.transition(ExperimentState::Decrypting);

        // Decrypting -> Unpacking
        self.check_cancelled(cancel)?;
        otp_decrypt_file(&result_path, &otp, self.transport.options().legacy_decrypt_allowed).await?;
        self.transition(ExperimentState::Unpacking);

        // Unpacking -> Succeeded
        package::unpack(&result_path, &exp_dir).await?;
        secure_delete(&result_path).await;

        let summary_dir = exp_dir.join("summary");
        let summary = if summary_dir.join("summary.json").exists() {
            report::load_summary(&summary_dir).await?
        } else {
            return Err(ExperimentError::report(crate::error::ReportErrorKind::MissingField, "summary/summary.json not present after unpack"));
        };

        Ok(summary)
    }

    fn check_cancelled(&self, cancel: &CancellationToken) -> Result<(), ExperimentError> {
        if cancel.is_cancelled() {
            Err(ExperimentError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Remove only explicitly-transient files (plaintext tar once encrypted,
    /// ciphertext blob once decrypted); everything else under `expDir` is
    /// left for post-mortem (spec §4.4).
    async fn cleanup_temp_files(&self) {
        let Some(exp_dir) = &self.exp_dir else { return };
        let Some(name) = &self.effective_name else { return };
        let tar_path = exp_dir.join(format!("{name}.tar.gz"));
        let result_path = exp_dir.join(format!("{name}_result.tar.gz"));
        if tar_path.exists() {
            secure_delete(&tar_path).await;
        }
        if result_path.exists() {
            secure_delete(&result_path).await;
        }
    }
}

/// `<YYMMDD_HHMMSS>` component shared by `uuid` (§3.1) and the default
/// `name`/`expDir` derivation (§3.1: "name defaults to timestamp";
/// "expDir: rootDir/<timestamp>_<name>") — kept as one source so the two
/// never drift apart.
fn generate_timestamp() -> String {
    chrono::Utc::now().format("%y%m%d_%H%M%S").to_string()
}

/// Encode the raw 32-byte `otp` as a string whose code points are the byte
/// values (spec §6.3). Implementations that re-encode as UTF-8 break
/// server-side key derivation — do not "fix" this.
fn encode_otp(otp: &[u8; 32]) -> String {
    otp.iter().map(|&b| char::from_u32(b as u32).expect("byte values are always valid code points")).collect()
}
