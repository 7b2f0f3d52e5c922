//! Configuration and capability DTOs the core consumes from its caller.
//!
//! `ResolvedConfig` is constructed outside this crate (environment/file
//! loading is an explicit non-goal); the core only validates field presence
//! and treats the rest as opaque.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Credentials and addressing resolved by the caller before an experiment
/// starts. Immutable once constructed, shared read-only across components.
#[derive(Clone, Debug)]
pub struct ResolvedConfig {
    pub api_key: String,
    pub channel: String,
    pub region: String,
    pub gateway: String,
    pub tools_version: String,
    pub client_version: String,
    pub verbose: bool,
}

impl ResolvedConfig {
    pub fn builder(api_key: impl Into<String>, channel: impl Into<String>, region: impl Into<String>) -> ResolvedConfigBuilder {
        ResolvedConfigBuilder::new(api_key, channel, region)
    }
}

/// Typed builder for `ResolvedConfig`, for callers assembling it
/// programmatically rather than from a literal.
#[derive(Clone, Debug)]
pub struct ResolvedConfigBuilder {
    api_key: String,
    channel: String,
    region: String,
    gateway: Option<String>,
    tools_version: String,
    client_version: String,
    verbose: bool,
}

impl ResolvedConfigBuilder {
    pub fn new(api_key: impl Into<String>, channel: impl Into<String>, region: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            channel: channel.into(),
            region: region.into(),
            gateway: None,
            tools_version: "latest".to_string(),
            client_version: env!("CARGO_PKG_VERSION").to_string(),
            verbose: false,
        }
    }

    pub fn gateway(mut self, gateway: impl Into<String>) -> Self {
        self.gateway = Some(gateway.into());
        self
    }

    pub fn tools_version(mut self, version: impl Into<String>) -> Self {
        self.tools_version = version.into();
        self
    }

    pub fn client_version(mut self, version: impl Into<String>) -> Self {
        self.client_version = version.into();
        self
    }

    pub fn verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    /// Finalize, requiring the gateway to already be known (skips discovery).
    pub fn build(self) -> Result<ResolvedConfig, String> {
        let gateway = self.gateway.ok_or_else(|| "gateway not set".to_string())?;
        Ok(ResolvedConfig {
            api_key: self.api_key,
            channel: self.channel,
            region: self.region,
            gateway,
            tools_version: self.tools_version,
            client_version: self.client_version,
            verbose: self.verbose,
        })
    }
}

/// A single core descriptor published by `cloudcaps`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CoreDescriptor {
    pub name: String,
    pub num_threads: u32,
    #[serde(flatten)]
    pub attributes: BTreeMap<String, serde_json::Value>,
}

/// Per-version capability catalog, fetched once per experiment and treated
/// as read-only afterward.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct CloudCapabilities {
    pub cores: Vec<CoreDescriptor>,
    #[serde(rename = "toolsVersions")]
    pub tools_versions: Vec<String>,
}

impl CloudCapabilities {
    pub fn find_core(&self, name: &str) -> Option<&CoreDescriptor> {
        self.cores.iter().find(|c| c.name == name)
    }

    pub fn supports_version(&self, version: &str) -> bool {
        self.tools_versions.iter().any(|v| v == version)
    }
}

/// Cross-cutting knobs a real deployment needs but which spec.md treats as
/// fixed constants. All fields default to the documented spec values.
#[derive(Clone, Debug)]
pub struct ClientOptions {
    pub connect_timeout: Duration,
    pub idle_timeout: Duration,
    pub poll_initial_interval: Duration,
    pub poll_max_interval: Duration,
    pub legacy_decrypt_allowed: bool,
    pub user_agent_suffix: Option<String>,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(120),
            poll_initial_interval: Duration::from_secs(2),
            poll_max_interval: Duration::from_secs(15),
            legacy_decrypt_allowed: false,
            user_agent_suffix: None,
        }
    }
}
