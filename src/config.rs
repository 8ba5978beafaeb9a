//! Harness configuration
//!
//! [`HarnessConfig`] is the YAML file a test suite ships with; [`HarnessEnv`]
//! abstracts the bits of the process environment the command runner reads,
//! enabling dependency injection and mocking for tests.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::Error;
use crate::client::RetryClient;
use crate::client::kube::{KubeDiscovery, KubeStore, create_client};
use crate::command::CommandSpec;

const DEFAULT_COMMAND_TIMEOUT_SECS: u64 = 30;
const DEFAULT_POLL_INTERVAL_MS: u64 = 100;
const DEFAULT_POLL_TIMEOUT_SECS: u64 = 10;

fn default_timeout() -> u64 {
    DEFAULT_COMMAND_TIMEOUT_SECS
}

fn default_poll_interval() -> u64 {
    DEFAULT_POLL_INTERVAL_MS
}

fn default_poll_timeout() -> u64 {
    DEFAULT_POLL_TIMEOUT_SECS
}

fn default_namespace() -> String {
    crate::client::DEFAULT_NAMESPACE.to_string()
}

/// Suite-level settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HarnessConfig {
    /// Default timeout in seconds for foreground commands
    #[serde(default = "default_timeout")]
    pub timeout: u64,

    /// Milliseconds between checks of the deletion and CRD waits
    #[serde(default = "default_poll_interval")]
    pub poll_interval: u64,

    /// Seconds before the deletion and CRD waits give up
    #[serde(default = "default_poll_timeout")]
    pub poll_timeout: u64,

    /// Kubeconfig to connect with; inferred when unset
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kubeconfig: Option<PathBuf>,

    /// Directories whose manifests are installed before the suite runs
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub manifest_dirs: Vec<PathBuf>,

    /// Directory of CRDs to install and wait for before anything else
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub crd_dir: Option<PathBuf>,

    /// Commands run before the suite
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub commands: Vec<CommandSpec>,

    /// Namespace for commands and namespaced manifests
    #[serde(default = "default_namespace")]
    pub namespace: String,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_COMMAND_TIMEOUT_SECS,
            poll_interval: DEFAULT_POLL_INTERVAL_MS,
            poll_timeout: DEFAULT_POLL_TIMEOUT_SECS,
            kubeconfig: None,
            manifest_dirs: Vec::new(),
            crd_dir: None,
            commands: Vec::new(),
            namespace: default_namespace(),
        }
    }
}

impl HarnessConfig {
    /// Parse and validate a YAML document
    pub fn from_yaml(text: &str) -> Result<Self, Error> {
        let config: Self = serde_yaml::from_str(text).map_err(|e| {
            Error::serialization_for_kind("HarnessConfig", format!("invalid harness config: {}", e))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a config file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, Error> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
        Self::from_yaml(&text)
    }

    /// Reject settings that would make waits spin or commands unusable
    pub fn validate(&self) -> Result<(), Error> {
        if self.poll_interval == 0 {
            return Err(Error::validation_for_field(
                "pollInterval",
                "poll interval must be greater than zero",
            ));
        }
        if self.namespace.is_empty() {
            return Err(Error::validation_for_field("namespace", "namespace must not be empty"));
        }
        for (index, command) in self.commands.iter().enumerate() {
            command.validate().map_err(|e| match e {
                Error::Validation { message, .. } => {
                    Error::validation_for_field(format!("commands[{index}]"), message)
                }
                other => other,
            })?;
        }
        Ok(())
    }

    /// Poll cadence as a duration
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval)
    }

    /// Poll bound as a duration
    pub fn poll_timeout(&self) -> Duration {
        Duration::from_secs(self.poll_timeout)
    }

    /// Connect to the API server described by this config
    pub async fn connect(&self) -> Result<RetryClient, Error> {
        let client = create_client(self.kubeconfig.as_deref()).await?;
        let discovery = Arc::new(KubeDiscovery::new(client.clone()));
        let store = Arc::new(KubeStore::new(client, discovery.clone()));
        Ok(RetryClient::new(store, discovery)
            .with_polling(self.poll_interval(), self.poll_timeout()))
    }
}

/// Process environment seen by spawned commands
#[cfg_attr(test, mockall::automock)]
pub trait HarnessEnv: Send + Sync {
    /// Working directory commands are started from
    fn current_dir(&self) -> Result<PathBuf, Error>;

    /// A variable of the parent environment
    fn var(&self, name: &str) -> Option<String>;
}

/// Default implementation that reads the real process environment
#[derive(Clone, Copy, Debug, Default)]
pub struct OsEnv;

impl HarnessEnv for OsEnv {
    fn current_dir(&self) -> Result<PathBuf, Error> {
        std::env::current_dir().map_err(|e| Error::io(".", e))
    }

    fn var(&self, name: &str) -> Option<String> {
        std::env::var(name).ok()
    }
}
