use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{GraderError, Result};
use crate::grading::Assignment;

/// Configuration for Docker-based build execution.
///
/// Every limit here is applied in the single `docker run` call that creates the
/// container, never patched on afterwards.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SandboxConfig {
    /// Docker image used when an assignment does not name its own
    pub image: String,
    /// Disable network access in container
    pub network_disabled: bool,
    /// Memory limit (e.g., "1024m")
    pub memory_limit: Option<String>,
    /// Memory + swap ceiling. Equal to `memory_limit` means no swap.
    pub memory_swap_limit: Option<String>,
    /// CPU limit (e.g., "0.5" for half a CPU)
    pub cpu_limit: Option<String>,
    /// ulimit nproc (soft and hard)
    pub max_procs: u32,
    /// ulimit nofile (soft and hard)
    pub max_files: u32,
    /// ulimit nice (soft and hard)
    pub nice_limit: i32,
    /// Optional AppArmor profile name
    pub apparmor_profile: Option<String>,
    /// Per-command deadline used when a caller does not pass one
    pub command_timeout_secs: u64,
    /// Path or name of the docker CLI
    pub docker_bin: String,
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            image: "ubuntu:24.04".to_string(),
            network_disabled: true,
            memory_limit: Some("1024m".to_string()),
            memory_swap_limit: Some("1024m".to_string()),
            cpu_limit: None,
            max_procs: 256,
            max_files: 256,
            nice_limit: 5,
            apparmor_profile: None,
            command_timeout_secs: 10,
            docker_bin: "docker".to_string(),
        }
    }
}

/// Per-source ceiling on builds that are queued or in progress.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AdmissionConfig {
    /// `None` admits everything.
    pub max_ongoing_builds: Option<u32>,
    /// Count only builds of the same assignment against the ceiling.
    pub per_assignment: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SlipConfig {
    pub grace_period_secs: i64,
    pub seconds_per_unit: i64,
    pub unit_name_singular: String,
    pub unit_name_plural: String,
}

impl Default for SlipConfig {
    fn default() -> Self {
        Self {
            grace_period_secs: 0,
            seconds_per_unit: 86_400,
            unit_name_singular: "slip day".to_string(),
            unit_name_plural: "days".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MailerConfig {
    pub enabled: bool,
    /// Write outgoing mail here instead of only logging it
    pub spool_dir: Option<PathBuf>,
    pub from: String,
    /// Receives a copy of every critical build failure
    pub operator_address: Option<String>,
    /// user id -> mail address. Users without an entry are not mailed.
    pub addresses: HashMap<String, String>,
}

impl Default for MailerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            spool_dir: None,
            from: "autograder@localhost".to_string(),
            operator_address: None,
            addresses: HashMap::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GraderConfig {
    pub database_path: PathBuf,
    /// Number of build workers
    pub workers: usize,
    pub debug_mode: bool,
    /// Autograder grades never lower a stored score
    pub use_max_score_build: bool,
    pub dashboard_addr: Option<SocketAddr>,
    pub admission: AdmissionConfig,
    pub slip: SlipConfig,
    pub sandbox: SandboxConfig,
    pub mailer: MailerConfig,
    pub assignments: Vec<Assignment>,
    /// Group source -> member user ids. Unlisted sources are personal.
    pub owners: HashMap<String, Vec<String>>,
}

impl Default for GraderConfig {
    fn default() -> Self {
        Self {
            database_path: PathBuf::from("gradebox.db"),
            workers: 3,
            debug_mode: false,
            use_max_score_build: false,
            dashboard_addr: None,
            admission: AdmissionConfig::default(),
            slip: SlipConfig::default(),
            sandbox: SandboxConfig::default(),
            mailer: MailerConfig::default(),
            assignments: Vec::new(),
            owners: HashMap::new(),
        }
    }
}

impl GraderConfig {
    /// Load and validate a YAML configuration file. Relative `*_path`/`*_dir`
    /// values are resolved against the file's directory.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path)?;
        let mut config = Self::from_yaml(&raw)?;

        if let Some(base) = path.parent() {
            if config.database_path.is_relative() {
                config.database_path = base.join(&config.database_path);
            }
            if let Some(spool) = config.mailer.spool_dir.as_mut() {
                if spool.is_relative() {
                    *spool = base.join(&*spool);
                }
            }
        }
        Ok(config)
    }

    pub fn from_yaml(raw: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(raw)
            .map_err(|e| GraderError::Config(format!("invalid YAML: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.workers == 0 {
            return Err(GraderError::Config("workers must be at least 1".into()));
        }
        if self.slip.seconds_per_unit <= 0 {
            return Err(GraderError::Config(
                "slip.seconds_per_unit must be positive".into(),
            ));
        }
        let mut seen = HashSet::new();
        for assignment in &self.assignments {
            assignment.validate()?;
            if !seen.insert(assignment.name.as_str()) {
                return Err(GraderError::Config(format!(
                    "assignment {} is defined twice",
                    assignment.name
                )));
            }
        }
        Ok(())
    }
}
