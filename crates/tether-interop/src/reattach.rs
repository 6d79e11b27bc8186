use std::path::PathBuf;

use crate::{CustomCommand, EngineVersion, InteropVersion, RebootState, SecurityLevel, Visibility};

/// A deployed world build the engine process runs.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct CompiledArtifact {
    pub compile_job_id: i64,
    pub directory: PathBuf,
    /// File name of the compiled world inside `directory`.
    pub artifact_name: String,
    pub engine_version: EngineVersion,
}

impl CompiledArtifact {
    pub fn artifact_path(&self) -> PathBuf {
        self.directory.join(&self.artifact_name)
    }
}

/// Everything needed to resume supervising a running engine process after the
/// supervisor restarts. The process itself cannot be asked for any of it.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct ReattachInformation {
    pub access_identifier: String,
    pub process_id: u32,
    pub port: u16,
    #[serde(default)]
    pub topic_port: Option<u16>,
    #[serde(default)]
    pub reboot_state: RebootState,
    pub artifact: CompiledArtifact,
    pub topic_request_timeout_ms: u64,
    #[serde(default)]
    pub interop_version: Option<InteropVersion>,
    pub security_level: SecurityLevel,
    pub visibility: Visibility,
    #[serde(default)]
    pub custom_commands: Vec<CustomCommand>,
    pub launched_at_unix_ms: u64,
}

impl ReattachInformation {
    pub fn engine_version(&self) -> &EngineVersion {
        &self.artifact.engine_version
    }

    /// Port topic requests go to.
    pub fn topic_target_port(&self) -> u16 {
        self.topic_port.unwrap_or(self.port)
    }
}
