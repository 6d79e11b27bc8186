use std::{path::PathBuf, time::Duration};

use anyhow::Context;
use tether_interop::{EngineVersion, SecurityLevel, Visibility};

const DEFAULT_BRIDGE_PORT: u16 = 5010;
const DEFAULT_STARTUP_TIMEOUT_SEC: u64 = 60;
const DEFAULT_TOPIC_TIMEOUT_MS: u64 = 5000;
const DEFAULT_TOPIC_PRIORITY_ATTEMPTS: u64 = 3;
const DEFAULT_VALIDATION_GRACE_SEC: u64 = 15;
const DEFAULT_REBOOT_GATE_TIMEOUT_SEC: u64 = 60;

/// Supervisor settings, read once at startup.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub data_root: PathBuf,
    pub instance_name: String,
    pub bridge_port: u16,
    /// 0 means "pick a free port".
    pub server_port: u16,
    pub startup_timeout: Duration,
    pub topic_request_timeout: Duration,
    pub topic_priority_attempts: u32,
    pub validation_grace: Duration,
    pub reboot_gate_timeout: Duration,
    pub security_level: SecurityLevel,
    pub visibility: Visibility,
    pub allow_webclient: bool,
    pub additional_params: Option<String>,
    pub engine_log_file: bool,
    pub auto_install: bool,
    pub engine_version: Option<EngineVersion>,
    pub artifact_path: Option<PathBuf>,
    pub engine_source_root: PathBuf,
    pub profile_dir: PathBuf,
    pub database_url: Option<String>,
    pub log_dir: Option<PathBuf>,
}

fn parse_u64(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Option<u64> {
    lookup(name).and_then(|v| v.trim().parse::<u64>().ok())
}

fn parse_bool(lookup: &impl Fn(&str) -> Option<String>, name: &str, default: bool) -> bool {
    match lookup(name) {
        Some(v) => matches!(
            v.trim().to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        None => default,
    }
}

fn non_empty(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Option<String> {
    lookup(name)
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn absolute(p: PathBuf) -> PathBuf {
    let abs = if p.is_absolute() {
        p
    } else {
        std::env::current_dir()
            .unwrap_or_else(|_| PathBuf::from("."))
            .join(p)
    };
    // Best-effort canonicalization: don't fail if the directory doesn't exist yet.
    std::fs::canonicalize(&abs).unwrap_or(abs)
}

impl SupervisorConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let data_root = absolute(PathBuf::from(
            non_empty(&lookup, "TETHER_DATA_ROOT").unwrap_or_else(|| "./data".to_string()),
        ));

        // Unknown keywords are a hard error rather than a silent default.
        let security_level = match non_empty(&lookup, "TETHER_SECURITY_LEVEL") {
            Some(raw) => raw.parse::<SecurityLevel>().context("TETHER_SECURITY_LEVEL")?,
            None => SecurityLevel::Safe,
        };
        let visibility = match non_empty(&lookup, "TETHER_VISIBILITY") {
            Some(raw) => raw.parse::<Visibility>().context("TETHER_VISIBILITY")?,
            None => Visibility::Public,
        };
        let engine_version = non_empty(&lookup, "TETHER_ENGINE_VERSION")
            .map(|raw| raw.parse::<EngineVersion>())
            .transpose()
            .context("TETHER_ENGINE_VERSION")?;

        let bridge_port = match non_empty(&lookup, "TETHER_BRIDGE_PORT") {
            Some(raw) => raw
                .parse::<u16>()
                .with_context(|| format!("TETHER_BRIDGE_PORT is not a port: {raw}"))?,
            None => DEFAULT_BRIDGE_PORT,
        };
        let server_port = match non_empty(&lookup, "TETHER_SERVER_PORT") {
            Some(raw) => raw
                .parse::<u16>()
                .with_context(|| format!("TETHER_SERVER_PORT is not a port: {raw}"))?,
            None => 0,
        };

        Ok(Self {
            instance_name: non_empty(&lookup, "TETHER_INSTANCE_NAME")
                .unwrap_or_else(|| "default".to_string()),
            bridge_port,
            server_port,
            startup_timeout: Duration::from_secs(
                parse_u64(&lookup, "TETHER_STARTUP_TIMEOUT_SEC")
                    .map(|v| v.clamp(5, 3600))
                    .unwrap_or(DEFAULT_STARTUP_TIMEOUT_SEC),
            ),
            topic_request_timeout: Duration::from_millis(
                parse_u64(&lookup, "TETHER_TOPIC_TIMEOUT_MS")
                    .map(|v| v.clamp(500, 60_000))
                    .unwrap_or(DEFAULT_TOPIC_TIMEOUT_MS),
            ),
            topic_priority_attempts: parse_u64(&lookup, "TETHER_TOPIC_PRIORITY_ATTEMPTS")
                .map(|v| v.clamp(1, 10))
                .unwrap_or(DEFAULT_TOPIC_PRIORITY_ATTEMPTS) as u32,
            validation_grace: Duration::from_secs(
                parse_u64(&lookup, "TETHER_VALIDATION_GRACE_SEC")
                    .map(|v| v.clamp(1, 300))
                    .unwrap_or(DEFAULT_VALIDATION_GRACE_SEC),
            ),
            reboot_gate_timeout: Duration::from_secs(
                parse_u64(&lookup, "TETHER_REBOOT_GATE_TIMEOUT_SEC")
                    .map(|v| v.clamp(1, 600))
                    .unwrap_or(DEFAULT_REBOOT_GATE_TIMEOUT_SEC),
            ),
            security_level,
            visibility,
            allow_webclient: parse_bool(&lookup, "TETHER_ALLOW_WEBCLIENT", false),
            additional_params: non_empty(&lookup, "TETHER_ADDITIONAL_PARAMS"),
            engine_log_file: parse_bool(&lookup, "TETHER_ENGINE_LOG_FILE", false),
            auto_install: parse_bool(&lookup, "TETHER_ENGINE_AUTO_INSTALL", true),
            engine_version,
            artifact_path: non_empty(&lookup, "TETHER_ARTIFACT_PATH").map(PathBuf::from),
            engine_source_root: non_empty(&lookup, "TETHER_ENGINE_SOURCE_DIR")
                .map(|v| absolute(PathBuf::from(v)))
                .unwrap_or_else(|| data_root.join("engine-sources")),
            profile_dir: non_empty(&lookup, "TETHER_PROFILE_DIR")
                .map(|v| absolute(PathBuf::from(v)))
                .unwrap_or_else(|| data_root.join("profile")),
            database_url: non_empty(&lookup, "DATABASE_URL"),
            log_dir: non_empty(&lookup, "TETHER_LOG_DIR").map(PathBuf::from),
            data_root,
        })
    }

    pub fn installation_root(&self) -> PathBuf {
        self.data_root.join("engines")
    }

    pub fn diagnostics_dir(&self) -> PathBuf {
        self.data_root.join("diagnostics")
    }

    pub fn reattach_file(&self) -> PathBuf {
        self.data_root.join("reattach.json")
    }
}
