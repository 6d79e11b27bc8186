use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use tether_interop::{INTEROP_VERSION, SecurityLevel, Visibility};

pub const PARAM_ACCESS_IDENTIFIER: &str = "tether_access_identifier";
pub const PARAM_BRIDGE_PORT: &str = "tether_bridge_port";
pub const PARAM_INTEROP_VERSION: &str = "tether_interop_version";
pub const PARAM_SERVER_VERSION: &str = "tether_version";

/// Everything an engine needs on its command line, independent of engine kind.
#[derive(Debug, Clone)]
pub struct LaunchArguments {
    pub artifact_path: PathBuf,
    pub port: u16,
    /// Only engines that listen for topics separately use this.
    pub topic_port: Option<u16>,
    pub security_level: SecurityLevel,
    pub visibility: Visibility,
    pub allow_webclient: bool,
    pub log_file: Option<PathBuf>,
    /// Already encoded, see [`build_params`].
    pub params: String,
}

#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub exec: PathBuf,
    pub args: Vec<String>,
}

pub type ArgumentFormatter = fn(&LaunchArguments) -> Vec<String>;

pub fn byond_arguments(a: &LaunchArguments) -> Vec<String> {
    let mut args = vec![
        a.artifact_path.to_string_lossy().into_owned(),
        "-port".to_string(),
        a.port.to_string(),
        "-ports".to_string(),
        "1-65535".to_string(),
    ];
    if a.allow_webclient {
        args.push("-webclient".to_string());
    }
    args.push("-close".to_string());
    args.push("-verbose".to_string());
    args.push(format!("-{}", a.security_level.keyword()));
    args.push(format!("-{}", a.visibility.keyword()));
    match &a.log_file {
        Some(path) => {
            args.push("-log".to_string());
            args.push(path.to_string_lossy().into_owned());
        }
        None => args.push("-logself".to_string()),
    }
    args.push("-params".to_string());
    args.push(a.params.clone());
    args
}

pub fn open_dream_arguments(a: &LaunchArguments) -> Vec<String> {
    let mut cvars = vec![
        format!("net.port={}", a.port),
        format!("opendream.topic_port={}", a.topic_port.unwrap_or(0)),
        format!("opendream.json_path={}", a.artifact_path.to_string_lossy()),
    ];
    if let Some(path) = &a.log_file {
        cvars.push(format!("server.log_file={}", path.to_string_lossy()));
    }
    cvars.push(format!("opendream.world_params={}", a.params));

    cvars
        .into_iter()
        .flat_map(|cvar| ["--cvar".to_string(), cvar])
        .collect()
}

/// `k=v&k=v` with both sides URL-encoded, then the caller's raw string appended as is.
pub fn build_params(map: &BTreeMap<String, String>, additional: Option<&str>) -> String {
    let mut out = map
        .iter()
        .map(|(k, v)| format!("{}={}", urlencoding::encode(k), urlencoding::encode(v)))
        .collect::<Vec<_>>()
        .join("&");
    if let Some(extra) = additional.map(str::trim).filter(|s| !s.is_empty()) {
        if !out.is_empty() {
            out.push('&');
        }
        out.push_str(extra.trim_start_matches('&'));
    }
    out
}

/// Parameters every launched process receives so it can reach the bridge.
pub fn standard_params(access_identifier: &str, bridge_port: u16) -> BTreeMap<String, String> {
    BTreeMap::from([
        (PARAM_ACCESS_IDENTIFIER.to_string(), access_identifier.to_string()),
        (PARAM_BRIDGE_PORT.to_string(), bridge_port.to_string()),
        (PARAM_INTEROP_VERSION.to_string(), INTEROP_VERSION.to_string()),
        (PARAM_SERVER_VERSION.to_string(), env!("CARGO_PKG_VERSION").to_string()),
    ])
}

/// A fresh timestamped log file under the diagnostics directory.
pub fn diagnostics_log_path(diagnostics_dir: &Path, instance_name: &str) -> PathBuf {
    let stamp = chrono::Utc::now().format("%Y%m%d-%H%M%S");
    diagnostics_dir.join(format!("{instance_name}-{stamp}.log"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args() -> LaunchArguments {
        LaunchArguments {
            artifact_path: PathBuf::from("/srv/game/world.dmb"),
            port: 5000,
            topic_port: None,
            security_level: SecurityLevel::Safe,
            visibility: Visibility::Public,
            allow_webclient: false,
            log_file: None,
            params: "a=1".to_string(),
        }
    }

    fn has_pair(args: &[String], flag: &str, value: &str) -> bool {
        args.windows(2).any(|w| w[0] == flag && w[1] == value)
    }

    #[test]
    fn byond_command_line_carries_port_and_keywords() {
        let line = byond_arguments(&args());
        assert_eq!(line[0], "/srv/game/world.dmb");
        assert!(has_pair(&line, "-port", "5000"));
        assert!(line.iter().any(|a| a == "-safe"));
        assert!(line.iter().any(|a| a == "-public"));
        assert!(!line.iter().any(|a| a == "-webclient"));
        assert!(line.iter().any(|a| a == "-logself"));
        assert!(has_pair(&line, "-params", "a=1"));
    }

    #[test]
    fn byond_webclient_and_log_file() {
        let mut a = args();
        a.allow_webclient = true;
        a.security_level = SecurityLevel::Ultrasafe;
        a.visibility = Visibility::Invisible;
        a.log_file = Some(PathBuf::from("/logs/dd.log"));
        let line = byond_arguments(&a);
        assert!(line.iter().any(|s| s == "-webclient"));
        assert!(line.iter().any(|s| s == "-ultrasafe"));
        assert!(line.iter().any(|s| s == "-invisible"));
        assert!(has_pair(&line, "-log", "/logs/dd.log"));
        assert!(!line.iter().any(|s| s == "-logself"));
    }

    #[test]
    fn open_dream_uses_cvars() {
        let mut a = args();
        a.artifact_path = PathBuf::from("/srv/game/world.json");
        a.topic_port = Some(5001);
        let line = open_dream_arguments(&a);
        assert!(has_pair(&line, "--cvar", "net.port=5000"));
        assert!(has_pair(&line, "--cvar", "opendream.topic_port=5001"));
        assert!(has_pair(&line, "--cvar", "opendream.json_path=/srv/game/world.json"));
        assert!(has_pair(&line, "--cvar", "opendream.world_params=a=1"));
        assert!(!line.iter().any(|s| s.starts_with("server.log_file")));
    }

    #[test]
    fn params_are_encoded_and_additional_is_raw() {
        let map = BTreeMap::from([
            ("b".to_string(), "x y".to_string()),
            ("a".to_string(), "1&2".to_string()),
        ]);
        assert_eq!(build_params(&map, None), "a=1%262&b=x%20y");
        assert_eq!(build_params(&map, Some("&raw=v w")), "a=1%262&b=x%20y&raw=v w");
        assert_eq!(build_params(&BTreeMap::new(), Some("c=3")), "c=3");
        assert_eq!(build_params(&BTreeMap::new(), Some("  ")), "");
    }

    #[test]
    fn standard_params_name_the_bridge() {
        let p = standard_params("token", 5010);
        assert_eq!(p.get(PARAM_ACCESS_IDENTIFIER).map(String::as_str), Some("token"));
        assert_eq!(p.get(PARAM_BRIDGE_PORT).map(String::as_str), Some("5010"));
        assert_eq!(
            p.get(PARAM_INTEROP_VERSION).map(String::as_str),
            Some(INTEROP_VERSION.to_string().as_str())
        );
    }
}
