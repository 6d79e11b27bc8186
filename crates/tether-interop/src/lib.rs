//! Values exchanged between the supervisor and the engine process, plus the
//! record persisted to resume a session after the supervisor restarts.

use std::{fmt, str::FromStr};

pub mod bridge;
pub mod chunk;
pub mod reattach;
pub mod topic;
pub mod version;

pub use bridge::{
    BridgeCommandType, BridgeParameters, BridgeResponse, ChatMessage, CustomCommand,
    EngineEvent, RuntimeInformation,
};
pub use chunk::{ChunkData, ChunkRequest};
pub use reattach::{CompiledArtifact, ReattachInformation};
pub use topic::{ChatCommand, EventNotification, TopicCommandType, TopicParameters, TopicResponse};
pub use version::{DottedVersion, EngineKind, EngineVersion, InteropVersion, VersionParseError};

/// Interop version this supervisor speaks.
pub const INTEROP_VERSION: InteropVersion = InteropVersion::new(5, 10, 0);

/// First interop version that understands chunked topics.
pub const CHUNKING_MIN_INTEROP_VERSION: InteropVersion = InteropVersion::new(5, 6, 0);

/// Hard cap on one encoded topic request, including the `?tether_json=` prefix.
pub const MAX_TOPIC_REQUEST_LENGTH: usize = 65_529;

/// Hard cap on one topic reply body.
pub const MAX_TOPIC_RESPONSE_LENGTH: usize = 65_528;

/// Bridge requests larger than this are chunked by the engine process.
pub const MAX_BRIDGE_REQUEST_LENGTH: usize = 8_198;

/// Query key carrying the JSON blob in a topic request.
pub const TOPIC_JSON_KEY: &str = "tether_json";

/// Query key carrying the JSON blob in a bridge request.
pub const BRIDGE_DATA_KEY: &str = "data";

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("unknown {kind} keyword: {value:?}")]
pub struct KeywordError {
    pub kind: &'static str,
    pub value: String,
}

/// What to do the next time the engine process announces an internal reboot.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RebootState {
    #[default]
    Normal,
    Shutdown,
    Restart,
}

impl RebootState {
    pub fn as_str(&self) -> &'static str {
        match self {
            RebootState::Normal => "normal",
            RebootState::Shutdown => "shutdown",
            RebootState::Restart => "restart",
        }
    }
}

impl fmt::Display for RebootState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RebootState {
    type Err = KeywordError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "normal" => Ok(RebootState::Normal),
            "shutdown" => Ok(RebootState::Shutdown),
            "restart" => Ok(RebootState::Restart),
            _ => Err(KeywordError {
                kind: "reboot state",
                value: s.to_string(),
            }),
        }
    }
}

/// Engine sandbox level. Ordered from most to least privileged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum SecurityLevel {
    Trusted,
    Safe,
    Ultrasafe,
}

impl SecurityLevel {
    /// Command-line keyword, without the leading dash.
    pub fn keyword(&self) -> &'static str {
        match self {
            SecurityLevel::Trusted => "trusted",
            SecurityLevel::Safe => "safe",
            SecurityLevel::Ultrasafe => "ultrasafe",
        }
    }
}

impl fmt::Display for SecurityLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.keyword())
    }
}

impl FromStr for SecurityLevel {
    type Err = KeywordError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "trusted" => Ok(SecurityLevel::Trusted),
            "safe" => Ok(SecurityLevel::Safe),
            "ultrasafe" => Ok(SecurityLevel::Ultrasafe),
            _ => Err(KeywordError {
                kind: "security level",
                value: s.to_string(),
            }),
        }
    }
}

/// Hub visibility of the running world.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Visibility {
    Public,
    Private,
    Invisible,
}

impl Visibility {
    pub fn keyword(&self) -> &'static str {
        match self {
            Visibility::Public => "public",
            Visibility::Private => "private",
            Visibility::Invisible => "invisible",
        }
    }
}

impl fmt::Display for Visibility {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.keyword())
    }
}

impl FromStr for Visibility {
    type Err = KeywordError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "public" => Ok(Visibility::Public),
            "private" => Ok(Visibility::Private),
            "invisible" => Ok(Visibility::Invisible),
            _ => Err(KeywordError {
                kind: "visibility",
                value: s.to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keywords_are_exact_match() {
        assert_eq!("safe".parse::<SecurityLevel>().unwrap(), SecurityLevel::Safe);
        assert!("Safe".parse::<SecurityLevel>().is_err());
        assert!(" safe".parse::<SecurityLevel>().is_err());
        assert_eq!("invisible".parse::<Visibility>().unwrap(), Visibility::Invisible);
        let err = "hidden".parse::<Visibility>().unwrap_err();
        assert_eq!(err.to_string(), "unknown visibility keyword: \"hidden\"");
    }

    #[test]
    fn security_levels_order_by_privilege() {
        assert!(SecurityLevel::Trusted < SecurityLevel::Safe);
        assert!(SecurityLevel::Safe < SecurityLevel::Ultrasafe);
    }

    #[test]
    fn reboot_state_defaults_to_normal() {
        assert_eq!(RebootState::default(), RebootState::Normal);
        assert_eq!(
            serde_json::to_string(&RebootState::Shutdown).unwrap(),
            "\"shutdown\""
        );
    }
}
