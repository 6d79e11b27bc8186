use crate::{ChunkData, RebootState, SecurityLevel, Visibility};

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum BridgeCommandType {
    Startup,
    Reboot,
    Kill,
    ChatSend,
    Prime,
    DeprecatedPortUpdate,
    Chunk,
    Event,
    #[serde(other)]
    Unknown,
}

/// A request the engine process makes of the supervisor.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeParameters {
    pub command_type: BridgeCommandType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_identifier: Option<String>,
    /// Interop version, only on `Startup`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub minimum_security_level: Option<SecurityLevel>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic_port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_commands: Option<Vec<CustomCommand>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chat_message: Option<ChatMessage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event: Option<EngineEvent>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk: Option<ChunkData>,
}

impl BridgeParameters {
    pub fn new(command_type: BridgeCommandType) -> Self {
        Self {
            command_type,
            access_identifier: None,
            version: None,
            minimum_security_level: None,
            topic_port: None,
            custom_commands: None,
            chat_message: None,
            event: None,
            chunk: None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime_information: Option<RuntimeInformation>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub missing_chunks: Option<Vec<u32>>,
    /// The reboot action consumed by a `Reboot` request.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reboot_state: Option<RebootState>,
}

impl BridgeResponse {
    pub fn ok() -> Self {
        Self::default()
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            error_message: Some(message.into()),
            ..Self::default()
        }
    }

    pub fn missing(chunks: Vec<u32>) -> Self {
        Self {
            missing_chunks: Some(chunks),
            ..Self::default()
        }
    }

    pub fn is_error(&self) -> bool {
        self.error_message.is_some()
    }
}

/// Handed to the engine process in reply to `Startup`.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeInformation {
    pub instance_name: String,
    pub server_version: String,
    pub interop_version: String,
    pub security_level: SecurityLevel,
    pub visibility: Visibility,
    pub server_port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic_port: Option<u16>,
    pub api_validate_only: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomCommand {
    pub name: String,
    #[serde(default)]
    pub help_text: String,
    #[serde(default)]
    pub admin_only: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub text: String,
    #[serde(default)]
    pub channel_ids: Vec<String>,
}

/// A custom event raised by the engine process.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineEvent {
    pub event_name: String,
    #[serde(default)]
    pub parameters: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_command_types_deserialize() {
        let p: BridgeParameters =
            serde_json::from_str(r#"{"commandType":"teleport","accessIdentifier":"x"}"#).unwrap();
        assert_eq!(p.command_type, BridgeCommandType::Unknown);
        assert_eq!(p.access_identifier.as_deref(), Some("x"));
    }

    #[test]
    fn startup_request_shape() {
        let p: BridgeParameters = serde_json::from_str(
            r#"{"commandType":"startup","version":"5.10.0","minimumSecurityLevel":"safe","topicPort":4001,
                "customCommands":[{"name":"status","helpText":"show status"}]}"#,
        )
        .unwrap();
        assert_eq!(p.command_type, BridgeCommandType::Startup);
        assert_eq!(p.minimum_security_level, Some(SecurityLevel::Safe));
        assert_eq!(p.topic_port, Some(4001));
        let commands = p.custom_commands.unwrap();
        assert_eq!(commands[0].name, "status");
        assert!(!commands[0].admin_only);
    }

    #[test]
    fn empty_response_serializes_to_empty_object() {
        assert_eq!(serde_json::to_string(&BridgeResponse::ok()).unwrap(), "{}");
        let err = BridgeResponse::error("nope");
        assert_eq!(
            serde_json::to_string(&err).unwrap(),
            r#"{"errorMessage":"nope"}"#
        );
    }
}
