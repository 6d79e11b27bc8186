use crate::{ChunkData, ChunkRequest, CustomCommand, RebootState};

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TopicCommandType {
    EventNotification,
    ChatCommand,
    ChangePort,
    ChangeRebootState,
    InstanceRenamed,
    ServerPortUpdate,
    Heartbeat,
    WatchdogReattach,
    SendChunk,
    ReceiveChunk,
}

/// A command the supervisor sends to the engine process.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TopicParameters {
    pub command_type: TopicCommandType,
    /// Filled in by the session right before sending.
    #[serde(default)]
    pub access_identifier: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_reboot_state: Option<RebootState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_instance_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chat_command: Option<ChatCommand>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub event_notification: Option<EventNotification>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk: Option<ChunkData>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk_request: Option<ChunkRequest>,
}

impl TopicParameters {
    fn new(command_type: TopicCommandType) -> Self {
        Self {
            command_type,
            access_identifier: String::new(),
            new_port: None,
            new_reboot_state: None,
            new_instance_name: None,
            chat_command: None,
            event_notification: None,
            chunk: None,
            chunk_request: None,
        }
    }

    pub fn heartbeat() -> Self {
        Self::new(TopicCommandType::Heartbeat)
    }

    pub fn watchdog_reattach() -> Self {
        Self::new(TopicCommandType::WatchdogReattach)
    }

    pub fn change_port(port: u16) -> Self {
        Self {
            new_port: Some(port),
            ..Self::new(TopicCommandType::ChangePort)
        }
    }

    pub fn server_port_update(port: u16) -> Self {
        Self {
            new_port: Some(port),
            ..Self::new(TopicCommandType::ServerPortUpdate)
        }
    }

    pub fn change_reboot_state(state: RebootState) -> Self {
        Self {
            new_reboot_state: Some(state),
            ..Self::new(TopicCommandType::ChangeRebootState)
        }
    }

    pub fn instance_renamed(name: impl Into<String>) -> Self {
        Self {
            new_instance_name: Some(name.into()),
            ..Self::new(TopicCommandType::InstanceRenamed)
        }
    }

    pub fn chat_command(command: ChatCommand) -> Self {
        Self {
            chat_command: Some(command),
            ..Self::new(TopicCommandType::ChatCommand)
        }
    }

    pub fn event_notification(event: EventNotification) -> Self {
        Self {
            event_notification: Some(event),
            ..Self::new(TopicCommandType::EventNotification)
        }
    }

    pub fn send_chunk(access_identifier: &str, chunk: ChunkData) -> Self {
        Self {
            access_identifier: access_identifier.to_string(),
            chunk: Some(chunk),
            ..Self::new(TopicCommandType::SendChunk)
        }
    }

    pub fn receive_chunk(access_identifier: &str, request: ChunkRequest) -> Self {
        Self {
            access_identifier: access_identifier.to_string(),
            chunk_request: Some(request),
            ..Self::new(TopicCommandType::ReceiveChunk)
        }
    }

    /// Commands answered even while the process is not known to be idle.
    pub fn is_priority(&self) -> bool {
        matches!(
            self.command_type,
            TopicCommandType::Heartbeat
                | TopicCommandType::WatchdogReattach
                | TopicCommandType::ChangeRebootState
        )
    }
}

/// The structured part of a topic reply.
#[derive(Debug, Clone, Default, PartialEq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TopicResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub command_response: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_commands: Option<Vec<CustomCommand>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub missing_chunks: Option<Vec<u32>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunk: Option<ChunkData>,
}

impl TopicResponse {
    pub fn is_error(&self) -> bool {
        self.error_message.is_some()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatCommand {
    pub name: String,
    #[serde(default)]
    pub arguments: String,
    pub sender: String,
    #[serde(default)]
    pub channel_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventNotification {
    pub event_type: String,
    #[serde(default)]
    pub parameters: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn optional_fields_are_omitted() {
        let mut p = TopicParameters::change_reboot_state(RebootState::Shutdown);
        p.access_identifier = "tok".to_string();
        let json = serde_json::to_string(&p).unwrap();
        assert_eq!(
            json,
            r#"{"commandType":"changeRebootState","accessIdentifier":"tok","newRebootState":"shutdown"}"#
        );
    }

    #[test]
    fn response_tolerates_unknown_fields() {
        let r: TopicResponse =
            serde_json::from_str(r#"{"commandResponse":"pong","extra":1}"#).unwrap();
        assert_eq!(r.command_response.as_deref(), Some("pong"));
        assert!(!r.is_error());
    }
}
