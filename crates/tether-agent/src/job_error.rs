pub const PREFIX: &str = "TETHER_ERROR_JSON:";

const MAX_MESSAGE_BYTES: usize = 32 * 1024;
const MAX_HINT_BYTES: usize = 8 * 1024;

/// Stable codes surfaced to the job layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    NoActiveEngine,
    EngineVersionNotInstalled,
    EngineInstallFailed,
    CannotDeleteActiveEngine,
    EngineTrustFailed,
    ReattachProcessMissing,
    ChunkingUnsupported,
    SessionLaunchFailed,
}

/// An operational failure a human can act on.
#[derive(Debug, Clone, thiserror::Error, serde::Serialize)]
#[error("{message}")]
pub struct JobError {
    pub code: ErrorCode,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
}

fn truncate_utf8(s: &str, max_bytes: usize) -> String {
    if s.len() <= max_bytes {
        return s.to_string();
    }

    let suffix = "…(truncated)";
    let keep = max_bytes.saturating_sub(suffix.len()).max(1);
    let mut end = keep.min(s.len());
    while end > 0 && !s.is_char_boundary(end) {
        end = end.saturating_sub(1);
    }
    let mut out = s[..end].to_string();
    out.push_str(suffix);
    out
}

impl JobError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            hint: None,
        }
    }

    pub fn with_hint(mut self, hint: impl Into<String>) -> Self {
        self.hint = Some(hint.into());
        self
    }

    /// `PREFIX` + JSON, with message and hint bounded in size.
    pub fn encode(&self) -> String {
        let payload = JobError {
            code: self.code,
            message: truncate_utf8(&self.message, MAX_MESSAGE_BYTES),
            hint: self.hint.as_deref().map(|h| truncate_utf8(h, MAX_HINT_BYTES)),
        };
        let json = serde_json::to_string(&payload).unwrap_or_else(|_| {
            "{\"code\":\"internal\",\"message\":\"serialize_failed\"}".to_string()
        });
        format!("{PREFIX}{json}")
    }
}

pub fn anyhow(code: ErrorCode, message: impl Into<String>, hint: Option<&str>) -> anyhow::Error {
    let mut err = JobError::new(code, message);
    if let Some(hint) = hint {
        err = err.with_hint(hint);
    }
    anyhow::Error::new(err)
}

/// Finds the job error anywhere in an error chain.
pub fn find(err: &anyhow::Error) -> Option<&JobError> {
    err.chain().find_map(|e| e.downcast_ref::<JobError>())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_truncates_message_and_hint() {
        let err = JobError::new(ErrorCode::EngineInstallFailed, "a".repeat(MAX_MESSAGE_BYTES + 1024))
            .with_hint("c".repeat(MAX_HINT_BYTES + 1024));
        let s = err.encode();
        assert!(s.starts_with(PREFIX));

        let v: serde_json::Value = serde_json::from_str(&s[PREFIX.len()..]).unwrap();
        assert_eq!(v["code"], "engine_install_failed");
        let msg = v["message"].as_str().unwrap();
        assert!(msg.len() <= MAX_MESSAGE_BYTES);
        assert!(msg.ends_with("…(truncated)"));
        let hint = v["hint"].as_str().unwrap();
        assert!(hint.len() <= MAX_HINT_BYTES);
    }

    #[test]
    fn find_survives_context_layers() {
        let err = anyhow(ErrorCode::CannotDeleteActiveEngine, "in use", None)
            .context("delete engine version");
        let found = find(&err).expect("job error in chain");
        assert_eq!(found.code, ErrorCode::CannotDeleteActiveEngine);
        assert!(found.hint.is_none());
    }
}
