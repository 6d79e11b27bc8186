/// One fragment of a payload too large for a single frame.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkData {
    pub payload_id: u32,
    pub sequence_id: u32,
    pub total_chunks: u32,
    pub payload: String,
}

/// Asks the engine process for one fragment of a chunked reply it is holding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChunkRequest {
    pub payload_id: u32,
    pub sequence_id: u32,
}
