use std::collections::{HashMap, VecDeque};

use tether_interop::ChunkData;

/// Upper bound on fragments per payload, for both directions.
pub const MAX_CHUNKS_PER_PAYLOAD: u32 = 4096;

/// Incomplete payloads kept at once; starting another drops the oldest.
pub const MAX_PENDING_PAYLOADS: usize = 16;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ChunkError {
    #[error("payload cannot be split into frames of at most {max_len} bytes")]
    Unsplittable { max_len: usize },
    #[error("chunk {sequence_id} is out of range for a payload of {total_chunks} chunks")]
    OutOfRange { sequence_id: u32, total_chunks: u32 },
    #[error("payload {payload_id} was announced with {expected} chunks, got a chunk claiming {got}")]
    TotalMismatch {
        payload_id: u32,
        expected: u32,
        got: u32,
    },
    #[error("payload of {0} chunks exceeds the chunk limit")]
    TooManyChunks(u32),
}

/// A chunk together with its fully encoded transport form.
#[derive(Debug, Clone)]
pub struct Frame {
    pub chunk: ChunkData,
    pub encoded: String,
}

// Byte ranges for `count` pieces: equal sizes, remainder in the last piece. A cut
// inside a code point moves back to the previous char boundary.
fn boundaries(message: &str, count: usize) -> Vec<(usize, usize)> {
    let standard = message.len() / count;
    let mut out = Vec::with_capacity(count);
    let mut start = 0;
    for _ in 0..count - 1 {
        let mut end = (start + standard).min(message.len());
        while end > start && !message.is_char_boundary(end) {
            end -= 1;
        }
        out.push((start, end));
        start = end;
    }
    out.push((start, message.len()));
    out
}

/// Splits `message` into frames whose encoded form (as produced by `encode`) is at
/// most `max_len` bytes each.
///
/// The chunk count starts at 2 and grows until every frame fits. Encoding expansion
/// (URL escaping) is not linear in the payload length, so each candidate split is
/// re-encoded and measured. Worst case is quadratic in the message length.
pub fn split<E>(
    message: &str,
    max_len: usize,
    payload_id: u32,
    mut encode: E,
) -> anyhow::Result<Vec<Frame>>
where
    E: FnMut(&ChunkData) -> anyhow::Result<String>,
{
    if message.is_empty() {
        let chunk = ChunkData {
            payload_id,
            sequence_id: 0,
            total_chunks: 1,
            payload: String::new(),
        };
        let encoded = encode(&chunk)?;
        if encoded.len() > max_len {
            return Err(ChunkError::Unsplittable { max_len }.into());
        }
        return Ok(vec![Frame { chunk, encoded }]);
    }

    let max_count = message
        .chars()
        .count()
        .min(MAX_CHUNKS_PER_PAYLOAD as usize);
    let mut count = 2usize;
    loop {
        if count > max_count {
            return Err(ChunkError::Unsplittable { max_len }.into());
        }

        let mut frames = Vec::with_capacity(count);
        let mut fits = true;
        for (sequence_id, (start, end)) in boundaries(message, count).into_iter().enumerate() {
            let chunk = ChunkData {
                payload_id,
                sequence_id: sequence_id as u32,
                total_chunks: count as u32,
                payload: message[start..end].to_string(),
            };
            let encoded = encode(&chunk)?;
            if encoded.len() > max_len {
                fits = false;
                break;
            }
            frames.push(Frame { chunk, encoded });
        }

        if fits {
            return Ok(frames);
        }
        count += 1;
    }
}

/// Concatenates chunk payloads in sequence order.
pub fn reassemble(chunks: &[ChunkData]) -> String {
    let mut ordered: Vec<&ChunkData> = chunks.iter().collect();
    ordered.sort_by_key(|c| c.sequence_id);
    ordered.into_iter().map(|c| c.payload.as_str()).collect()
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChunkProgress {
    /// More fragments are expected.
    Pending,
    /// The final fragment arrived but these sequence ids never did.
    Missing(Vec<u32>),
    Complete(String),
}

#[derive(Debug, Default)]
pub struct ChunkAssembler {
    partial: HashMap<u32, Vec<Option<String>>>,
    /// Payload ids by arrival of their first fragment.
    order: VecDeque<u32>,
}

fn missing_of(parts: &[Option<String>]) -> Vec<u32> {
    parts
        .iter()
        .enumerate()
        .filter(|(_, p)| p.is_none())
        .map(|(i, _)| i as u32)
        .collect()
}

impl ChunkAssembler {
    pub fn accept(&mut self, chunk: ChunkData) -> Result<ChunkProgress, ChunkError> {
        let ChunkData {
            payload_id,
            sequence_id,
            total_chunks,
            payload,
        } = chunk;

        if total_chunks == 0 || sequence_id >= total_chunks {
            return Err(ChunkError::OutOfRange {
                sequence_id,
                total_chunks,
            });
        }
        if total_chunks > MAX_CHUNKS_PER_PAYLOAD {
            return Err(ChunkError::TooManyChunks(total_chunks));
        }

        if !self.partial.contains_key(&payload_id) {
            while self.partial.len() >= MAX_PENDING_PAYLOADS {
                let Some(oldest) = self.order.pop_front() else {
                    break;
                };
                if self.partial.remove(&oldest).is_some() {
                    tracing::debug!(payload_id = oldest, "abandoned chunked payload dropped");
                }
            }
            self.order.push_back(payload_id);
        }
        let parts = self
            .partial
            .entry(payload_id)
            .or_insert_with(|| vec![None; total_chunks as usize]);
        if parts.len() != total_chunks as usize {
            return Err(ChunkError::TotalMismatch {
                payload_id,
                expected: parts.len() as u32,
                got: total_chunks,
            });
        }
        parts[sequence_id as usize] = Some(payload);

        let missing = missing_of(parts);
        if missing.is_empty() {
            let parts = self.partial.remove(&payload_id).unwrap_or_default();
            self.order.retain(|&id| id != payload_id);
            return Ok(ChunkProgress::Complete(parts.into_iter().flatten().collect()));
        }
        if sequence_id == total_chunks - 1 {
            Ok(ChunkProgress::Missing(missing))
        } else {
            Ok(ChunkProgress::Pending)
        }
    }

    pub fn missing(&self, payload_id: u32) -> Option<Vec<u32>> {
        self.partial.get(&payload_id).map(|parts| missing_of(parts))
    }

    pub fn discard(&mut self, payload_id: u32) {
        self.partial.remove(&payload_id);
        self.order.retain(|&id| id != payload_id);
    }

    /// Drops every incomplete payload, e.g. when the sender restarted.
    pub fn clear(&mut self) {
        self.partial.clear();
        self.order.clear();
    }

    pub fn pending_payloads(&self) -> usize {
        self.partial.len()
    }
}
