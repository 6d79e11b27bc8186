use std::{net::IpAddr, time::Duration};

use anyhow::Context;
use tether_interop::{MAX_TOPIC_REQUEST_LENGTH, TOPIC_JSON_KEY, TopicParameters, TopicResponse};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
};

const PACKET_MAGIC: [u8; 2] = [0x00, 0x83];
const REPLY_STRING: u8 = 0x06;
const REPLY_FLOAT: u8 = 0x2a;
const REPLY_NULL: u8 = 0x00;

/// One-shot request/response channel to an engine process.
///
/// Returns `None` for every transport failure; callers treat that as "no reply".
#[async_trait::async_trait]
pub trait TopicTransport: Send + Sync {
    async fn send(&self, port: u16, query: &str, priority: bool, timeout: Duration)
    -> Option<String>;
}

/// `?tether_json=<urlencoded json>`
pub fn build_topic_query(params: &TopicParameters) -> anyhow::Result<String> {
    let json = serde_json::to_string(params).context("serialize topic parameters")?;
    Ok(format!("?{TOPIC_JSON_KEY}={}", urlencoding::encode(&json)))
}

/// Empty or malformed reply text is not a structured reply.
pub fn parse_topic_response(raw: &str) -> Option<TopicResponse> {
    let trimmed = raw.trim_end_matches('\0').trim();
    if trimmed.is_empty() {
        return None;
    }
    serde_json::from_str(trimmed).ok()
}

pub fn encode_topic_packet(query: &str) -> anyhow::Result<Vec<u8>> {
    if query.len() > MAX_TOPIC_REQUEST_LENGTH {
        anyhow::bail!(
            "topic query of {} bytes exceeds {MAX_TOPIC_REQUEST_LENGTH}",
            query.len()
        );
    }
    // 5 padding bytes + query + terminating NUL.
    let body_len = (query.len() + 6) as u16;
    let mut buf = Vec::with_capacity(4 + body_len as usize);
    buf.extend_from_slice(&PACKET_MAGIC);
    buf.extend_from_slice(&body_len.to_be_bytes());
    buf.extend_from_slice(&[0u8; 5]);
    buf.extend_from_slice(query.as_bytes());
    buf.push(0);
    Ok(buf)
}

/// Decodes a reply body (everything after the 4 byte header).
pub fn decode_topic_reply(body: &[u8]) -> anyhow::Result<String> {
    let Some((&kind, data)) = body.split_first() else {
        anyhow::bail!("empty topic reply");
    };
    match kind {
        REPLY_STRING => {
            let end = data.iter().position(|b| *b == 0).unwrap_or(data.len());
            Ok(String::from_utf8_lossy(&data[..end]).into_owned())
        }
        REPLY_FLOAT => {
            let bytes: [u8; 4] = data
                .get(..4)
                .and_then(|b| b.try_into().ok())
                .context("truncated float topic reply")?;
            Ok(f32::from_le_bytes(bytes).to_string())
        }
        REPLY_NULL => Ok(String::new()),
        other => anyhow::bail!("unknown topic reply type 0x{other:02x}"),
    }
}

#[derive(Debug, Clone)]
pub struct TcpTopicClient {
    host: IpAddr,
    priority_attempts: u32,
}

impl TcpTopicClient {
    pub fn new(host: IpAddr, priority_attempts: u32) -> Self {
        Self {
            host,
            priority_attempts: priority_attempts.max(1),
        }
    }

    pub fn localhost(priority_attempts: u32) -> Self {
        Self::new(IpAddr::from([127, 0, 0, 1]), priority_attempts)
    }

    async fn send_once(&self, port: u16, packet: &[u8]) -> anyhow::Result<String> {
        let mut stream = TcpStream::connect((self.host, port))
            .await
            .with_context(|| format!("connect topic port {port}"))?;
        stream.write_all(packet).await.context("write topic packet")?;

        let mut header = [0u8; 4];
        stream
            .read_exact(&mut header)
            .await
            .context("read topic reply header")?;
        if header[..2] != PACKET_MAGIC {
            anyhow::bail!("bad topic reply magic {:02x?}", &header[..2]);
        }
        let len = u16::from_be_bytes([header[2], header[3]]) as usize;
        let mut body = vec![0u8; len];
        stream
            .read_exact(&mut body)
            .await
            .context("read topic reply body")?;
        decode_topic_reply(&body)
    }
}

#[async_trait::async_trait]
impl TopicTransport for TcpTopicClient {
    async fn send(
        &self,
        port: u16,
        query: &str,
        priority: bool,
        timeout: Duration,
    ) -> Option<String> {
        let packet = match encode_topic_packet(query) {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(port, error = %e, "refusing to send topic");
                return None;
            }
        };

        let attempts = if priority { self.priority_attempts } else { 1 };
        for attempt in 1..=attempts {
            let res = tokio::time::timeout(timeout, self.send_once(port, &packet)).await;
            match res {
                Ok(Ok(reply)) => return Some(reply),
                Ok(Err(e)) => {
                    tracing::debug!(port, attempt, error = %e, "topic request failed");
                }
                Err(_) => {
                    tracing::debug!(port, attempt, timeout_ms = timeout.as_millis() as u64, "topic request timed out");
                }
            }
            if attempt < attempts {
                tokio::time::sleep(Duration::from_millis(
                    200_u64.saturating_mul(2_u64.pow(attempt - 1)),
                ))
                .await;
            }
        }
        None
    }
}
