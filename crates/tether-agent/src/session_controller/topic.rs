use std::{sync::atomic::Ordering, time::Duration};

use tether_interop::{
    ChunkData, ChunkRequest, INTEROP_VERSION, InteropVersion, MAX_TOPIC_REQUEST_LENGTH,
    TopicParameters, TopicResponse,
};
use tokio_util::sync::CancellationToken;

use super::{LifecycleState, SessionError, SessionInner, lock};
use crate::{
    chunking::{self, ChunkAssembler, ChunkProgress},
    job_error::{ErrorCode, JobError},
    topic_client::{build_topic_query, parse_topic_response},
};

/// Rounds of re-requesting or re-sending missing chunks before giving up.
const MAX_CHUNK_ROUNDS: usize = 3;

#[derive(Debug, Clone, Copy, Default)]
pub struct SendOptions {
    /// Send even while the process is starting up or rebooting.
    pub bypass_lifecycle: bool,
}

/// Where and how to reach the process for one exchange.
struct Route<'a> {
    access_identifier: &'a str,
    port: u16,
    priority: bool,
    timeout: Duration,
}

impl SessionInner {
    pub(super) async fn send_command(
        &self,
        mut params: TopicParameters,
        options: SendOptions,
        cancel: &CancellationToken,
    ) -> Result<Option<TopicResponse>, SessionError> {
        if self.shutdown.is_cancelled() {
            return Ok(None);
        }
        let (access_identifier, port, interop, timeout) = {
            let info = lock(&self.reattach);
            (
                info.access_identifier.clone(),
                info.topic_target_port(),
                info.interop_version,
                Duration::from_millis(info.topic_request_timeout_ms),
            )
        };
        let Some(interop) = interop.filter(|v| v.is_compatible_with(&INTEROP_VERSION)) else {
            tracing::debug!(command = ?params.command_type, "no compatible interop, topic skipped");
            return Ok(None);
        };
        if !options.bypass_lifecycle && *self.lifecycle.borrow() != LifecycleState::Running {
            tracing::debug!(command = ?params.command_type, "session not running, topic skipped");
            return Ok(None);
        }

        params.access_identifier = access_identifier.clone();
        let query = build_topic_query(&params)?;
        let route = Route {
            access_identifier: &access_identifier,
            port,
            priority: params.is_priority(),
            timeout,
        };

        let mut reboot = self.reboot.listener();
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(SessionError::Cancelled),
            _ = self.shutdown.cancelled() => Ok(None),
            _ = reboot.wait() => {
                tracing::debug!(command = ?params.command_type, "topic superseded by reboot");
                Ok(None)
            }
            res = self.exchange(&route, interop, &params, &query) => res,
        }
    }

    /// One request/response under the topic lock, chunking in either direction.
    async fn exchange(
        &self,
        route: &Route<'_>,
        interop: InteropVersion,
        params: &TopicParameters,
        query: &str,
    ) -> Result<Option<TopicResponse>, SessionError> {
        let _guard = self.topic_lock.lock().await;
        let raw = if query.len() <= MAX_TOPIC_REQUEST_LENGTH {
            self.transport
                .send(route.port, query, route.priority, route.timeout)
                .await
        } else {
            let json = serde_json::to_string(params).map_err(anyhow::Error::from)?;
            self.send_chunked_request(route, interop, &json).await?
        };
        let Some(response) = raw.as_deref().and_then(parse_topic_response) else {
            return Ok(None);
        };
        match response.chunk {
            Some(first) => self.receive_chunked_response(route, first).await,
            None => Ok(Some(response)),
        }
    }

    /// Sends `json` as a series of `SendChunk` topics and returns the reply to the last
    /// one. Chunks the process reports missing are re-sent on their own.
    async fn send_chunked_request(
        &self,
        route: &Route<'_>,
        interop: InteropVersion,
        json: &str,
    ) -> Result<Option<String>, SessionError> {
        if !interop.supports_chunking() {
            return Err(JobError::new(
                ErrorCode::ChunkingUnsupported,
                format!(
                    "topic request of {} bytes needs chunking, which interop {interop} does not support",
                    json.len()
                ),
            )
            .with_hint("update the game's interop library")
            .into());
        }

        let payload_id = self.next_payload_id.fetch_add(1, Ordering::Relaxed);
        let frames = chunking::split(json, MAX_TOPIC_REQUEST_LENGTH, payload_id, |chunk| {
            build_topic_query(&TopicParameters::send_chunk(
                route.access_identifier,
                chunk.clone(),
            ))
        })?;
        tracing::debug!(payload_id, chunks = frames.len(), "sending chunked topic");

        let mut pending: Vec<usize> = (0..frames.len()).collect();
        for _ in 0..MAX_CHUNK_ROUNDS {
            let mut last = None;
            for &i in &pending {
                last = self
                    .transport
                    .send(route.port, &frames[i].encoded, route.priority, route.timeout)
                    .await;
            }
            let Some(raw) = last else {
                return Ok(None);
            };
            let missing = parse_topic_response(&raw)
                .and_then(|r| r.missing_chunks)
                .unwrap_or_default();
            if missing.is_empty() {
                return Ok(Some(raw));
            }
            tracing::debug!(payload_id, ?missing, "process missed chunks, resending");
            pending = missing
                .into_iter()
                .filter_map(|seq| usize::try_from(seq).ok())
                .filter(|&i| i < frames.len())
                .collect();
            if pending.is_empty() {
                return Ok(Some(raw));
            }
        }
        tracing::warn!(payload_id, "gave up resending chunked topic");
        Ok(None)
    }

    /// The process answered with the first chunk of a large response; pull the rest.
    async fn receive_chunked_response(
        &self,
        route: &Route<'_>,
        first: ChunkData,
    ) -> Result<Option<TopicResponse>, SessionError> {
        let payload_id = first.payload_id;
        let mut assembler = ChunkAssembler::default();
        match assembler.accept(first) {
            Ok(ChunkProgress::Complete(json)) => return Ok(parse_topic_response(&json)),
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(error = %e, "bad first chunk in topic response");
                return Ok(None);
            }
        }

        for _ in 0..MAX_CHUNK_ROUNDS {
            let missing = assembler.missing(payload_id).unwrap_or_default();
            for sequence_id in missing {
                let query = build_topic_query(&TopicParameters::receive_chunk(
                    route.access_identifier,
                    ChunkRequest {
                        payload_id,
                        sequence_id,
                    },
                ))?;
                let chunk = self
                    .transport
                    .send(route.port, &query, route.priority, route.timeout)
                    .await
                    .as_deref()
                    .and_then(parse_topic_response)
                    .and_then(|r| r.chunk);
                let Some(chunk) = chunk.filter(|c| c.payload_id == payload_id) else {
                    continue;
                };
                match assembler.accept(chunk) {
                    Ok(ChunkProgress::Complete(json)) => return Ok(parse_topic_response(&json)),
                    Ok(_) => {}
                    Err(e) => {
                        tracing::warn!(error = %e, "bad chunk in topic response");
                        return Ok(None);
                    }
                }
            }
        }
        tracing::warn!(payload_id, "gave up receiving chunked topic response");
        Ok(None)
    }
}

#[cfg(all(test, unix))]
mod tests {
    use tether_interop::{EventNotification, InteropVersion, MAX_TOPIC_RESPONSE_LENGTH};

    use super::*;
    use crate::{
        job_error::ErrorCode,
        session_controller::test_support::{FakeTransport, FixtureOptions, fixture},
    };

    fn big_event(len: usize) -> TopicParameters {
        TopicParameters::event_notification(EventNotification {
            event_type: "deploy".to_string(),
            parameters: vec!["x".repeat(len)],
        })
    }

    #[tokio::test]
    async fn concurrent_sends_are_never_interleaved() {
        let mut transport = FakeTransport::ok();
        transport.delay = Duration::from_millis(5);
        let f = fixture(FixtureOptions {
            transport,
            ..Default::default()
        });

        let cancel = CancellationToken::new();
        let mut tasks = Vec::new();
        for _ in 0..10 {
            let session = f.session.clone();
            let cancel = cancel.clone();
            tasks.push(tokio::spawn(async move {
                session
                    .send_command(TopicParameters::heartbeat(), &cancel)
                    .await
            }));
        }
        for t in tasks {
            assert!(t.await.unwrap().unwrap().is_some());
        }
        assert_eq!(f.transport.sent().len(), 10);
        assert!(!f.transport.overlapped.load(Ordering::SeqCst));
        f.session.dispose().await;
    }

    #[tokio::test]
    async fn sends_wait_for_running_unless_bypassed() {
        let f = fixture(FixtureOptions {
            state: LifecycleState::AwaitingHandshake,
            ..Default::default()
        });
        let cancel = CancellationToken::new();
        let resp = f
            .session
            .send_command(TopicParameters::instance_renamed("x"), &cancel)
            .await
            .unwrap();
        assert!(resp.is_none());
        assert!(f.transport.sent().is_empty());

        assert!(f.session.heartbeat(&cancel).await.unwrap());
        let sent = FakeTransport::decode(&f.transport.sent()[0]);
        assert_eq!(sent["commandType"], "heartbeat");
        assert_eq!(sent["accessIdentifier"], "session-token");
        f.session.dispose().await;
    }

    #[tokio::test]
    async fn incompatible_interop_skips_io() {
        let f = fixture(FixtureOptions {
            interop: Some(InteropVersion::new(4, 0, 0)),
            ..Default::default()
        });
        let cancel = CancellationToken::new();
        assert!(!f.session.heartbeat(&cancel).await.unwrap());
        assert!(f.transport.sent().is_empty());
        f.session.dispose().await;
    }

    #[tokio::test]
    async fn large_requests_are_sent_in_chunks() {
        let transport = FakeTransport::new(|query| {
            let v = FakeTransport::decode(query);
            let chunk = &v["chunk"];
            let last = chunk["sequenceId"].as_u64() == chunk["totalChunks"].as_u64().map(|t| t - 1);
            last.then(|| r#"{"commandResponse":"got it"}"#.to_string())
        });
        let f = fixture(FixtureOptions {
            transport,
            ..Default::default()
        });
        let cancel = CancellationToken::new();
        let resp = f
            .session
            .send_command(big_event(150_000), &cancel)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(resp.command_response.as_deref(), Some("got it"));

        let sent = f.transport.sent();
        assert!(sent.len() >= 3);
        let mut payload = String::new();
        for q in &sent {
            assert!(q.len() <= MAX_TOPIC_REQUEST_LENGTH);
            let v = FakeTransport::decode(q);
            assert_eq!(v["commandType"], "sendChunk");
            payload.push_str(v["chunk"]["payload"].as_str().unwrap());
        }
        let original: TopicParameters = serde_json::from_str(&payload).unwrap();
        assert_eq!(original.access_identifier, "session-token");
        f.session.dispose().await;
    }

    #[tokio::test]
    async fn only_missing_chunks_are_resent() {
        let f = fixture(FixtureOptions::default());
        // The final chunk's reply reports chunk 0 missing; the resend completes it.
        {
            let mut scripted = f.transport.scripted.lock().unwrap();
            scripted.push_back(None);
            scripted.push_back(None);
            scripted.push_back(Some(r#"{"missingChunks":[0]}"#.to_string()));
            scripted.push_back(Some(r#"{"commandResponse":"done"}"#.to_string()));
        }
        let cancel = CancellationToken::new();
        let resp = f
            .session
            .send_command(big_event(150_000), &cancel)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(resp.command_response.as_deref(), Some("done"));

        let sent = f.transport.sent();
        assert_eq!(sent.len(), 4, "three chunks then one resend");
        let resent = FakeTransport::decode(&sent[3]);
        assert_eq!(resent["chunk"]["sequenceId"], 0);
        f.session.dispose().await;
    }

    #[tokio::test]
    async fn old_interop_cannot_chunk() {
        let f = fixture(FixtureOptions {
            interop: Some(InteropVersion::new(5, 5, 0)),
            ..Default::default()
        });
        let cancel = CancellationToken::new();
        let err = f
            .session
            .send_command(big_event(100_000), &cancel)
            .await
            .unwrap_err();
        match err {
            SessionError::Job(job) => assert_eq!(job.code, ErrorCode::ChunkingUnsupported),
            other => panic!("unexpected error: {other}"),
        }
        assert!(f.transport.sent().is_empty());
        f.session.dispose().await;
    }

    #[tokio::test]
    async fn chunked_responses_are_pulled_and_assembled() {
        let body = serde_json::to_string(&TopicResponse {
            command_response: Some("y".repeat(MAX_TOPIC_RESPONSE_LENGTH * 2)),
            ..Default::default()
        })
        .unwrap();
        let third = body.len() / 3;
        let parts = [
            body[..third].to_string(),
            body[third..2 * third].to_string(),
            body[2 * third..].to_string(),
        ];
        let chunk_reply = move |seq: usize| {
            serde_json::to_string(&TopicResponse {
                chunk: Some(ChunkData {
                    payload_id: 9,
                    sequence_id: seq as u32,
                    total_chunks: 3,
                    payload: parts[seq].clone(),
                }),
                ..Default::default()
            })
            .unwrap()
        };
        let transport = FakeTransport::new(move |query| {
            let v = FakeTransport::decode(query);
            match v["commandType"].as_str() {
                Some("receiveChunk") => {
                    let seq = v["chunkRequest"]["sequenceId"].as_u64().unwrap() as usize;
                    Some(chunk_reply(seq))
                }
                _ => Some(chunk_reply(0)),
            }
        });
        let f = fixture(FixtureOptions {
            transport,
            ..Default::default()
        });

        let cancel = CancellationToken::new();
        let resp = f
            .session
            .send_command(TopicParameters::instance_renamed("big"), &cancel)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            resp.command_response.map(|s| s.len()),
            Some(MAX_TOPIC_RESPONSE_LENGTH * 2)
        );
        let kinds: Vec<String> = f
            .transport
            .sent()
            .iter()
            .map(|q| FakeTransport::decode(q)["commandType"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(kinds, ["instanceRenamed", "receiveChunk", "receiveChunk"]);
        f.session.dispose().await;
    }

    #[tokio::test]
    async fn process_exit_resolves_in_flight_send() {
        let mut transport = FakeTransport::ok();
        transport.hang = true;
        let f = fixture(FixtureOptions {
            transport,
            ..Default::default()
        });
        let session = f.session.clone();
        let task = tokio::spawn(async move {
            let cancel = CancellationToken::new();
            session
                .send_command(TopicParameters::heartbeat(), &cancel)
                .await
        });
        while f.transport.sent().is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        f.session.terminate().await;
        let res = tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
        assert!(res.unwrap().is_none());
        f.session.dispose().await;
    }

    #[tokio::test]
    async fn cancellation_is_an_error() {
        let mut transport = FakeTransport::ok();
        transport.hang = true;
        let f = fixture(FixtureOptions {
            transport,
            ..Default::default()
        });
        let cancel = CancellationToken::new();
        let task = {
            let session = f.session.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                session
                    .send_command(TopicParameters::heartbeat(), &cancel)
                    .await
            })
        };
        while f.transport.sent().is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        cancel.cancel();
        let res = task.await.unwrap();
        assert!(matches!(res, Err(SessionError::Cancelled)));
        f.session.dispose().await;
    }

    #[tokio::test]
    async fn waiting_sends_keep_their_order() {
        let mut transport = FakeTransport::ok();
        transport.delay = Duration::from_millis(20);
        let f = fixture(FixtureOptions {
            transport,
            ..Default::default()
        });
        let cancel = CancellationToken::new();
        let mut tasks = Vec::new();
        for i in 0..5 {
            let session = f.session.clone();
            let cancel = cancel.clone();
            tasks.push(tokio::spawn(async move {
                session
                    .send_command(TopicParameters::instance_renamed(format!("n{i}")), &cancel)
                    .await
            }));
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        for t in tasks {
            t.await.unwrap().unwrap();
        }
        let names: Vec<String> = f
            .transport
            .sent()
            .iter()
            .map(|q| FakeTransport::decode(q)["newInstanceName"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(names, ["n0", "n1", "n2", "n3", "n4"]);
        f.session.dispose().await;
    }
}
