use std::{
    collections::HashMap,
    sync::{Arc, RwLock, Weak},
};

use axum::{
    Json, Router,
    extract::{Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use tether_interop::{BRIDGE_DATA_KEY, BridgeParameters, BridgeResponse, MAX_BRIDGE_REQUEST_LENGTH};

pub const BRIDGE_PATH: &str = "/bridge";

/// Receives requests an engine process makes of its supervisor.
#[async_trait::async_trait]
pub trait BridgeHandler: Send + Sync {
    /// `None` means "nothing to answer", e.g. an intermediate chunk.
    async fn process_bridge_request(&self, params: BridgeParameters) -> Option<BridgeResponse>;
}

/// Routes bridge requests to sessions by access identifier. Sessions are held weakly;
/// a dropped session simply stops resolving.
#[derive(Clone, Default)]
pub struct BridgeRegistry {
    inner: Arc<RwLock<HashMap<String, Weak<dyn BridgeHandler>>>>,
}

impl BridgeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &self,
        access_identifier: &str,
        handler: Weak<dyn BridgeHandler>,
    ) -> BridgeRegistration {
        self.inner
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(access_identifier.to_string(), handler);
        BridgeRegistration {
            registry: self.clone(),
            access_identifier: access_identifier.to_string(),
        }
    }

    pub fn lookup(&self, access_identifier: &str) -> Option<Arc<dyn BridgeHandler>> {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(access_identifier)
            .and_then(Weak::upgrade)
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn remove(&self, access_identifier: &str) {
        self.inner
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .remove(access_identifier);
    }
}

/// Removes its registry entry when dropped.
pub struct BridgeRegistration {
    registry: BridgeRegistry,
    access_identifier: String,
}

impl std::fmt::Debug for BridgeRegistration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BridgeRegistration").finish_non_exhaustive()
    }
}

impl Drop for BridgeRegistration {
    fn drop(&mut self) {
        self.registry.remove(&self.access_identifier);
    }
}

pub fn router(registry: BridgeRegistry) -> Router {
    Router::new()
        .route(BRIDGE_PATH, get(handle_bridge))
        .with_state(registry)
}

fn bridge_error(code: StatusCode, message: impl Into<String>) -> Response {
    (code, Json(BridgeResponse::error(message))).into_response()
}

async fn handle_bridge(
    State(registry): State<BridgeRegistry>,
    Query(query): Query<HashMap<String, String>>,
) -> Response {
    let Some(data) = query.get(BRIDGE_DATA_KEY) else {
        return bridge_error(StatusCode::BAD_REQUEST, "missing data parameter");
    };
    if data.len() > MAX_BRIDGE_REQUEST_LENGTH {
        return bridge_error(
            StatusCode::BAD_REQUEST,
            format!("bridge request exceeds {MAX_BRIDGE_REQUEST_LENGTH} bytes"),
        );
    }

    let params: BridgeParameters = match serde_json::from_str(data) {
        Ok(p) => p,
        Err(e) => {
            tracing::debug!(error = %e, "malformed bridge request");
            return bridge_error(StatusCode::BAD_REQUEST, format!("malformed bridge request: {e}"));
        }
    };

    let Some(access_identifier) = params.access_identifier.as_deref() else {
        return bridge_error(StatusCode::BAD_REQUEST, "missing accessIdentifier");
    };
    let Some(handler) = registry.lookup(access_identifier) else {
        tracing::debug!("bridge request for unknown access identifier");
        return bridge_error(StatusCode::UNAUTHORIZED, "unknown access identifier");
    };

    match handler.process_bridge_request(params).await {
        Some(resp) => (StatusCode::OK, Json(resp)).into_response(),
        None => StatusCode::OK.into_response(),
    }
}

#[cfg(test)]
mod tests {
    use tether_interop::BridgeCommandType;

    use super::*;

    struct Echo;

    #[async_trait::async_trait]
    impl BridgeHandler for Echo {
        async fn process_bridge_request(&self, params: BridgeParameters) -> Option<BridgeResponse> {
            match params.command_type {
                BridgeCommandType::Chunk => None,
                _ => Some(BridgeResponse::ok()),
            }
        }
    }

    async fn serve(registry: BridgeRegistry) -> String {
        let listener = tokio::net::TcpListener::bind(("127.0.0.1", 0)).await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router(registry)).await.ok();
        });
        format!("http://{addr}{BRIDGE_PATH}")
    }

    async fn call(url: &str, json: &str) -> (u16, String) {
        let full = format!("{url}?{BRIDGE_DATA_KEY}={}", urlencoding::encode(json));
        let resp = reqwest::get(full).await.unwrap();
        let status = resp.status().as_u16();
        (status, resp.text().await.unwrap())
    }

    #[tokio::test]
    async fn requests_route_by_access_identifier() {
        let registry = BridgeRegistry::new();
        let handler: Arc<dyn BridgeHandler> = Arc::new(Echo);
        let _registration = registry.register("token-1", Arc::downgrade(&handler));
        let url = serve(registry.clone()).await;

        let (status, body) = call(&url, r#"{"commandType":"prime","accessIdentifier":"token-1"}"#).await;
        assert_eq!(status, 200);
        let resp: BridgeResponse = serde_json::from_str(&body).unwrap();
        assert!(!resp.is_error());

        let (status, body) = call(&url, r#"{"commandType":"chunk","accessIdentifier":"token-1"}"#).await;
        assert_eq!(status, 200);
        assert!(body.is_empty());

        let (status, _) = call(&url, r#"{"commandType":"prime","accessIdentifier":"nope"}"#).await;
        assert_eq!(status, 401);

        let (status, body) = call(&url, "{not json").await;
        assert_eq!(status, 400);
        let resp: BridgeResponse = serde_json::from_str(&body).unwrap();
        assert!(resp.is_error());
    }

    #[test]
    fn registration_drop_unregisters() {
        let registry = BridgeRegistry::new();
        let handler: Arc<dyn BridgeHandler> = Arc::new(Echo);
        let registration = registry.register("t", Arc::downgrade(&handler));
        assert!(registry.lookup("t").is_some());
        drop(registration);
        assert!(registry.lookup("t").is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn dropped_handlers_stop_resolving() {
        let registry = BridgeRegistry::new();
        let handler: Arc<dyn BridgeHandler> = Arc::new(Echo);
        let _registration = registry.register("t", Arc::downgrade(&handler));
        drop(handler);
        assert!(registry.lookup("t").is_none());
    }
}
