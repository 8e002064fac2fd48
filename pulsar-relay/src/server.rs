//! HTTP surface: the `/ws` push endpoint and a small demo page at `/`.

use std::sync::Arc;

use axum::{
    Router,
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::{HeaderMap, StatusCode, header::ORIGIN},
    response::{Html, IntoResponse, Response},
    routing::get,
};
use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use tokio::select;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::hub::HubHandle;

/// Which browser origins may open the push channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OriginPolicy {
    AllowAny,
    /// Exact origins to admit. Requests without an `Origin` header (non-browser
    /// clients) are always admitted.
    Allowlist(Vec<String>),
}

impl OriginPolicy {
    /// Local dev servers plus the relay's own demo page.
    pub fn localhost(port: u16) -> Self {
        let mut origins = Vec::new();
        for host in ["localhost", "127.0.0.1"] {
            for port in [5173, 3000, port] {
                let origin = format!("http://{host}:{port}");
                if !origins.contains(&origin) {
                    origins.push(origin);
                }
            }
        }
        OriginPolicy::Allowlist(origins)
    }

    pub fn admits(&self, origin: Option<&str>) -> bool {
        match (self, origin) {
            (OriginPolicy::AllowAny, _) | (OriginPolicy::Allowlist(_), None) => true,
            (OriginPolicy::Allowlist(allowed), Some(origin)) => {
                allowed.iter().any(|candidate| candidate == origin)
            }
        }
    }
}

#[derive(Clone)]
struct AppState {
    hub: HubHandle,
    origins: Arc<OriginPolicy>,
    subscriber_queue: usize,
}

pub fn router(hub: HubHandle, origins: OriginPolicy, subscriber_queue: usize) -> Router {
    let state = AppState {
        hub,
        origins: Arc::new(origins),
        subscriber_queue,
    };

    Router::new()
        .route("/", get(index))
        .route("/ws", get(upgrade))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn index() -> Html<&'static str> {
    Html(INDEX_PAGE)
}

async fn upgrade(
    State(state): State<AppState>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    let origin = headers.get(ORIGIN).and_then(|value| value.to_str().ok());
    if !state.origins.admits(origin) {
        warn!(?origin, "rejected push connection from disallowed origin");
        return StatusCode::FORBIDDEN.into_response();
    }

    ws.on_upgrade(move |socket| serve_subscriber(socket, state.hub, state.subscriber_queue))
        .into_response()
}

/// Bridges one websocket to the hub until either side gives up.
async fn serve_subscriber(socket: WebSocket, hub: HubHandle, queue: usize) {
    let (subscriber, mut inbox) = hub.subscriber(queue);
    let id = subscriber.id();
    if hub.register(subscriber).await.is_err() {
        return;
    }

    let (mut sink, mut stream) = socket.split();

    // The writer ends when the hub drops this subscriber, which is the only
    // place the socket gets closed.
    let mut writer = tokio::spawn(async move {
        while let Some(payload) = inbox.recv().await {
            if let Err(err) = sink.send(to_message(payload)).await {
                debug!(subscriber = id, error = %err, "websocket write failed");
                break;
            }
        }
        let _ = sink.close().await;
    });

    // Inbound frames carry nothing; watch them only to notice the client leaving.
    let mut reader = tokio::spawn(async move {
        while let Some(Ok(message)) = stream.next().await {
            if matches!(message, Message::Close(_)) {
                break;
            }
        }
    });

    let writer_done = select! {
        _ = &mut writer => {
            reader.abort();
            true
        }
        _ = &mut reader => false,
    };

    let _ = hub.unregister(id).await;
    if !writer_done {
        let _ = writer.await;
    }
    debug!(subscriber = id, "websocket session ended");
}

fn to_message(payload: Bytes) -> Message {
    match String::from_utf8(payload.to_vec()) {
        Ok(text) => Message::Text(text),
        Err(err) => Message::Binary(err.into_bytes()),
    }
}

/// Logs where the relay can be reached.
pub fn announce(addr: std::net::SocketAddr) {
    info!("websocket endpoint: ws://{addr}/ws");
    info!("demo page: http://{addr}/");
}

const INDEX_PAGE: &str = r#"<!DOCTYPE html>
<html>
<head>
    <title>PULSAR WebSocket Test</title>
</head>
<body>
    <h1>PULSAR Position Data</h1>
    <div id="messages"></div>
    <script>
        const ws = new WebSocket(`ws://${location.host}/ws`);
        const messages = document.getElementById('messages');

        ws.onmessage = function(event) {
            const data = JSON.parse(event.data);
            const entry = document.createElement('pre');
            entry.textContent = JSON.stringify(data, null, 2);
            messages.prepend(entry);
        };
    </script>
</body>
</html>
"#;

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use axum::{body::Body, http::Request};
    use tower::ServiceExt;
    use tracing::Span;

    use super::*;
    use crate::hub::Hub;

    #[tokio::test]
    async fn demo_page_points_at_push_endpoint() {
        let (hub, _) = Hub::spawn(Duration::from_millis(10), Span::none());
        let response = router(hub, OriginPolicy::AllowAny, 1)
            .oneshot(Request::get("/").body(Body::empty()).expect("request"))
            .await
            .expect("router is infallible");

        assert_eq!(response.status(), StatusCode::OK);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body");
        let page = std::str::from_utf8(&body).expect("utf8");
        assert!(page.contains("PULSAR Position Data"));
        assert!(page.contains("/ws"));
    }

    #[tokio::test]
    async fn plain_get_on_push_endpoint_is_not_an_upgrade() {
        let (hub, _) = Hub::spawn(Duration::from_millis(10), Span::none());
        let response = router(hub, OriginPolicy::AllowAny, 1)
            .oneshot(Request::get("/ws").body(Body::empty()).expect("request"))
            .await
            .expect("router is infallible");
        assert!(response.status().is_client_error());
    }

    #[test]
    fn localhost_policy_matches_dev_servers() {
        let policy = OriginPolicy::localhost(8080);
        assert!(policy.admits(None));
        assert!(policy.admits(Some("http://localhost:5173")));
        assert!(policy.admits(Some("http://127.0.0.1:3000")));
        assert!(policy.admits(Some("http://localhost:8080")));
        assert!(!policy.admits(Some("http://evil.example")));
        assert!(!policy.admits(Some("http://localhost:9999")));
    }

    #[test]
    fn allow_any_admits_everything() {
        assert!(OriginPolicy::AllowAny.admits(Some("http://evil.example")));
        assert!(OriginPolicy::AllowAny.admits(None));
    }

    #[test]
    fn text_payloads_stay_text() {
        assert!(matches!(
            to_message(Bytes::from_static(b"{}")),
            Message::Text(ref text) if text == "{}"
        ));
        assert!(matches!(to_message(Bytes::from_static(b"\xff")), Message::Binary(_)));
    }
}
