//! axum adapter: HTTP requests go to the HTTP dispatcher, WebSocket frames
//! on the configured socket path go to the socket dispatcher, and the local
//! queue consumers and schedule tickers run next to the listener.

use std::{net::SocketAddr, sync::Arc};

use {
    axum::{
        Router,
        body::Body,
        extract::{
            ConnectInfo, State, WebSocketUpgrade,
            ws::{Message, WebSocket},
        },
        response::{IntoResponse, Response},
        routing::get,
    },
    bytes::Bytes,
    futures::{SinkExt, StreamExt},
    http::StatusCode,
    tokio_util::sync::CancellationToken,
    tower_http::trace::TraceLayer,
    tracing::{debug, info, warn},
};

use switchyard_config::{ServerConfig, SwitchyardConfig};

use crate::{
    http::{HttpRequest, HttpResponse},
    queue::spawn_local_consumer,
    runtime::Runtime,
    transport::ConnectionSink,
};

// ── Shared app state ─────────────────────────────────────────────────────────

#[derive(Clone)]
struct AppState {
    runtime: Arc<Runtime>,
    body_limit: usize,
}

// ── Router ───────────────────────────────────────────────────────────────────

/// Build the router (shared between `serve` and tests).
pub fn build_app(runtime: Arc<Runtime>, config: &ServerConfig) -> Router {
    let sockets_enabled = runtime.channel_sink().is_some()
        && runtime.manifest().resolve_socket().is_ok()
        && config.socket_path.starts_with('/');
    let state = AppState {
        runtime,
        body_limit: config.body_limit_bytes,
    };

    let router = Router::new();
    let router = if sockets_enabled {
        router.route(&config.socket_path, get(ws_upgrade_handler))
    } else {
        router
    };

    router
        .fallback(http_handler)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve until Ctrl-C, then stop the background consumers.
pub async fn serve(runtime: Arc<Runtime>, config: &SwitchyardConfig) -> anyhow::Result<()> {
    let shutdown = CancellationToken::new();
    let mut background = Vec::new();

    if let Some(queue) = runtime.local_queue() {
        for definition in runtime.manifest().queues() {
            background.push(spawn_local_consumer(
                runtime.queues().clone(),
                Arc::clone(queue),
                definition.name.clone(),
                config.local_queue.clone(),
                shutdown.clone(),
            ));
        }
    }
    background.extend(runtime.schedules().spawn_ticker(shutdown.clone()));

    let app = build_app(Arc::clone(&runtime), &config.server);
    let addr: SocketAddr = config.server.address().parse()?;
    let listener = tokio::net::TcpListener::bind(addr).await?;

    let manifest = runtime.manifest();
    let lines = [
        format!("switchyard v{}", env!("CARGO_PKG_VERSION")),
        format!("listening on {addr}"),
        format!(
            "{} routes, {} queues, {} schedules, {} socket routes",
            manifest.routes().len(),
            manifest.queues().len(),
            manifest.schedules().len(),
            manifest.sockets().len()
        ),
    ];
    let width = lines.iter().map(|l| l.len()).max().unwrap_or(0) + 4;
    info!("┌{}┐", "─".repeat(width));
    for line in &lines {
        info!("│  {:<w$}│", line, w = width - 2);
    }
    info!("└{}┘", "─".repeat(width));

    let token = shutdown.clone();
    let result = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move {
        if tokio::signal::ctrl_c().await.is_err() {
            warn!("failed to listen for ctrl-c");
        }
        token.cancel();
    })
    .await;

    shutdown.cancel();
    for task in background {
        let _ = task.await;
    }
    result.map_err(Into::into)
}

// ── Handlers ─────────────────────────────────────────────────────────────────

async fn http_handler(State(state): State<AppState>, request: axum::extract::Request) -> Response {
    let remote_addr = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0);
    let (parts, body) = request.into_parts();
    let body = match axum::body::to_bytes(body, state.body_limit).await {
        Ok(body) => body,
        Err(err) => {
            debug!(error = %err, "request body rejected");
            return into_response(HttpResponse::error(
                StatusCode::PAYLOAD_TOO_LARGE,
                "Payload Too Large",
            ));
        },
    };
    let uri = parts
        .uri
        .path_and_query()
        .map_or_else(|| parts.uri.path().to_string(), |pq| pq.as_str().to_string());

    let response = state
        .runtime
        .http()
        .dispatch(HttpRequest {
            method: parts.method,
            uri,
            headers: parts.headers,
            body,
            remote_addr,
        })
        .await;
    into_response(response)
}

fn into_response(response: HttpResponse) -> Response {
    let mut out = Response::new(Body::from(response.body));
    *out.status_mut() = response.status;
    *out.headers_mut() = response.headers;
    out
}

async fn ws_upgrade_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state.runtime))
}

async fn handle_socket(socket: WebSocket, runtime: Arc<Runtime>) {
    let Some(sink) = runtime.channel_sink().cloned() else {
        return;
    };
    let connection_id = uuid::Uuid::new_v4().to_string();
    let mut outbound = sink.open(&connection_id);
    let sockets = runtime.sockets();
    sockets.on_connect(&connection_id).await;

    let (mut ws_tx, mut ws_rx) = socket.split();
    let writer = tokio::spawn(async move {
        while let Some(payload) = outbound.recv().await {
            let frame = match std::str::from_utf8(&payload) {
                Ok(text) => Message::Text(text.to_owned().into()),
                Err(_) => Message::Binary(payload),
            };
            if ws_tx.send(frame).await.is_err() {
                break;
            }
        }
        let _ = ws_tx.close().await;
    });

    while let Some(frame) = ws_rx.next().await {
        let raw = match frame {
            Ok(Message::Text(text)) => Bytes::copy_from_slice(text.as_str().as_bytes()),
            Ok(Message::Binary(data)) => data,
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => continue,
        };
        if let Some(reply) = sockets.on_message(&connection_id, raw).await
            && sink.send(&connection_id, reply).await.is_err()
        {
            break;
        }
    }

    sink.forget(&connection_id);
    sockets.on_disconnect(&connection_id).await;
    let _ = writer.await;
}
