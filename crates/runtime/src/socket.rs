//! Socket dispatch: connection lifecycle and per-message handling.
//!
//! Messages are authenticated once per connection; the identity is then
//! remembered in the presence registry and restored for later messages.
//! A handler failure produces no reply. An intentional response replies
//! with its body.

use std::sync::Arc;

use {
    bytes::Bytes,
    serde_json::Value,
    tracing::{Instrument, debug, info_span, warn},
};

use crate::{
    context::{Context, IdentitySlot, Source},
    error::DispatchError,
    middleware::Inbound,
    runtime::Shared,
};

/// One inbound frame.
#[derive(Debug, Clone)]
pub struct SocketMessage {
    pub connection_id: String,
    pub raw: Bytes,
    /// The frame parsed as JSON, or as a string when it is not JSON.
    pub data: Value,
}

impl SocketMessage {
    pub fn new(connection_id: impl Into<String>, raw: Bytes) -> Self {
        let data = serde_json::from_slice(&raw)
            .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&raw).into_owned()));
        Self {
            connection_id: connection_id.into(),
            raw,
            data,
        }
    }

    /// Shorthand for `data[key]` as a string.
    pub fn field(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(Value::as_str)
    }
}

#[derive(Clone)]
pub struct SocketDispatcher {
    shared: Arc<Shared>,
}

impl SocketDispatcher {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        Self { shared }
    }

    pub async fn on_connect(&self, connection_id: &str) {
        if self
            .shared
            .capabilities
            .presence()
            .connect(connection_id)
            .await
        {
            debug!(connection_id, "socket connected");
        }
    }

    /// Handle one frame and return the reply to send back, if any.
    pub async fn on_message(&self, connection_id: &str, raw: Bytes) -> Option<Bytes> {
        let span = info_span!("socket", connection_id);
        self.on_message_inner(connection_id, raw)
            .instrument(span)
            .await
    }

    async fn on_message_inner(&self, connection_id: &str, raw: Bytes) -> Option<Bytes> {
        let route = match self.shared.manifest.resolve_socket() {
            Ok(route) => route,
            Err(err) => {
                warn!(error = %err, "socket message without a socket route");
                return None;
            },
        };
        let loaded = match self
            .shared
            .registry
            .load_socket(&route.handler, &self.shared.defaults)
        {
            Ok(loaded) => loaded,
            Err(err) => {
                warn!(handler = %route.handler, error = %err, "failed to load socket handler");
                return None;
            },
        };

        let identity = self
            .shared
            .capabilities
            .presence()
            .identity_of(connection_id)
            .await
            .map_or(IdentitySlot::Unset, IdentitySlot::Known);

        let message = Arc::new(SocketMessage::new(connection_id, raw));
        let ctx = Context::builder(Source::Socket, Arc::clone(&self.shared.capabilities))
            .timeout(route.timeout)
            .connection(connection_id)
            .identity(identity.clone())
            .build();

        let middleware = loaded.middleware;
        let task = {
            let ctx = ctx.clone();
            let middleware = middleware.clone();
            let handler = loaded.handler;
            async move {
                if !identity.is_set()
                    && let Some(authenticate) = &middleware.authenticate
                {
                    let identity =
                        authenticate(ctx.clone(), Inbound::Socket(Arc::clone(&message))).await?;
                    ctx.authenticate(identity).await;
                }
                if let Some(received) = &middleware.on_message_received {
                    received(ctx.clone(), Arc::clone(&message)).await?;
                }
                let Some(reply) = handler(ctx.clone(), message).await? else {
                    return Ok(None);
                };
                let reply = match &middleware.on_message_sent {
                    Some(sent) => sent(ctx, reply).await?,
                    None => reply,
                };
                Ok::<_, DispatchError>(Some(reply))
            }
        };

        match ctx.run(task).await {
            Ok(reply) => reply.map(encode_reply),
            Err(DispatchError::Intentional(response)) => Some(response.body),
            Err(DispatchError::Validation(message)) => {
                debug!(error = %message, "message rejected");
                Some(encode_reply(serde_json::json!({ "error": message })))
            },
            Err(err) => {
                middleware.report(&ctx, Arc::new(err)).await;
                None
            },
        }
    }

    /// Forget the connection. Fires `on_offline` if it was the last one of
    /// its identity; repeated calls are no-ops.
    pub async fn on_disconnect(&self, connection_id: &str) {
        debug!(connection_id, "socket disconnected");
        self.shared
            .capabilities
            .drop_connection(connection_id)
            .await;
    }
}

/// Strings go out as-is, everything else as JSON.
fn encode_reply(reply: Value) -> Bytes {
    match reply {
        Value::String(text) => Bytes::from(text),
        other => Bytes::from(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{
            context::Identity,
            error::HandlerError,
            http::HttpResponse,
            middleware::Middleware,
            presence::PresenceHooks,
            registry::HandlerRegistry,
            runtime::Runtime,
            testing,
        },
        http::StatusCode,
        std::sync::{
            Mutex,
            atomic::{AtomicUsize, Ordering},
        },
        tokio::sync::Notify,
    };

    type Log = Arc<Mutex<Vec<String>>>;

    struct Fixture {
        runtime: Runtime,
        authentications: Arc<AtomicUsize>,
        /// Signalled when a frame carrying `hold` reaches authentication.
        entered: Arc<Notify>,
        /// Releases a held authentication.
        gate: Arc<Notify>,
        presence: Log,
        errors: Log,
    }

    impl Fixture {
        async fn send(&self, connection_id: &str, frame: Value) -> Option<Value> {
            let reply = self
                .runtime
                .sockets()
                .on_message(connection_id, Bytes::from(frame.to_string()))
                .await?;
            Some(SocketMessage::new(connection_id, reply).data)
        }

        fn presence(&self) -> Vec<String> {
            self.presence.lock().unwrap().clone()
        }
    }

    fn fixture() -> Fixture {
        let manifest = testing::manifest(serde_json::json!({
            "sockets": [{ "handler": "ws/message" }]
        }));
        let authentications = Arc::new(AtomicUsize::new(0));
        let entered = Arc::new(Notify::new());
        let gate = Arc::new(Notify::new());
        let presence: Log = Arc::default();

        let mut registry = HandlerRegistry::new();
        registry.socket("ws/message", |ctx, msg| async move {
            match msg.field("action") {
                Some("ping") => Ok(Some(Value::from("pong"))),
                Some("whoami") => {
                    let id = ctx.identity().identity().map(|i| i.id.clone());
                    Ok(Some(serde_json::json!({ "id": id })))
                },
                Some("deny") => Err(HandlerError::respond(HttpResponse::error(
                    StatusCode::FORBIDDEN,
                    "nope",
                ))),
                Some("crash") => Err(HandlerError::Other(anyhow::anyhow!("socket handler crashed"))),
                Some("notify") => {
                    let to = msg.field("to").unwrap_or_default().to_string();
                    let delivered = ctx.send_to_identity(&to, "hello").await;
                    Ok(Some(serde_json::json!({ "delivered": delivered })))
                },
                _ => Err(HandlerError::validation("unknown action")),
            }
        });
        {
            let count = Arc::clone(&authentications);
            let entered = Arc::clone(&entered);
            let gate = Arc::clone(&gate);
            registry.middleware(
                "ws",
                Middleware::new().authenticate(move |_ctx, inbound| {
                    count.fetch_add(1, Ordering::SeqCst);
                    let entered = Arc::clone(&entered);
                    let gate = Arc::clone(&gate);
                    async move {
                        let Inbound::Socket(msg) = inbound else {
                            return Ok(None);
                        };
                        if msg.field("hold").is_some() {
                            entered.notify_one();
                            gate.notified().await;
                        }
                        Ok(msg.field("token").map(Identity::new))
                    }
                }),
            );
        }

        let hooks = {
            let online = Arc::clone(&presence);
            let offline = Arc::clone(&presence);
            PresenceHooks::new()
                .on_online(move |ctx, identity| {
                    let log = Arc::clone(&online);
                    async move {
                        assert!(ctx.identity().is_set());
                        log.lock().unwrap().push(format!("online {}", identity.id));
                        Ok(())
                    }
                })
                .on_offline(move |_ctx, identity| {
                    let log = Arc::clone(&offline);
                    async move {
                        log.lock().unwrap().push(format!("offline {}", identity.id));
                        Ok(())
                    }
                })
        };

        let (defaults, errors) = testing::recording();
        let runtime = Runtime::builder(manifest)
            .registry(registry)
            .presence_hooks(hooks)
            .default_middleware(defaults)
            .build()
            .unwrap();
        Fixture {
            runtime,
            authentications,
            entered,
            gate,
            presence,
            errors,
        }
    }

    #[test]
    fn frames_parse_as_json_or_string() {
        let json = SocketMessage::new("c1", Bytes::from_static(br#"{"action":"ping"}"#));
        assert_eq!(json.field("action"), Some("ping"));

        let text = SocketMessage::new("c1", Bytes::from_static(b"hello"));
        assert_eq!(text.data, Value::String("hello".into()));
        assert_eq!(text.field("action"), None);
    }

    #[test]
    fn replies_are_encoded() {
        assert_eq!(encode_reply(Value::String("pong".into())), "pong");
        assert_eq!(encode_reply(serde_json::json!({"ok": true})), r#"{"ok":true}"#);
    }

    #[tokio::test]
    async fn authenticates_once_and_reports_presence_once() {
        let fx = fixture();
        let sockets = fx.runtime.sockets();
        sockets.on_connect("c1").await;
        sockets.on_connect("c2").await;

        let first = fx
            .send("c1", serde_json::json!({ "action": "whoami", "token": "ada" }))
            .await;
        assert_eq!(first, Some(serde_json::json!({ "id": "ada" })));
        let again = fx.send("c1", serde_json::json!({ "action": "whoami" })).await;
        assert_eq!(again, Some(serde_json::json!({ "id": "ada" })));
        assert_eq!(fx.authentications.load(Ordering::SeqCst), 1);

        // A second connection of the same identity is not a new arrival.
        let pong = fx
            .send("c2", serde_json::json!({ "action": "ping", "token": "ada" }))
            .await;
        assert_eq!(pong, Some(Value::from("pong")));
        assert_eq!(fx.authentications.load(Ordering::SeqCst), 2);
        assert_eq!(fx.presence(), vec!["online ada"]);

        sockets.on_disconnect("c1").await;
        sockets.on_disconnect("c1").await;
        assert_eq!(fx.presence(), vec!["online ada"]);
        sockets.on_disconnect("c2").await;
        sockets.on_disconnect("c2").await;
        assert_eq!(fx.presence(), vec!["online ada", "offline ada"]);
    }

    #[tokio::test]
    async fn replies_for_intentional_responses_and_failures() {
        let fx = fixture();
        fx.runtime.sockets().on_connect("c1").await;

        let denied = fx.send("c1", serde_json::json!({ "action": "deny" })).await;
        assert_eq!(denied, Some(serde_json::json!({ "error": "nope" })));

        let invalid = fx.send("c1", serde_json::json!({ "action": "dance" })).await;
        assert_eq!(invalid, Some(serde_json::json!({ "error": "unknown action" })));
        assert!(fx.errors.lock().unwrap().is_empty());

        let crashed = fx.send("c1", serde_json::json!({ "action": "crash" })).await;
        assert_eq!(crashed, None);
        assert_eq!(fx.errors.lock().unwrap().clone(), vec!["socket handler crashed"]);
    }

    #[tokio::test]
    async fn fan_out_drops_gone_connections() {
        let fx = fixture();
        let sink = fx.runtime.channel_sink().unwrap();
        let mut inbox = sink.open("c1");
        let _stale = sink.open("c2");
        for connection_id in ["c1", "c2", "c3"] {
            fx.runtime.sockets().on_connect(connection_id).await;
        }
        fx.send("c1", serde_json::json!({ "action": "ping", "token": "bob" })).await;
        fx.send("c2", serde_json::json!({ "action": "ping", "token": "bob" })).await;
        sink.forget("c2");

        let reply = fx
            .send("c3", serde_json::json!({ "action": "notify", "to": "bob" }))
            .await;
        assert_eq!(reply, Some(serde_json::json!({ "delivered": 1 })));
        assert_eq!(inbox.try_recv().unwrap(), "hello");

        let presence = fx.runtime.capabilities().presence();
        assert_eq!(presence.connections_for("bob").await, vec!["c1".to_string()]);
        assert!(!presence.is_connected("c2").await);
        assert_eq!(fx.presence(), vec!["online bob"]);
    }

    #[tokio::test]
    async fn frames_after_disconnect_do_not_reconnect() {
        let fx = fixture();
        let sockets = fx.runtime.sockets();
        sockets.on_connect("c1").await;
        sockets.on_disconnect("c1").await;

        let reply = fx
            .send("c1", serde_json::json!({ "action": "whoami", "token": "ada" }))
            .await;
        assert_eq!(reply, Some(serde_json::json!({ "id": "ada" })));

        let presence = fx.runtime.capabilities().presence();
        assert!(!presence.is_connected("c1").await);
        assert!(!presence.is_online("ada").await);
        assert_eq!(presence.connection_count().await, 0);
        assert!(fx.presence().is_empty());
    }

    #[tokio::test]
    async fn disconnect_during_authentication_leaves_no_presence() {
        let fx = fixture();
        let sockets = fx.runtime.sockets().clone();
        sockets.on_connect("c1").await;

        let frame = serde_json::json!({ "action": "ping", "token": "ada", "hold": true });
        let pending = tokio::spawn({
            let sockets = sockets.clone();
            async move {
                sockets
                    .on_message("c1", Bytes::from(frame.to_string()))
                    .await
            }
        });
        fx.entered.notified().await;
        sockets.on_disconnect("c1").await;
        fx.gate.notify_one();

        assert_eq!(pending.await.unwrap(), Some(Bytes::from("pong")));
        let presence = fx.runtime.capabilities().presence();
        assert!(!presence.is_connected("c1").await);
        assert!(!presence.is_online("ada").await);
        assert!(fx.presence().is_empty());
    }
}
