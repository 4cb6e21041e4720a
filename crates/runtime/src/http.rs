//! HTTP dispatch: route resolution, CORS, content negotiation and the
//! authenticate → on_request → handler → on_response pipeline.

use std::{net::SocketAddr, sync::Arc};

use {
    bytes::Bytes,
    http::{
        HeaderMap, HeaderName, HeaderValue, Method, StatusCode,
        header::{
            ACCESS_CONTROL_ALLOW_HEADERS, ACCESS_CONTROL_ALLOW_METHODS,
            ACCESS_CONTROL_ALLOW_ORIGIN, ACCESS_CONTROL_MAX_AGE, ACCESS_CONTROL_REQUEST_HEADERS,
            ALLOW, CONTENT_TYPE, LOCATION,
        },
    },
    serde::{Serialize, de::DeserializeOwned},
    tracing::{Instrument, debug, info_span, warn},
};

use switchyard_manifest::{PathParams, Route};

use crate::{
    context::{Context, Source},
    error::{DispatchError, HandlerError},
    middleware::Inbound,
    runtime::Shared,
};

// ── Request / response ───────────────────────────────────────────────────────

/// An HTTP request as handed over by the transport adapter.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: Method,
    /// Path plus optional query string.
    pub uri: String,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub remote_addr: Option<SocketAddr>,
}

impl HttpRequest {
    pub fn new(method: Method, uri: impl Into<String>) -> Self {
        Self {
            method,
            uri: uri.into(),
            headers: HeaderMap::new(),
            body: Bytes::new(),
            remote_addr: None,
        }
    }

    pub fn header(mut self, name: HeaderName, value: &'static str) -> Self {
        self.headers.insert(name, HeaderValue::from_static(value));
        self
    }

    pub fn body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    pub fn json(self, value: &serde_json::Value) -> Self {
        self.header(CONTENT_TYPE, "application/json")
            .body(value.to_string())
    }
}

/// The request a handler sees: the inbound request plus the captured path
/// parameters of the matched route.
#[derive(Debug, Clone)]
pub struct Request {
    pub method: Method,
    pub path: String,
    pub query: Option<String>,
    pub headers: HeaderMap,
    pub body: Bytes,
    pub params: PathParams,
    pub remote_addr: Option<SocketAddr>,
}

impl Request {
    pub fn param(&self, name: &str) -> Option<&str> {
        self.params.get(name)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Decoded query pairs. Malformed escapes are kept verbatim.
    pub fn query_pairs(&self) -> Vec<(String, String)> {
        let Some(query) = self.query.as_deref() else {
            return Vec::new();
        };
        query
            .split('&')
            .filter(|pair| !pair.is_empty())
            .map(|pair| {
                let (key, value) = pair.split_once('=').unwrap_or((pair, ""));
                (decode_component(key), decode_component(value))
            })
            .collect()
    }

    pub fn query_param(&self, name: &str) -> Option<String> {
        self.query_pairs()
            .into_iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value)
    }

    /// Parse the body as JSON. Malformed input is a validation failure.
    pub fn json<T: DeserializeOwned>(&self) -> Result<T, HandlerError> {
        serde_json::from_slice(&self.body)
            .map_err(|e| HandlerError::validation(format!("malformed JSON body: {e}")))
    }

    pub fn text(&self) -> Result<&str, HandlerError> {
        std::str::from_utf8(&self.body)
            .map_err(|_| HandlerError::validation("request body is not valid UTF-8"))
    }
}

fn decode_component(raw: &str) -> String {
    let spaced = raw.replace('+', " ");
    urlencoding::decode(&spaced).map_or(spaced.clone(), |decoded| decoded.into_owned())
}

#[derive(Debug, Clone, PartialEq)]
pub struct HttpResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl HttpResponse {
    pub fn new(status: StatusCode) -> Self {
        Self {
            status,
            headers: HeaderMap::new(),
            body: Bytes::new(),
        }
    }

    pub fn json<T: Serialize>(status: StatusCode, value: &T) -> Result<Self, HandlerError> {
        let body = serde_json::to_vec(value).map_err(anyhow::Error::from)?;
        Ok(Self::new(status)
            .with_header(CONTENT_TYPE, HeaderValue::from_static("application/json"))
            .with_body(body))
    }

    pub fn text(status: StatusCode, body: impl Into<String>) -> Self {
        Self::new(status)
            .with_header(
                CONTENT_TYPE,
                HeaderValue::from_static("text/plain; charset=utf-8"),
            )
            .with_body(body.into())
    }

    /// `{"error": message}` with the given status.
    pub fn error(status: StatusCode, message: &str) -> Self {
        Self::new(status)
            .with_header(CONTENT_TYPE, HeaderValue::from_static("application/json"))
            .with_body(serde_json::json!({ "error": message }).to_string())
    }

    pub fn redirect(location: &str) -> Result<Self, HandlerError> {
        let location = HeaderValue::try_from(location)
            .map_err(|_| HandlerError::validation(format!("invalid redirect target {location}")))?;
        Ok(Self::new(StatusCode::FOUND).with_header(LOCATION, location))
    }

    pub fn with_header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn with_body(mut self, body: impl Into<Bytes>) -> Self {
        self.body = body.into();
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

// ── Dispatcher ───────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct HttpDispatcher {
    shared: Arc<Shared>,
}

impl HttpDispatcher {
    pub(crate) fn new(shared: Arc<Shared>) -> Self {
        Self { shared }
    }

    /// Answer one request. Every failure is turned into a response.
    pub async fn dispatch(&self, request: HttpRequest) -> HttpResponse {
        let span = info_span!("http", method = %request.method, uri = %request.uri);
        self.dispatch_inner(request).instrument(span).await
    }

    async fn dispatch_inner(&self, request: HttpRequest) -> HttpResponse {
        let (path, query) = match request.uri.split_once('?') {
            Some((path, query)) => (path.to_string(), Some(query.to_string())),
            None => (request.uri.clone(), None),
        };

        let matched = match self.shared.manifest.resolve_route(&path, &request.method) {
            Ok(matched) => matched,
            Err(err) => {
                debug!(error = %err, "no route");
                return HttpResponse::error(StatusCode::NOT_FOUND, "Not Found");
            },
        };
        let route = matched.route;

        if route.cors && request.method == Method::OPTIONS {
            return preflight(route, &request.headers);
        }
        if !matched.method_allowed {
            return with_cors(route, method_not_allowed(route));
        }
        if !content_type_accepted(route, &request) {
            return with_cors(
                route,
                HttpResponse::error(StatusCode::UNSUPPORTED_MEDIA_TYPE, "Unsupported Media Type"),
            );
        }

        let loaded = match self
            .shared
            .registry
            .load_http(&route.handler, &self.shared.defaults)
        {
            Ok(loaded) => loaded,
            Err(err) => {
                warn!(handler = %route.handler, error = %err, "failed to load handler");
                return with_cors(route, internal_error());
            },
        };

        let request = Arc::new(Request {
            method: request.method,
            path,
            query,
            headers: request.headers,
            body: request.body,
            params: matched.params,
            remote_addr: request.remote_addr,
        });
        let ctx = Context::builder(Source::Http, Arc::clone(&self.shared.capabilities))
            .timeout(route.timeout)
            .build();

        let middleware = loaded.middleware;
        let task = {
            let ctx = ctx.clone();
            let middleware = middleware.clone();
            let handler = loaded.handler;
            async move {
                if let Some(authenticate) = &middleware.authenticate {
                    let identity =
                        authenticate(ctx.clone(), Inbound::Http(Arc::clone(&request))).await?;
                    ctx.authenticate(identity).await;
                }
                if let Some(on_request) = &middleware.on_request {
                    on_request(ctx.clone(), Arc::clone(&request)).await?;
                }
                let response = handler(ctx.clone(), request).await?;
                let response = match &middleware.on_response {
                    Some(on_response) => on_response(ctx, response).await?,
                    None => response,
                };
                Ok::<_, DispatchError>(response)
            }
        };

        let response = match ctx.run(task).await {
            Ok(response) => response,
            Err(DispatchError::Intentional(response)) => *response,
            Err(DispatchError::Validation(message)) => {
                debug!(error = %message, "request rejected");
                HttpResponse::error(StatusCode::BAD_REQUEST, &message)
            },
            Err(err) => {
                middleware.report(&ctx, Arc::new(err)).await;
                internal_error()
            },
        };
        debug!(status = response.status.as_u16(), "request handled");
        with_cors(route, response)
    }
}

fn internal_error() -> HttpResponse {
    HttpResponse::error(StatusCode::INTERNAL_SERVER_ERROR, "Internal Server Error")
}

/// Checked only when the request declares a type or carries a body.
fn content_type_accepted(route: &Route, request: &HttpRequest) -> bool {
    match request
        .headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
    {
        Some(content_type) => route.accepts_content_type(content_type),
        None => request.body.is_empty() || route.content_types.is_empty(),
    }
}

fn allowed_methods(route: &Route) -> String {
    let mut methods: Vec<&str> = route.methods.iter().map(Method::as_str).collect();
    if route.cors && !route.methods.contains(&Method::OPTIONS) {
        methods.push(Method::OPTIONS.as_str());
    }
    methods.join(", ")
}

fn method_not_allowed(route: &Route) -> HttpResponse {
    let response = HttpResponse::error(StatusCode::METHOD_NOT_ALLOWED, "Method Not Allowed");
    match HeaderValue::try_from(allowed_methods(route)) {
        Ok(allow) => response.with_header(ALLOW, allow),
        Err(_) => response,
    }
}

fn preflight(route: &Route, headers: &HeaderMap) -> HttpResponse {
    let mut response = with_cors(route, HttpResponse::new(StatusCode::NO_CONTENT));
    if let Ok(methods) = HeaderValue::try_from(allowed_methods(route)) {
        response = response.with_header(ACCESS_CONTROL_ALLOW_METHODS, methods);
    }
    let allow_headers = headers
        .get(ACCESS_CONTROL_REQUEST_HEADERS)
        .cloned()
        .unwrap_or_else(|| HeaderValue::from_static("*"));
    response
        .with_header(ACCESS_CONTROL_ALLOW_HEADERS, allow_headers)
        .with_header(ACCESS_CONTROL_MAX_AGE, HeaderValue::from_static("600"))
}

fn with_cors(route: &Route, response: HttpResponse) -> HttpResponse {
    if route.cors {
        response.with_header(ACCESS_CONTROL_ALLOW_ORIGIN, HeaderValue::from_static("*"))
    } else {
        response
    }
}
