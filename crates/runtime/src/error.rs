use std::{fmt, time::Duration};

use switchyard_manifest::NotFound;

use crate::http::HttpResponse;

/// What a handler or middleware hook may fail with.
#[derive(Debug, thiserror::Error)]
pub enum HandlerError {
    /// Stop here and answer with this response. Not a failure: the response
    /// is sent as-is and no error hook runs.
    #[error("intentional {} response", .0.status)]
    Respond(Box<HttpResponse>),

    /// The inbound payload was rejected.
    #[error("{0}")]
    Validation(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl HandlerError {
    pub fn respond(response: HttpResponse) -> Self {
        Self::Respond(Box::new(response))
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }
}

/// Kinds of handler a manifest target can reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerKind {
    Http,
    Job,
    Schedule,
    Socket,
}

impl fmt::Display for HandlerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Http => "http",
            Self::Job => "job",
            Self::Schedule => "schedule",
            Self::Socket => "socket",
        })
    }
}

/// Handler lookup failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LoadError {
    #[error("no handler registered as {0}")]
    NotFound(String),

    #[error("handler {id} is a {found} handler, {expected} expected")]
    WrongKind {
        id: String,
        expected: HandlerKind,
        found: HandlerKind,
    },
}

/// Everything a dispatch can end with besides success.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error(transparent)]
    Resolution(#[from] NotFound),

    #[error(transparent)]
    Load(#[from] LoadError),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("intentional {} response", .0.status)]
    Intentional(Box<HttpResponse>),

    #[error("deadline of {0:?} exceeded")]
    Timeout(Duration),

    #[error("an execution context is already active on this task")]
    NestedContext,

    #[error("execution context has already been run")]
    ContextReused,

    #[error("{0:#}")]
    Unhandled(anyhow::Error),

    #[error("handler panicked: {0}")]
    Panicked(String),
}

impl DispatchError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_))
    }

    /// Intentional responses are the only errors that are not failures.
    pub fn is_failure(&self) -> bool {
        !matches!(self, Self::Intentional(_))
    }
}

impl From<HandlerError> for DispatchError {
    fn from(err: HandlerError) -> Self {
        match err {
            HandlerError::Respond(response) => Self::Intentional(response),
            HandlerError::Validation(message) => Self::Validation(message),
            HandlerError::Other(err) => Self::Unhandled(err),
        }
    }
}
