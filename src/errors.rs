use thiserror::Error;

/// Datastore write/read failure.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("{0}")]
    Unavailable(String),
}

/// Classification of a remote-platform failure. The platform reports
/// these as loosely structured error payloads; callers match on the kind
/// exhaustively instead of dispatching on strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GraphErrorKind {
    /// Credentials rejected outright (401/403 or an auth error payload).
    Auth,
    /// Page session expired or was invalidated (OAuthException 190).
    Session,
    /// Session present but carries no usable user id (error code 102).
    SessionNoId,
    Generic,
}

#[derive(Debug, Error)]
#[error("{message}")]
pub struct GraphError {
    pub kind: GraphErrorKind,
    pub message: String,
}

impl GraphError {
    pub fn new(kind: GraphErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn generic(message: impl Into<String>) -> Self {
        Self::new(GraphErrorKind::Generic, message)
    }

    pub fn session_no_id(message: impl Into<String>) -> Self {
        Self::new(GraphErrorKind::SessionNoId, message)
    }
}

/// Chat-completion provider failure. Never retried.
#[derive(Debug, Error)]
pub enum ProviderError {
    #[error("chat completion request failed: {0}")]
    Request(String),
    #[error("chat completion returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("chat completion response had empty content")]
    EmptyContent,
}

/// Failure inside the webhook delivery pipeline. Validation maps to 400,
/// everything else surfaces as a bare 500; completed writes are never
/// rolled back.
#[derive(Debug, Error)]
pub enum WebhookError {
    #[error("{0}")]
    Validation(String),
    #[error("upstream lookup failed: {0}")]
    UpstreamLookup(String),
    #[error("persistence failed: {0}")]
    Persistence(#[from] StoreError),
    #[error(transparent)]
    Provider(#[from] ProviderError),
}

impl From<GraphError> for WebhookError {
    fn from(err: GraphError) -> Self {
        WebhookError::UpstreamLookup(err.message)
    }
}

/// Failure of a bulk reconciliation run. Message-level upsert failures are
/// logged and absorbed inside the run; anything surfacing here aborted it.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Graph(#[from] GraphError),
    #[error("conversation upsert failed: {0}")]
    Persistence(#[from] StoreError),
}
