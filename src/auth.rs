use futures_util::future::BoxFuture;

use crate::InvokeResult;

#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    access_key_id: String,
    secret_access_key: String,
    session_token: Option<String>,
}

impl Credentials {
    pub fn new(access_key_id: impl Into<String>, secret_access_key: impl Into<String>) -> Self {
        Self {
            access_key_id: access_key_id.into(),
            secret_access_key: secret_access_key.into(),
            session_token: None,
        }
    }

    pub fn with_session_token(mut self, session_token: impl Into<String>) -> Self {
        self.session_token = Some(session_token.into());
        self
    }

    pub fn access_key_id(&self) -> &str {
        &self.access_key_id
    }

    pub fn secret_access_key(&self) -> &str {
        &self.secret_access_key
    }

    pub fn session_token(&self) -> Option<&str> {
        self.session_token.as_deref()
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("Credentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"<redacted>")
            .field(
                "session_token",
                &self.session_token.as_ref().map(|_| "<redacted>"),
            )
            .finish()
    }
}

/// Source of credentials for requests that do not carry their own.
///
/// Resolution may suspend (e.g. a metadata endpoint lookup); a failure is
/// reported as a client error of kind [`ClientErrorKind::Credentials`] and
/// fails the current attempt.
///
/// [`ClientErrorKind::Credentials`]: crate::ClientErrorKind::Credentials
pub trait CredentialsProvider: Send + Sync {
    fn credentials(&self) -> BoxFuture<'_, InvokeResult<Credentials>>;
}

#[derive(Clone, Debug)]
pub struct StaticCredentialsProvider {
    credentials: Credentials,
}

impl StaticCredentialsProvider {
    pub fn new(credentials: Credentials) -> Self {
        Self { credentials }
    }
}

impl CredentialsProvider for StaticCredentialsProvider {
    fn credentials(&self) -> BoxFuture<'_, InvokeResult<Credentials>> {
        let credentials = self.credentials.clone();
        Box::pin(async move { Ok(credentials) })
    }
}
