//! Handshake admission
//!
//! Every socket is admitted once, during the HTTP upgrade: the query string
//! names the project and carries the token. A rejected upgrade is answered
//! with a plain HTTP error and no socket is established.

use std::fmt;
use thiserror::Error;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request};
use tokio_tungstenite::tungstenite::http::{StatusCode, Uri};

/// Path the relay accepts sockets on
pub const SOCKET_PATH: &str = "/ws";

/// Errors that can occur while validating a token
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthError {
    #[error("Missing token")]
    Missing,
    #[error("Invalid token")]
    Invalid,
}

/// Who a socket was admitted as
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Principal {
    /// No tokens are configured
    Anonymous,
    /// Index of the matching configured token
    Token(usize),
}

impl fmt::Display for Principal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Principal::Anonymous => write!(f, "anonymous"),
            Principal::Token(index) => write!(f, "token #{}", index),
        }
    }
}

/// Validates the token presented at connect time
pub trait Authorizer: Send + Sync {
    fn validate(&self, token: Option<&str>) -> Result<Principal, AuthError>;
}

/// A fixed set of accepted tokens; open when the set is empty
#[derive(Debug, Clone, Default)]
pub struct TokenAuthorizer {
    tokens: Vec<String>,
}

impl TokenAuthorizer {
    pub fn new(tokens: impl IntoIterator<Item = String>) -> Self {
        let mut tokens: Vec<String> = tokens.into_iter().filter(|t| !t.is_empty()).collect();
        tokens.dedup();
        Self { tokens }
    }

    /// Whether every connection is admitted without a token
    pub fn is_open(&self) -> bool {
        self.tokens.is_empty()
    }
}

impl Authorizer for TokenAuthorizer {
    fn validate(&self, token: Option<&str>) -> Result<Principal, AuthError> {
        if self.is_open() {
            return Ok(Principal::Anonymous);
        }
        let token = token.filter(|t| !t.is_empty()).ok_or(AuthError::Missing)?;
        self.tokens
            .iter()
            .position(|known| known == token)
            .map(Principal::Token)
            .ok_or(AuthError::Invalid)
    }
}

/// Why an upgrade was refused
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Rejection {
    #[error("No socket at {0}")]
    WrongPath(String),
    #[error("Missing projectId")]
    MissingProject,
    #[error(transparent)]
    Unauthorized(#[from] AuthError),
}

impl Rejection {
    pub fn status(&self) -> StatusCode {
        match self {
            Rejection::WrongPath(_) => StatusCode::NOT_FOUND,
            Rejection::MissingProject => StatusCode::BAD_REQUEST,
            Rejection::Unauthorized(_) => StatusCode::UNAUTHORIZED,
        }
    }

    /// HTTP response sent instead of the upgrade
    pub fn into_response(self) -> ErrorResponse {
        let mut response = ErrorResponse::new(Some(self.to_string()));
        *response.status_mut() = self.status();
        response
    }
}

/// Query parameters of an upgrade request
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectParams {
    pub project_id: Option<String>,
    pub token: Option<String>,
}

impl ConnectParams {
    pub fn from_uri(uri: &Uri) -> Self {
        let mut params = Self::default();
        let query = uri.query().unwrap_or_default();
        for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
            match key.as_ref() {
                "projectId" => params.project_id = Some(value.into_owned()),
                "token" => params.token = Some(value.into_owned()),
                _ => {}
            }
        }
        params
    }
}

/// An admitted socket
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Admission {
    pub project_id: String,
    pub principal: Principal,
}

/// Decide whether an upgrade request may become a socket
pub fn admit(request: &Request, authorizer: &dyn Authorizer) -> Result<Admission, Rejection> {
    let uri = request.uri();
    if uri.path() != SOCKET_PATH {
        return Err(Rejection::WrongPath(uri.path().to_string()));
    }

    let params = ConnectParams::from_uri(uri);
    let principal = authorizer.validate(params.token.as_deref())?;
    let project_id = params
        .project_id
        .filter(|id| !id.is_empty())
        .ok_or(Rejection::MissingProject)?;

    Ok(Admission {
        project_id,
        principal,
    })
}
