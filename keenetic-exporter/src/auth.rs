//! Challenge/response authentication against the router's `/auth` endpoint.
//!
//! ```text
//! Unauthenticated ──GET /auth──> 200 ─────────────────────────────> Authenticated
//!        │
//!        └──────────> 401 + X-NDM-Challenge/X-NDM-Realm ──> Challenged
//!                                                              │
//!                              POST /auth {login, password} ───┴──> 200 ──> Authenticated
//! ```
//!
//! Any other outcome ends in `Failed`. Nothing is cached between runs: the
//! router keeps the login alive through the session cookie, so an already
//! logged-in session answers the first GET with 200 and skips the challenge.

use std::fmt;

use md5::Md5;
use reqwest::StatusCode;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::{debug, trace};

use crate::client::CookieClient;
use crate::error::AuthError;

/// Response header carrying the one-time challenge token.
pub const CHALLENGE_HEADER: &str = "X-NDM-Challenge";

/// Response header carrying the authentication realm.
pub const REALM_HEADER: &str = "X-NDM-Realm";

/// Router endpoint and login details.
#[derive(Clone)]
pub struct Credentials {
    endpoint: String,
    username: String,
    password: String,
    skip_auth: bool,
}

impl Credentials {
    /// Create credentials for `endpoint`. A trailing `/` is dropped.
    pub fn new(
        endpoint: impl Into<String>,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        let endpoint: String = endpoint.into();
        Self {
            endpoint: endpoint.trim_end_matches('/').to_string(),
            username: username.into(),
            password: password.into(),
            skip_auth: false,
        }
    }

    /// Skip the handshake entirely (for routers with auth disabled on the LAN).
    pub fn with_skip_auth(mut self, skip_auth: bool) -> Self {
        self.skip_auth = skip_auth;
        self
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn skip_auth(&self) -> bool {
        self.skip_auth
    }

    fn auth_url(&self) -> String {
        format!("{}/auth", self.endpoint)
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("endpoint", &self.endpoint)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("skip_auth", &self.skip_auth)
            .finish()
    }
}

/// Challenge issued by a 401 response. Good for one attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Challenge {
    pub token: String,
    pub realm: String,
}

/// Handshake state.
#[derive(Debug)]
pub enum AuthState {
    Unauthenticated,
    Challenged(Challenge),
    Authenticated,
    Failed(AuthError),
}

#[derive(Serialize)]
struct LoginRequest<'a> {
    login: &'a str,
    password: &'a str,
}

/// Compute the challenge response: `sha256(token + md5("login:realm:password"))`.
///
/// Both digests are lowercase hex; the MD5 hex string is appended to the
/// token before hashing.
pub fn encrypt_password(login: &str, password: &str, challenge: &Challenge) -> String {
    let mut md5 = Md5::new();
    md5.update(format!("{}:{}:{}", login, challenge.realm, password).as_bytes());
    let md5_hex = format!("{:x}", md5.finalize());

    let mut sha = Sha256::new();
    sha.update(challenge.token.as_bytes());
    sha.update(md5_hex.as_bytes());
    format!("{:x}", sha.finalize())
}

/// Runs the handshake for one set of credentials.
pub struct Authenticator<'a> {
    credentials: &'a Credentials,
    http: &'a CookieClient,
}

impl<'a> Authenticator<'a> {
    pub fn new(credentials: &'a Credentials, http: &'a CookieClient) -> Self {
        Self { credentials, http }
    }

    /// Drive the state machine until it reaches `Authenticated` or `Failed`.
    pub async fn run(&self) -> Result<(), AuthError> {
        let mut state = if self.credentials.skip_auth {
            trace!("Authentication skipped");
            AuthState::Authenticated
        } else {
            AuthState::Unauthenticated
        };

        loop {
            state = match state {
                AuthState::Unauthenticated => self.check().await,
                AuthState::Challenged(challenge) => self.respond(challenge).await,
                AuthState::Authenticated => return Ok(()),
                AuthState::Failed(e) => return Err(e),
            };
        }
    }

    async fn check(&self) -> AuthState {
        let request = self.http.get(self.credentials.auth_url());
        let response = match self.http.send(request).await {
            Ok(response) => response,
            Err(e) => return AuthState::Failed(e.into()),
        };

        let status = response.status();
        let next = match status {
            StatusCode::OK => {
                debug!("Session still valid");
                AuthState::Authenticated
            }
            StatusCode::UNAUTHORIZED => {
                let header = |name: &str| {
                    response
                        .headers()
                        .get(name)
                        .and_then(|v| v.to_str().ok())
                        .filter(|v| !v.is_empty())
                        .map(str::to_string)
                };
                match (header(CHALLENGE_HEADER), header(REALM_HEADER)) {
                    (Some(token), Some(realm)) => {
                        debug!(realm = %realm, "Received auth challenge");
                        AuthState::Challenged(Challenge { token, realm })
                    }
                    _ => AuthState::Failed(AuthError::MissingChallenge),
                }
            }
            other => AuthState::Failed(AuthError::UnexpectedStatus(other.as_u16())),
        };

        CookieClient::drain(response).await;
        next
    }

    async fn respond(&self, challenge: Challenge) -> AuthState {
        let password = encrypt_password(
            &self.credentials.username,
            &self.credentials.password,
            &challenge,
        );
        let body = LoginRequest {
            login: &self.credentials.username,
            password: &password,
        };

        let request = self.http.post(self.credentials.auth_url()).json(&body);
        let response = match self.http.send(request).await {
            Ok(response) => response,
            Err(e) => return AuthState::Failed(e.into()),
        };

        let status = response.status();
        CookieClient::drain(response).await;

        if status == StatusCode::OK {
            debug!(login = %self.credentials.username, "Authenticated");
            AuthState::Authenticated
        } else {
            AuthState::Failed(AuthError::Rejected(status.as_u16()))
        }
    }
}
