//! Authenticated client for the router's RCI API.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use reqwest::header::{ACCEPT, ACCEPT_LANGUAGE, COOKIE, SET_COOKIE};
use reqwest::{RequestBuilder, Response, StatusCode, Url};
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, trace, warn};

use crate::auth::{Authenticator, Credentials};
use crate::config::ParamValue;
use crate::error::{AuthError, ClientError, Result};
use crate::session::{Session, SessionStore};

const ACCEPT_VALUE: &str = "application/json, text/plain, */*";
const ACCEPT_LANGUAGE_VALUE: &str = "en-US,en;q=0.9";

/// Default timeout for a single request to the router.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

/// HTTP client that attaches the stored session cookies to every request
/// and records any cookies the router sets in return.
pub struct CookieClient {
    http: reqwest::Client,
    store: Arc<dyn SessionStore>,
    // Held across each request/response so that concurrent callers cannot
    // interleave their load/save of the store.
    lock: Mutex<()>,
}

impl CookieClient {
    pub fn new(http: reqwest::Client, store: Arc<dyn SessionStore>) -> Self {
        Self {
            http,
            store,
            lock: Mutex::new(()),
        }
    }

    pub fn get<U: reqwest::IntoUrl>(&self, url: U) -> RequestBuilder {
        self.http.get(url)
    }

    pub fn post<U: reqwest::IntoUrl>(&self, url: U) -> RequestBuilder {
        self.http.post(url)
    }

    /// Send a request with the current session and persist returned cookies.
    ///
    /// A session that cannot be saved is logged; the response is still returned.
    pub async fn send(
        &self,
        request: RequestBuilder,
    ) -> std::result::Result<Response, reqwest::Error> {
        let _guard = self.lock.lock().await;

        let cookie = self.load_session().await.header_value();
        let mut request = request
            .header(ACCEPT, ACCEPT_VALUE)
            .header(ACCEPT_LANGUAGE, ACCEPT_LANGUAGE_VALUE);
        if !cookie.is_empty() {
            request = request.header(COOKIE, cookie);
        }

        let response = request.send().await?;
        trace!(url = %response.url(), status = %response.status(), "Router response");

        let set_cookies: Vec<String> = response
            .headers()
            .get_all(SET_COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .map(str::to_string)
            .collect();
        if !set_cookies.is_empty() {
            let mut session = self.load_session().await;
            session.apply_set_cookies(set_cookies.iter().map(String::as_str));
            self.save_session(session).await;
        }

        Ok(response)
    }

    async fn load_session(&self) -> Session {
        let store = Arc::clone(&self.store);
        match tokio::task::spawn_blocking(move || store.load()).await {
            Ok(session) => session,
            Err(e) => {
                warn!(error = %e, "Session load task failed");
                Session::new()
            }
        }
    }

    async fn save_session(&self, session: Session) {
        let store = Arc::clone(&self.store);
        match tokio::task::spawn_blocking(move || store.save(&session)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "Failed to save session"),
            Err(e) => warn!(error = %e, "Session save task failed"),
        }
    }

    /// Read a response body to the end so the connection can be reused.
    pub async fn drain(response: Response) {
        let _ = response.bytes().await;
    }
}

/// Client for the router's `/rci/show/...` endpoints.
pub struct KeeneticClient {
    credentials: Credentials,
    http: CookieClient,
}

impl KeeneticClient {
    /// Create a client with the default request timeout.
    pub fn new(credentials: Credentials, store: Arc<dyn SessionStore>) -> Result<Self> {
        Self::with_timeout(credentials, store, DEFAULT_TIMEOUT)
    }

    /// Create a client with a custom request timeout.
    pub fn with_timeout(
        credentials: Credentials,
        store: Arc<dyn SessionStore>,
        timeout: Duration,
    ) -> Result<Self> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            credentials,
            http: CookieClient::new(http, store),
        })
    }

    pub fn credentials(&self) -> &Credentials {
        &self.credentials
    }

    /// Run the authentication handshake.
    pub async fn authenticate(&self) -> std::result::Result<(), AuthError> {
        Authenticator::new(&self.credentials, &self.http).run().await
    }

    /// Build the URL for a `show` command such as `"ip hotspot"`.
    ///
    /// Only the first space becomes a path separator.
    pub fn metric_url(&self, path: &str, params: &BTreeMap<String, ParamValue>) -> Result<Url> {
        let raw = format!(
            "{}/rci/show/{}",
            self.credentials.endpoint(),
            path.replacen(' ', "/", 1)
        );
        let mut url = Url::parse(&raw).map_err(|e| ClientError::InvalidUrl(format!("{}: {}", raw, e)))?;

        if !params.is_empty() {
            let mut query = url.query_pairs_mut();
            for (key, value) in params {
                query.append_pair(key, &value.to_string());
            }
        }

        Ok(url)
    }

    /// Authenticate and fetch the JSON document behind `path`.
    pub async fn fetch_metric(
        &self,
        path: &str,
        params: &BTreeMap<String, ParamValue>,
    ) -> Result<Value> {
        self.authenticate()
            .await
            .map_err(ClientError::NoConnection)?;

        let url = self.metric_url(path, params)?;
        debug!(url = %url, "Fetching metric");

        let response = self.http.send(self.http.get(url)).await?;
        let status = response.status();

        if status == StatusCode::OK {
            let body = response.bytes().await?;
            return serde_json::from_slice(&body).map_err(ClientError::InvalidJson);
        }

        let body = response.text().await?;
        Err(ClientError::Api {
            status: status.as_u16(),
            body,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SessionError;
    use crate::session::{FileSessionStore, MemorySessionStore, Session};
    use mockito::Matcher;
    use serde_json::json;

    fn skip_auth_client(url: &str, store: Arc<MemorySessionStore>) -> KeeneticClient {
        let credentials = Credentials::new(url, "admin", "secret").with_skip_auth(true);
        KeeneticClient::new(credentials, store).unwrap()
    }

    fn params(pairs: &[(&str, ParamValue)]) -> BTreeMap<String, ParamValue> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn test_metric_url_replaces_first_space() {
        let client = skip_auth_client("http://router", Arc::new(MemorySessionStore::new()));
        let url = client.metric_url("ip hotspot", &BTreeMap::new()).unwrap();
        assert_eq!(url.as_str(), "http://router/rci/show/ip/hotspot");

        let url = client
            .metric_url("interface stat extra", &BTreeMap::new())
            .unwrap();
        assert_eq!(url.as_str(), "http://router/rci/show/interface/stat%20extra");
    }

    #[test]
    fn test_metric_url_with_params() {
        let client = skip_auth_client("http://router/", Arc::new(MemorySessionStore::new()));
        let url = client
            .metric_url(
                "interface stat",
                &params(&[
                    ("name", ParamValue::Text("Wireguard 0".to_string())),
                    ("limit", ParamValue::Integer(5)),
                ]),
            )
            .unwrap();
        assert_eq!(
            url.as_str(),
            "http://router/rci/show/interface/stat?limit=5&name=Wireguard+0"
        );
    }

    #[tokio::test]
    async fn test_fetch_metric_success_sends_cookies() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/rci/show/system")
            .match_header("cookie", "sid=abc")
            .match_header("accept", ACCEPT_VALUE)
            .match_header("accept-language", ACCEPT_LANGUAGE_VALUE)
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"cpuload": 12, "memory": "100/200"}"#)
            .create_async()
            .await;

        let store = Arc::new(MemorySessionStore::new());
        store
            .save(&[("sid", "abc")].into_iter().collect::<Session>())
            .unwrap();

        let client = skip_auth_client(&server.url(), store);
        let doc = client.fetch_metric("system", &BTreeMap::new()).await.unwrap();

        assert_eq!(doc, json!({"cpuload": 12, "memory": "100/200"}));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_fetch_metric_omits_empty_cookie_header() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/rci/show/system")
            .match_header("cookie", Matcher::Missing)
            .with_status(200)
            .with_body("{}")
            .create_async()
            .await;

        let client = skip_auth_client(&server.url(), Arc::new(MemorySessionStore::new()));
        client.fetch_metric("system", &BTreeMap::new()).await.unwrap();
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_fetch_metric_api_error() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/rci/show/ip/hotspot")
            .with_status(404)
            .with_header("Set-Cookie", "sid=kept; Path=/")
            .with_body("no such command")
            .create_async()
            .await;

        let store = Arc::new(MemorySessionStore::new());
        let client = skip_auth_client(&server.url(), store.clone());
        let err = client
            .fetch_metric("ip hotspot", &BTreeMap::new())
            .await
            .unwrap_err();

        assert_eq!(err.status(), Some(404));
        assert_eq!(err.to_string(), "API error: 404 - no such command");
        // Cookies are recorded even when the request fails.
        assert_eq!(store.load().get("sid"), Some("kept"));
    }

    #[tokio::test]
    async fn test_fetch_metric_recovers_from_corrupt_session_file() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/rci/show/system")
            .with_status(200)
            .with_header("Set-Cookie", "sid=new; Path=/")
            .with_body(r#"{"cpuload": 1}"#)
            .expect(3)
            .create_async()
            .await;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cookies.json");
        std::fs::write(&path, "").unwrap();

        let credentials = Credentials::new(server.url(), "admin", "secret").with_skip_auth(true);
        let client =
            KeeneticClient::new(credentials, Arc::new(FileSessionStore::new(&path))).unwrap();

        for _ in 0..3 {
            let doc = client.fetch_metric("system", &BTreeMap::new()).await.unwrap();
            assert_eq!(doc, json!({"cpuload": 1}));
        }

        mock.assert_async().await;
        let content = std::fs::read_to_string(&path).unwrap();
        assert_eq!(content, "{\n  \"sid\": \"new\"\n}");
    }

    /// Store whose saves always fail.
    struct ReadOnlyStore;

    impl SessionStore for ReadOnlyStore {
        fn load(&self) -> Session {
            Session::new()
        }

        fn save(&self, _session: &Session) -> std::result::Result<(), SessionError> {
            Err(SessionError::Io(std::io::Error::new(
                std::io::ErrorKind::PermissionDenied,
                "read-only",
            )))
        }
    }

    #[tokio::test]
    async fn test_fetch_metric_survives_session_save_failure() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/rci/show/system")
            .with_status(200)
            .with_header("Set-Cookie", "sid=new")
            .with_body(r#"{"uptime": 10}"#)
            .create_async()
            .await;

        let credentials = Credentials::new(server.url(), "admin", "secret").with_skip_auth(true);
        let client = KeeneticClient::new(credentials, Arc::new(ReadOnlyStore)).unwrap();

        let doc = client.fetch_metric("system", &BTreeMap::new()).await.unwrap();
        assert_eq!(doc, json!({"uptime": 10}));
    }

    #[tokio::test]
    async fn test_fetch_metric_invalid_json() {
        let mut server = mockito::Server::new_async().await;
        let _mock = server
            .mock("GET", "/rci/show/system")
            .with_status(200)
            .with_body("<html>")
            .create_async()
            .await;

        let client = skip_auth_client(&server.url(), Arc::new(MemorySessionStore::new()));
        let err = client
            .fetch_metric("system", &BTreeMap::new())
            .await
            .unwrap_err();
        assert!(matches!(err, ClientError::InvalidJson(_)));
    }

    #[tokio::test]
    async fn test_fetch_metric_auth_failure_is_no_connection() {
        let mut server = mockito::Server::new_async().await;
        let _auth = server
            .mock("GET", "/auth")
            .with_status(503)
            .create_async()
            .await;
        let metric = server
            .mock("GET", "/rci/show/system")
            .expect(0)
            .create_async()
            .await;

        let credentials = Credentials::new(server.url(), "admin", "secret");
        let client =
            KeeneticClient::new(credentials, Arc::new(MemorySessionStore::new())).unwrap();
        let err = client
            .fetch_metric("system", &BTreeMap::new())
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            ClientError::NoConnection(AuthError::UnexpectedStatus(503))
        ));
        metric.assert_async().await;
    }

    #[tokio::test]
    async fn test_fetch_metric_reauthenticates_every_call() {
        let mut server = mockito::Server::new_async().await;
        let auth = server
            .mock("GET", "/auth")
            .with_status(200)
            .expect(2)
            .create_async()
            .await;
        let _metric = server
            .mock("GET", "/rci/show/system")
            .with_status(200)
            .with_body("{}")
            .create_async()
            .await;

        let credentials = Credentials::new(server.url(), "admin", "secret");
        let client =
            KeeneticClient::new(credentials, Arc::new(MemorySessionStore::new())).unwrap();
        client.fetch_metric("system", &BTreeMap::new()).await.unwrap();
        client.fetch_metric("system", &BTreeMap::new()).await.unwrap();

        auth.assert_async().await;
    }
}
