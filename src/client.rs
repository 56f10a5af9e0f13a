use anyhow::{Context, Result, anyhow};
use log::{debug, warn};
use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::header::{ACCEPT, HeaderMap, HeaderName, HeaderValue, RETRY_AFTER};
use reqwest::{Method, Proxy, StatusCode, Url};
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::time::Duration;
use thiserror::Error;

pub const USER_AGENT: &str = concat!("cmk-agents/", env!("CARGO_PKG_VERSION"));

#[derive(Debug, Clone)]
pub struct ResponseData {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: String,
    pub json: Option<Value>,
}

impl ResponseData {
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Deserializes the body into `T`, failing with the endpoint name when
    /// the payload does not have the expected shape.
    pub fn expect_json<T: DeserializeOwned>(&self, what: &str) -> Result<T> {
        let value = self
            .json
            .clone()
            .ok_or_else(|| anyhow!("{what}: response is not JSON: {}", truncate(&self.body)))?;
        serde_json::from_value(value).with_context(|| format!("{what}: unexpected response shape"))
    }
}

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("{}", describe_status(method, url, *status, body))]
    Status {
        method: Method,
        url: String,
        status: u16,
        body: String,
    },
    #[error("authentication failed (401) at {url}; check the credentials or renew the token")]
    Unauthorized { url: String },
    #[error("rate limited (429) at {url}; gave up after {attempts} attempts")]
    RateLimited { url: String, attempts: u32 },
}

impl ApiError {
    pub fn status(&self) -> u16 {
        match self {
            ApiError::Status { status, .. } => *status,
            ApiError::Unauthorized { .. } => 401,
            ApiError::RateLimited { .. } => 429,
        }
    }
}

/// Returns the HTTP status carried by an error chain, if any.
pub fn error_status(err: &anyhow::Error) -> Option<u16> {
    err.downcast_ref::<ApiError>().map(ApiError::status)
}

pub fn is_unauthorized(err: &anyhow::Error) -> bool {
    matches!(
        err.downcast_ref::<ApiError>(),
        Some(ApiError::Unauthorized { .. })
    )
}

pub fn is_timeout(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        cause
            .downcast_ref::<reqwest::Error>()
            .is_some_and(|e| e.is_timeout())
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Auth {
    None,
    Bearer(String),
    Basic { username: String, password: String },
    Header { name: String, value: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProxyMode {
    Environment,
    Disabled,
    Url(String),
}

impl ProxyMode {
    pub fn from_flags(proxy: Option<String>, no_proxy: bool) -> Self {
        match (proxy, no_proxy) {
            (Some(url), _) => ProxyMode::Url(url),
            (None, true) => ProxyMode::Disabled,
            (None, false) => ProxyMode::Environment,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub verify_tls: bool,
    pub timeout: Duration,
    pub connect_timeout: Duration,
    pub proxy: ProxyMode,
    pub accept: &'static str,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            verify_tls: true,
            timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(5),
            proxy: ProxyMode::Environment,
            accept: "application/json",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts while the server keeps answering 429.
    pub max_attempts: u32,
    /// Used when a 429 carries no usable `Retry-After`.
    pub default_retry_after: Duration,
    /// Extra attempts after transport errors and 5xx responses.
    pub transient_retries: u32,
    pub backoff_base: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            default_retry_after: Duration::from_secs(60),
            transient_retries: 3,
            backoff_base: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            default_retry_after: Duration::ZERO,
            transient_retries: 0,
            backoff_base: Duration::ZERO,
        }
    }

    pub fn backoff(&self, retry: u32) -> Duration {
        self.backoff_base
            .saturating_mul(2u32.saturating_pow(retry.saturating_sub(1)))
    }
}

enum Payload {
    Empty,
    Json(Value),
}

#[derive(Debug, Clone)]
pub struct ApiClient {
    base_url: Url,
    http: Client,
    auth: Auth,
    accept: &'static str,
    extra_headers: Vec<(HeaderName, HeaderValue)>,
    retry: RetryPolicy,
    sleeper: fn(Duration),
}

impl ApiClient {
    pub fn new(base_url: &str, auth: Auth, options: &ClientOptions) -> Result<Self> {
        let mut normalized = base_url.trim().to_string();
        if !normalized.ends_with('/') {
            normalized.push('/');
        }
        let parsed = Url::parse(&normalized).context("parsing base URL")?;

        let mut builder = Client::builder()
            .user_agent(HeaderValue::from_static(USER_AGENT))
            .cookie_store(true)
            .danger_accept_invalid_certs(!options.verify_tls)
            .timeout(options.timeout)
            .connect_timeout(options.connect_timeout);
        builder = match &options.proxy {
            ProxyMode::Environment => builder,
            ProxyMode::Disabled => builder.no_proxy(),
            ProxyMode::Url(url) => {
                builder.proxy(Proxy::all(url).with_context(|| format!("invalid proxy `{url}`"))?)
            }
        };
        let http = builder.build().context("building HTTP client")?;

        Ok(Self {
            base_url: parsed,
            http,
            auth,
            accept: options.accept,
            extra_headers: Vec::new(),
            retry: RetryPolicy::default(),
            sleeper: std::thread::sleep,
        })
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_header(mut self, name: &'static str, value: &str) -> Result<Self> {
        let value =
            HeaderValue::from_str(value).with_context(|| format!("invalid value for {name}"))?;
        self.extra_headers
            .push((HeaderName::from_static(name), value));
        Ok(self)
    }

    pub fn with_sleeper(mut self, sleeper: fn(Duration)) -> Self {
        self.sleeper = sleeper;
        self
    }

    pub fn set_auth(&mut self, auth: Auth) {
        self.auth = auth;
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    pub fn sleep(&self, duration: Duration) {
        (self.sleeper)(duration)
    }

    pub fn url(&self, path: &str) -> Result<Url> {
        let normalized = path.trim_start_matches('/');
        self.base_url
            .join(normalized)
            .with_context(|| format!("joining path `{}` to base URL", path))
    }

    pub fn get(&self, path: &str, query: &[(&str, String)]) -> Result<ResponseData> {
        self.request(Method::GET, path, query, Payload::Empty)
    }

    pub fn get_json<T: DeserializeOwned>(&self, path: &str, query: &[(&str, String)]) -> Result<T> {
        self.get(path, query)?.expect_json(path)
    }

    pub fn post_json<T: Serialize + ?Sized>(
        &self,
        path: &str,
        query: &[(&str, String)],
        body: Option<&T>,
    ) -> Result<ResponseData> {
        self.request(Method::POST, path, query, json_payload(body)?)
    }

    pub fn put_json<T: Serialize + ?Sized>(&self, path: &str, body: &T) -> Result<ResponseData> {
        self.request(Method::PUT, path, &[], json_payload(Some(body))?)
    }

    pub fn delete(&self, path: &str) -> Result<ResponseData> {
        self.request(Method::DELETE, path, &[], Payload::Empty)
    }

    /// Sends without turning HTTP error statuses into errors. 429 is still
    /// retried per the policy; the last 429 response is returned as is.
    pub fn send<T: Serialize + ?Sized>(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<&T>,
    ) -> Result<ResponseData> {
        let url = self.url(path)?;
        self.execute(&method, &url, query, &json_payload(body)?)
            .map(|(data, _)| data)
    }

    fn request(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, String)],
        payload: Payload,
    ) -> Result<ResponseData> {
        let url = self.url(path)?;
        let (data, attempts) = self.execute(&method, &url, query, &payload)?;
        match StatusCode::from_u16(data.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR) {
            s if s.is_success() => Ok(data),
            StatusCode::UNAUTHORIZED => Err(ApiError::Unauthorized {
                url: url.to_string(),
            }
            .into()),
            StatusCode::TOO_MANY_REQUESTS => Err(ApiError::RateLimited {
                url: url.to_string(),
                attempts,
            }
            .into()),
            _ => Err(ApiError::Status {
                method,
                url: url.to_string(),
                status: data.status,
                body: data.body,
            }
            .into()),
        }
    }

    fn execute(
        &self,
        method: &Method,
        url: &Url,
        query: &[(&str, String)],
        payload: &Payload,
    ) -> Result<(ResponseData, u32)> {
        let mut attempts = 0u32;
        let mut transient = 0u32;

        loop {
            attempts += 1;
            debug!("{} {}", method, url);
            match self.build(method, url, query, payload).send() {
                Ok(resp) => {
                    let status = resp.status();
                    if status == StatusCode::TOO_MANY_REQUESTS && attempts < self.retry.max_attempts
                    {
                        let wait = retry_after(resp.headers())
                            .unwrap_or(self.retry.default_retry_after);
                        warn!(
                            "rate limited at {} (attempt {}/{}), retrying in {}s",
                            url,
                            attempts,
                            self.retry.max_attempts,
                            wait.as_secs()
                        );
                        self.sleep(wait);
                        continue;
                    }
                    if status.is_server_error() && transient < self.retry.transient_retries {
                        transient += 1;
                        let wait = self.retry.backoff(transient);
                        warn!("HTTP {} at {}, retrying in {:?}", status, url, wait);
                        self.sleep(wait);
                        continue;
                    }
                    return Ok((read_response(resp)?, attempts));
                }
                Err(err) => {
                    if transient < self.retry.transient_retries
                        && (err.is_timeout() || err.is_connect())
                    {
                        transient += 1;
                        let wait = self.retry.backoff(transient);
                        warn!("{} failed: {}, retrying in {:?}", url, err, wait);
                        self.sleep(wait);
                        continue;
                    }
                    return Err(anyhow::Error::new(err))
                        .with_context(|| format!("sending {} {}", method, url));
                }
            }
        }
    }

    fn build(
        &self,
        method: &Method,
        url: &Url,
        query: &[(&str, String)],
        payload: &Payload,
    ) -> RequestBuilder {
        let mut request = self
            .http
            .request(method.clone(), url.clone())
            .header(ACCEPT, HeaderValue::from_static(self.accept));

        request = match &self.auth {
            Auth::None => request,
            Auth::Bearer(token) => request.bearer_auth(token),
            Auth::Basic { username, password } => request.basic_auth(username, Some(password)),
            Auth::Header { name, value } => request.header(name.as_str(), value.as_str()),
        };

        for (name, value) in &self.extra_headers {
            request = request.header(name.clone(), value.clone());
        }

        if !query.is_empty() {
            request = request.query(query);
        }

        match payload {
            Payload::Empty => request,
            Payload::Json(body) => request.json(body),
        }
    }
}

fn json_payload<T: Serialize + ?Sized>(body: Option<&T>) -> Result<Payload> {
    match body {
        Some(body) => Ok(Payload::Json(
            serde_json::to_value(body).context("encoding request body")?,
        )),
        None => Ok(Payload::Empty),
    }
}

fn read_response(response: Response) -> Result<ResponseData> {
    let status = response.status().as_u16();
    let headers = response.headers().clone();
    let text = response.text().context("reading response body")?;
    let json = serde_json::from_str(&text).ok();

    Ok(ResponseData {
        status,
        headers,
        body: text,
        json,
    })
}

pub fn retry_after(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

fn truncate(body: &str) -> String {
    if body.chars().count() > 200 {
        format!("{}...", body.chars().take(200).collect::<String>())
    } else {
        body.to_string()
    }
}

fn describe_status(method: &Method, url: &str, status: u16, body: &str) -> String {
    match status {
        403 => format!(
            "Access denied (403) for {} {}\n\nPossible causes:\n  • The account lacks the required role\n  • The API token was issued for another scope",
            method, url
        ),
        404 => format!(
            "Resource not found (404) at {}\n\nPossible causes:\n  • Wrong base URL or API version\n  • The database, node, item or device does not exist",
            url
        ),
        s if s >= 500 => format!(
            "Server error ({}) at {}\n\nThe remote API failed; retry later.\n\nResponse: {}",
            s,
            url,
            truncate(body)
        ),
        s => {
            let mut msg = format!("HTTP {} for {} {}", s, method, url);
            if let Ok(json) = serde_json::from_str::<Value>(body)
                && let Some(detail) = json
                    .get("message")
                    .or_else(|| json.get("error_message"))
                    .or_else(|| json.get("error"))
                    .and_then(|m| m.as_str())
            {
                msg.push_str(&format!("\n\nError: {}", detail));
            } else if !body.is_empty() {
                msg.push_str(&format!("\n\nResponse: {}", truncate(body)));
            }
            msg
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use httpmock::prelude::*;
    use serde_json::json;

    fn client(server: &MockServer, auth: Auth) -> ApiClient {
        ApiClient::new(&server.base_url(), auth, &ClientOptions::default())
            .unwrap()
            .with_sleeper(|_| {})
    }

    #[test]
    fn sends_bearer_token_and_parses_json() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(GET)
                .path("/api/v1/database")
                .header("Authorization", "Bearer test-key");
            then.status(200).json_body(json!(["/api/v1/database/DB1"]));
        });

        let client = client(&server, Auth::Bearer("test-key".into()));
        let response = client.get("/api/v1/database", &[]).unwrap();

        mock.assert();
        assert_eq!(response.status, 200);
        assert_eq!(response.json.unwrap()[0], "/api/v1/database/DB1");
    }

    #[test]
    fn keeps_base_path_when_joining() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(GET)
                .path("/rest/v1/system")
                .header("Authorization", "Basic dTpw");
            then.status(200).json_body(json!({"ok": true}));
        });

        let base = format!("{}/rest/v1", server.base_url());
        let client = ApiClient::new(
            &base,
            Auth::Basic {
                username: "u".into(),
                password: "p".into(),
            },
            &ClientOptions::default(),
        )
        .unwrap();
        client.get("system", &[]).unwrap();
        mock.assert();
    }

    #[test]
    fn posts_json_body_with_custom_header_auth() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(POST)
                .path("/api/v2/messages/sms")
                .header("access-token", "secret")
                .json_body(json!({"to": ["+49123"], "text": "hi"}));
            then.status(200).body(r#"{"status": "queued"}"#);
        });

        let client = client(
            &server,
            Auth::Header {
                name: "access-token".into(),
                value: "secret".into(),
            },
        );
        let response = client
            .post_json(
                "/api/v2/messages/sms",
                &[],
                Some(&json!({"to": ["+49123"], "text": "hi"})),
            )
            .unwrap();

        mock.assert();
        assert_eq!(response.json.unwrap()["status"], "queued");
    }

    #[test]
    fn puts_and_deletes() {
        let server = MockServer::start();
        let put = server.mock(|when, then| {
            when.method(PUT)
                .path("/api/item/7")
                .json_body(json!({"Description": "pump"}));
            then.status(200).json_body(json!({"ok": true}));
        });
        let delete = server.mock(|when, then| {
            when.method(DELETE).path("/api/item/7");
            then.status(204);
        });

        let api = client(&server, Auth::None);
        let updated = api
            .put_json("api/item/7", &json!({"Description": "pump"}))
            .unwrap();
        assert_eq!(updated.json, Some(json!({"ok": true})));
        assert_eq!(api.delete("api/item/7").unwrap().status, 204);
        put.assert();
        delete.assert();
    }

    #[test]
    fn gives_up_after_max_rate_limited_attempts() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(GET).path("/devices");
            then.status(429).header("Retry-After", "1");
        });

        let client = client(&server, Auth::None);
        let err = client.get("/devices", &[]).unwrap_err();

        mock.assert_hits(5);
        assert_eq!(error_status(&err), Some(429));
        assert!(err.to_string().contains("gave up after 5 attempts"));
    }

    #[test]
    fn send_returns_error_statuses_without_failing() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/devices");
            then.status(429)
                .header("RateLimit-Remaining", "0")
                .header("RateLimit-Reset", "42");
        });

        let client = client(&server, Auth::None).with_retry(RetryPolicy::none());
        let response = client
            .send(Method::GET, "/devices", &[], Option::<&Value>::None)
            .unwrap();
        assert_eq!(response.status, 429);
        assert_eq!(response.header("ratelimit-reset"), Some("42"));
    }

    #[test]
    fn retries_server_errors_then_reports_status() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(GET).path("/flaky");
            then.status(503).body("down");
        });

        let client = client(&server, Auth::None);
        let err = client.get("/flaky", &[]).unwrap_err();

        mock.assert_hits(4);
        assert_eq!(error_status(&err), Some(503));
        assert!(err.to_string().contains("Server error (503)"));
    }

    #[test]
    fn maps_unauthorized_and_not_found() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/secret");
            then.status(401);
        });
        server.mock(|when, then| {
            when.method(GET).path("/missing");
            then.status(404);
        });

        let client = client(&server, Auth::None);
        assert!(is_unauthorized(&client.get("/secret", &[]).unwrap_err()));
        let err = client.get("/missing", &[]).unwrap_err();
        assert!(err.to_string().contains("Resource not found (404)"));
    }

    #[test]
    fn expect_json_reports_shape_errors() {
        let server = MockServer::start();
        server.mock(|when, then| {
            when.method(GET).path("/list");
            then.status(200).json_body(json!({"not": "a list"}));
        });

        let client = client(&server, Auth::None);
        let err = client.get_json::<Vec<String>>("/list", &[]).unwrap_err();
        assert!(err.to_string().contains("unexpected response shape"));
    }

    #[test]
    fn sends_configured_accept_and_fixed_user_agent() {
        let server = MockServer::start();
        let mock = server.mock(|when, then| {
            when.method(GET)
                .path("/api/v1/database")
                .header("accept", "text/plain")
                .header("user-agent", USER_AGENT);
            then.status(200).body("DB1");
        });
        let options = ClientOptions {
            accept: "text/plain",
            proxy: ProxyMode::from_flags(None, true),
            ..Default::default()
        };
        assert_eq!(options.proxy, ProxyMode::Disabled);
        let api = ApiClient::new(&server.base_url(), Auth::None, &options).unwrap();
        assert_eq!(api.get("api/v1/database", &[]).unwrap().body, "DB1");
        mock.assert();

        assert_eq!(
            ProxyMode::from_flags(Some("http://proxy:3128".into()), true),
            ProxyMode::Url("http://proxy:3128".into())
        );
        assert_eq!(ProxyMode::from_flags(None, false), ProxyMode::Environment);
        assert_eq!(RetryPolicy::none().transient_retries, 0);
    }

    #[test]
    fn backoff_doubles() {
        let policy = RetryPolicy::default();
        assert_eq!(policy.backoff(1), Duration::from_secs(1));
        assert_eq!(policy.backoff(2), Duration::from_secs(2));
        assert_eq!(policy.backoff(3), Duration::from_secs(4));
    }

    #[test]
    fn parses_retry_after_seconds_only() {
        let mut headers = HeaderMap::new();
        assert_eq!(retry_after(&headers), None);
        headers.insert(RETRY_AFTER, HeaderValue::from_static("7"));
        assert_eq!(retry_after(&headers), Some(Duration::from_secs(7)));
        headers.insert(RETRY_AFTER, HeaderValue::from_static("soon"));
        assert_eq!(retry_after(&headers), None);
    }
}
