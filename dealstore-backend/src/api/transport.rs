//! Authenticated transport shared by both API clients.
//!
//! Every request carries the session token in a fixed header. Endpoints on
//! port 443 are always reached over TLS. Failures are returned unchanged;
//! retry policy belongs to callers.

use std::fmt;
use std::time::Duration;

use reqwest::header::{HeaderName, HeaderValue};
use reqwest::{Client, Method, RequestBuilder};

use super::ApiError;

/// Header the gateway reads the session token from.
pub const GATEWAY_AUTH_HEADER: &str = "x-ipfs-ffs-auth";
/// Header the deal API reads the session token from.
pub const DEAL_AUTH_HEADER: &str = "x-ffs-token";

const SECURE_PORT: u16 = 443;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Credentials presented on every call.
#[derive(Clone)]
pub struct Session {
    token: String,
}

impl Session {
    pub fn new(token: impl Into<String>) -> Self {
        Self { token: token.into() }
    }

    pub fn token(&self) -> &str {
        &self.token
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session").field("token", &"<redacted>").finish()
    }
}

#[derive(Clone)]
pub struct AuthTransport {
    client: Client,
    base_url: String,
    auth_header: HeaderName,
}

impl AuthTransport {
    pub fn new(addr: &str, auth_header: &'static str) -> Result<Self, ApiError> {
        let client = Client::builder().connect_timeout(CONNECT_TIMEOUT).build()?;
        Ok(Self {
            client,
            base_url: base_url(addr)?,
            auth_header: HeaderName::from_static(auth_header),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Start a request to `path` on this endpoint, authenticated as `session`.
    pub fn request(
        &self,
        session: &Session,
        method: Method,
        path: &str,
    ) -> Result<RequestBuilder, ApiError> {
        let mut value =
            HeaderValue::from_str(session.token()).map_err(|_| ApiError::InvalidToken)?;
        value.set_sensitive(true);
        let url = format!("{}/{}", self.base_url, path.trim_start_matches('/'));
        Ok(self
            .client
            .request(method, url)
            .header(self.auth_header.clone(), value))
    }
}

/// Turn `host:port` into a base URL, choosing TLS for the secure port.
pub fn base_url(addr: &str) -> Result<String, ApiError> {
    let invalid = || ApiError::InvalidAddress(addr.to_string());
    let (host, port) = addr.split_once(':').ok_or_else(invalid)?;
    if host.is_empty() || port.contains(':') {
        return Err(invalid());
    }
    let port: u16 = port.parse().map_err(|_| invalid())?;
    let scheme = if port == SECURE_PORT { "https" } else { "http" };
    Ok(format!("{}://{}:{}", scheme, host, port))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_base_url_scheme() {
        assert_eq!(base_url("gateway.example.net:443").unwrap(), "https://gateway.example.net:443");
        assert_eq!(base_url("127.0.0.1:5001").unwrap(), "http://127.0.0.1:5001");
        assert_eq!(base_url("api.example.net:6002").unwrap(), "http://api.example.net:6002");
    }

    #[test]
    fn test_base_url_rejects_malformed() {
        assert!(base_url("gateway.example.net").is_err());
        assert!(base_url(":443").is_err());
        assert!(base_url("a:b:443").is_err());
        assert!(base_url("gateway:https").is_err());
    }

    #[test]
    fn test_request_carries_token() {
        let transport = AuthTransport::new("gateway.example.net:443", GATEWAY_AUTH_HEADER).unwrap();
        let req = transport
            .request(&Session::new("s3cr3t"), Method::POST, "/api/v0/files/ls")
            .unwrap()
            .build()
            .unwrap();
        assert_eq!(req.url().scheme(), "https");
        assert_eq!(req.url().path(), "/api/v0/files/ls");
        let value = req.headers().get(GATEWAY_AUTH_HEADER).unwrap();
        assert_eq!(value.to_str().unwrap(), "s3cr3t");
        assert!(value.is_sensitive());
        assert!(req.body().is_none());
    }

    #[test]
    fn test_plain_port_stays_http() {
        let transport = AuthTransport::new("localhost:6002", DEAL_AUTH_HEADER).unwrap();
        let req = transport
            .request(&Session::new("tok"), Method::GET, "v1/storage-jobs/j1")
            .unwrap()
            .build()
            .unwrap();
        assert_eq!(req.url().as_str(), "http://localhost:6002/v1/storage-jobs/j1");
        assert!(req.headers().get(DEAL_AUTH_HEADER).is_some());
    }

    #[test]
    fn test_invalid_token_rejected() {
        let transport = AuthTransport::new("localhost:6002", DEAL_AUTH_HEADER).unwrap();
        let result = transport.request(&Session::new("bad\ntoken"), Method::GET, "/");
        assert!(matches!(result, Err(ApiError::InvalidToken)));
    }

    #[test]
    fn test_session_debug_redacts_token() {
        let dbg = format!("{:?}", Session::new("s3cr3t"));
        assert!(!dbg.contains("s3cr3t"));
    }
}
