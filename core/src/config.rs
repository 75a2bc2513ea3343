//! Backend configuration and endpoint URL resolution.
//!
//! The configuration is read once at startup from `BACKEND_URL` (`host:port`,
//! no scheme) and `USE_HTTPS` (`"0"` or `"1"`). Everything else derives from it.

use url::Url;

use crate::errors::ConfigError;

pub const DEFAULT_BACKEND_HOST: &str = "localhost:1294";

pub const BACKEND_URL_VAR: &str = "BACKEND_URL";
pub const USE_HTTPS_VAR: &str = "USE_HTTPS";

/// Process-wide backend location. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Configuration {
    backend_host: String,
    use_secure_transport: bool,
}

impl Configuration {
    pub fn new(backend_host: impl Into<String>, use_secure_transport: bool) -> Result<Self, ConfigError> {
        let backend_host = backend_host.into().trim().to_string();
        if backend_host.is_empty() {
            return Err(ConfigError::EmptyHost);
        }
        Ok(Self { backend_host, use_secure_transport })
    }

    /// Builds the configuration from a key lookup, applying the defaults.
    ///
    /// Native bindings pass `std::env::var`, the browser binding passes values
    /// captured at build time.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let host = lookup(BACKEND_URL_VAR)
            .filter(|h| !h.is_empty())
            .unwrap_or_else(|| DEFAULT_BACKEND_HOST.to_string());

        let secure = match lookup(USE_HTTPS_VAR).as_deref() {
            None | Some("") | Some("0") => false,
            Some("1") => true,
            Some(other) => {
                return Err(ConfigError::InvalidSecureFlag { value: other.to_string() });
            }
        };

        Self::new(host, secure)
    }

    pub fn backend_host(&self) -> &str {
        &self.backend_host
    }

    pub fn use_secure_transport(&self) -> bool {
        self.use_secure_transport
    }

    pub fn http_base(&self) -> String {
        let scheme = if self.use_secure_transport { "https" } else { "http" };
        format!("{scheme}://{}", self.backend_host)
    }

    pub fn ws_base(&self) -> String {
        let scheme = if self.use_secure_transport { "wss" } else { "ws" };
        format!("{scheme}://{}", self.backend_host)
    }
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            backend_host: DEFAULT_BACKEND_HOST.to_string(),
            use_secure_transport: false,
        }
    }
}

/// The WebSocket channels exposed by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Endpoint {
    /// Main conversation channel.
    Conversation,
    /// Tool/command event stream.
    Tools,
    /// Product-info event stream.
    ProductInfo,
}

impl Endpoint {
    pub fn path(&self) -> &'static str {
        match self {
            Endpoint::Conversation => "/ws",
            Endpoint::Tools => "/ws/tools",
            Endpoint::ProductInfo => "/ws/product_info",
        }
    }

    /// Every backend channel is scoped to a user id.
    pub fn is_user_scoped(&self) -> bool {
        true
    }
}

impl std::fmt::Display for Endpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.path())
    }
}

/// Maps logical endpoint paths to fully-qualified URLs. Pure, no I/O.
#[derive(Debug, Clone, Default)]
pub struct EndpointResolver {
    config: Configuration,
}

impl EndpointResolver {
    pub fn new(config: Configuration) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &Configuration {
        &self.config
    }

    /// `user_id` is appended as a `user_id` query parameter when present and non-empty.
    pub fn resolve_ws_url(&self, path: &str, user_id: Option<&str>) -> Result<Url, ConfigError> {
        let mut url = self.join(&self.config.ws_base(), path)?;
        if let Some(id) = user_id.filter(|id| !id.is_empty()) {
            url.query_pairs_mut().append_pair("user_id", id);
        }
        Ok(url)
    }

    pub fn resolve_http_url(&self, path: &str) -> Result<Url, ConfigError> {
        self.join(&self.config.http_base(), path)
    }

    fn join(&self, base: &str, path: &str) -> Result<Url, ConfigError> {
        let raw = if path.starts_with('/') {
            format!("{base}{path}")
        } else {
            format!("{base}/{path}")
        };
        Url::parse(&raw).map_err(|e| ConfigError::InvalidHost {
            host: self.config.backend_host.clone(),
            reason: e.to_string(),
        })
    }
}
