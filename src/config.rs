//! Session configuration.
//!
//! A [`SessionConfig`] is what callers hand to
//! [`SessionContext::open`](crate::SessionContext::open). It deserializes from
//! JSON, so it can be kept in a file next to the binary:
//!
//! ```json
//! {
//!   "iceServers": ["stun:stun.l.google.com:19302"],
//!   "mediaConstraints": { "audio": true, "video": false },
//!   "negotiationTimeoutMs": 10000
//! }
//! ```

use std::{fmt, path::Path, time::Duration};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{FacadeError, Result};

const DEFAULT_NEGOTIATION_TIMEOUT_MS: u64 = 10_000;

/// Configuration for one session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionConfig {
    /// Relay endpoints (STUN/TURN). At least one must be usable.
    #[serde(default)]
    pub ice_servers: Vec<IceServer>,
    #[serde(default)]
    pub media_constraints: MediaConstraints,
    /// Deadline for a single `negotiate` call.
    #[serde(default = "default_negotiation_timeout_ms")]
    pub negotiation_timeout_ms: u64,
}

fn default_negotiation_timeout_ms() -> u64 {
    DEFAULT_NEGOTIATION_TIMEOUT_MS
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec![],
            media_constraints: MediaConstraints::default(),
            negotiation_timeout_ms: DEFAULT_NEGOTIATION_TIMEOUT_MS,
        }
    }
}

impl SessionConfig {
    /// Config with the given server URLs and default media constraints.
    pub fn with_servers<I, S>(urls: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            ice_servers: urls.into_iter().map(IceServer::new).collect(),
            ..Default::default()
        }
    }

    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(|e| FacadeError::Configuration(e.to_string()))
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .map_err(|e| FacadeError::Configuration(format!("{}: {}", path.display(), e)))?;
        Self::from_json(&json)
    }

    pub fn negotiation_timeout(&self) -> Duration {
        Duration::from_millis(self.negotiation_timeout_ms)
    }

    /// Returns every usable endpoint, skipping the unusable ones.
    ///
    /// Fails with [`FacadeError::Configuration`] when nothing usable is left,
    /// or when the negotiation timeout is zero.
    pub fn usable_endpoints(&self) -> Result<Vec<IceEndpoint>> {
        if self.negotiation_timeout_ms == 0 {
            return Err(FacadeError::Configuration(
                "negotiation timeout must be non-zero".into(),
            ));
        }

        let mut endpoints = vec![];
        for server in &self.ice_servers {
            for url in &server.urls {
                match IceEndpoint::parse(url, server) {
                    Ok(endpoint) => {
                        debug!("Usable ICE endpoint: {}", endpoint);
                        endpoints.push(endpoint);
                    }
                    Err(reason) => warn!("Skipping ICE server '{}': {}", url, reason),
                }
            }
        }

        if endpoints.is_empty() {
            return Err(FacadeError::Configuration(
                "no usable transport endpoints supplied".into(),
            ));
        }

        Ok(endpoints)
    }
}

/// Audio/video enable flags. With both disabled the session only carries the
/// control channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct MediaConstraints {
    pub audio: bool,
    pub video: bool,
}

impl Default for MediaConstraints {
    fn default() -> Self {
        Self {
            audio: true,
            video: false,
        }
    }
}

/// One STUN/TURN server entry.
///
/// In JSON this is either a bare URL string or an object with `urls`,
/// `username` and `credential`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "IceServerRepr")]
pub struct IceServer {
    pub urls: Vec<String>,
    pub username: Option<String>,
    pub credential: Option<String>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum IceServerRepr {
    Url(String),
    Full {
        #[serde(alias = "url")]
        urls: UrlList,
        #[serde(default)]
        username: Option<String>,
        #[serde(default)]
        credential: Option<String>,
    },
}

#[derive(Deserialize)]
#[serde(untagged)]
enum UrlList {
    One(String),
    Many(Vec<String>),
}

impl From<IceServerRepr> for IceServer {
    fn from(repr: IceServerRepr) -> Self {
        match repr {
            IceServerRepr::Url(url) => IceServer::new(url),
            IceServerRepr::Full {
                urls,
                username,
                credential,
            } => IceServer {
                urls: match urls {
                    UrlList::One(u) => vec![u],
                    UrlList::Many(v) => v,
                },
                username,
                credential,
            },
        }
    }
}

impl IceServer {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            username: None,
            credential: None,
        }
    }

    pub fn turn(
        url: impl Into<String>,
        username: impl Into<String>,
        credential: impl Into<String>,
    ) -> Self {
        Self {
            urls: vec![url.into()],
            username: Some(username.into()),
            credential: Some(credential.into()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceScheme {
    Stun,
    Stuns,
    Turn,
    Turns,
}

impl IceScheme {
    pub fn is_relay(self) -> bool {
        matches!(self, IceScheme::Turn | IceScheme::Turns)
    }

    fn as_str(self) -> &'static str {
        match self {
            IceScheme::Stun => "stun",
            IceScheme::Stuns => "stuns",
            IceScheme::Turn => "turn",
            IceScheme::Turns => "turns",
        }
    }
}

/// A validated STUN/TURN endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IceEndpoint {
    pub scheme: IceScheme,
    pub host: String,
    pub port: Option<u16>,
    pub username: Option<String>,
    pub credential: Option<String>,
}

impl IceEndpoint {
    /// Parses `url`, taking credentials from `server`. A URL without a scheme
    /// is treated as STUN.
    fn parse(url: &str, server: &IceServer) -> std::result::Result<Self, String> {
        let url = url.trim();
        let (scheme, rest) = match url.split_once(':') {
            Some(("stun", rest)) => (IceScheme::Stun, rest),
            Some(("stuns", rest)) => (IceScheme::Stuns, rest),
            Some(("turn", rest)) => (IceScheme::Turn, rest),
            Some(("turns", rest)) => (IceScheme::Turns, rest),
            Some((other, rest)) if other.contains('.') || rest.parse::<u16>().is_ok() => {
                (IceScheme::Stun, url)
            }
            Some((other, _)) => return Err(format!("unknown scheme '{}'", other)),
            None => (IceScheme::Stun, url),
        };

        // Transport parameters such as `?transport=udp` are left to the engine.
        let authority = rest.split('?').next().unwrap_or_default();
        let authority = authority.trim_start_matches("//");

        let (host, port) = match authority.rsplit_once(':') {
            Some((host, port)) => {
                let port = port
                    .parse::<u16>()
                    .map_err(|_| format!("invalid port '{}'", port))?;
                (host, Some(port))
            }
            None => (authority, None),
        };

        if host.is_empty() {
            return Err("empty host".into());
        }

        let username = server.username.clone().filter(|u| !u.is_empty());
        let credential = server.credential.clone().filter(|c| !c.is_empty());
        if scheme.is_relay() && (username.is_none() || credential.is_none()) {
            return Err("TURN servers require username and credential".into());
        }

        Ok(Self {
            scheme,
            host: host.to_string(),
            port,
            username,
            credential,
        })
    }
}

impl fmt::Display for IceEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.scheme.as_str(), self.host)?;
        if let Some(port) = self.port {
            write!(f, ":{}", port)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_server_list_is_rejected() {
        let config = SessionConfig::default();
        let err = config.usable_endpoints().unwrap_err();
        assert!(matches!(err, FacadeError::Configuration(_)));
    }

    #[test]
    fn accepts_bare_strings_and_objects() {
        let config = SessionConfig::from_json(
            r#"{
                "iceServers": [
                    "stun:stun.example.org:3478",
                    { "urls": ["turn:relay.example.org"], "username": "u", "credential": "p" }
                ],
                "mediaConstraints": { "audio": true, "video": true }
            }"#,
        )
        .unwrap();

        let endpoints = config.usable_endpoints().unwrap();
        assert_eq!(endpoints.len(), 2);
        assert_eq!(endpoints[0].scheme, IceScheme::Stun);
        assert_eq!(endpoints[0].port, Some(3478));
        assert_eq!(endpoints[1].scheme, IceScheme::Turn);
        assert_eq!(endpoints[1].to_string(), "turn:relay.example.org");
        assert!(config.media_constraints.video);
        assert_eq!(config.negotiation_timeout(), Duration::from_secs(10));
    }

    #[test]
    fn turn_without_credentials_is_not_usable() {
        let config = SessionConfig::with_servers(["turn:relay.example.org"]);
        assert!(config.usable_endpoints().is_err());
    }

    #[test]
    fn unusable_entries_are_skipped() {
        let config = SessionConfig::with_servers(["http://nope", "stun:", "stun:example"]);
        let endpoints = config.usable_endpoints().unwrap();
        assert_eq!(endpoints.len(), 1);
        assert_eq!(endpoints[0].host, "example");
    }

    #[test]
    fn missing_scheme_defaults_to_stun() {
        let config = SessionConfig::with_servers(["stun1.l.google.com:19302"]);
        let endpoints = config.usable_endpoints().unwrap();
        assert_eq!(endpoints[0].scheme, IceScheme::Stun);
        assert_eq!(endpoints[0].port, Some(19302));
    }

    #[test]
    fn zero_timeout_is_rejected() {
        let mut config = SessionConfig::with_servers(["stun:example"]);
        config.negotiation_timeout_ms = 0;
        assert!(config.usable_endpoints().is_err());
    }
}
