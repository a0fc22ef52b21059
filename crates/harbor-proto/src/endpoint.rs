use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;
use url::Url;
use uuid::Uuid;

/// Opaque identity of a connected party. Unique per role while connected,
/// never persisted.
pub type EndpointId = String;

/// Which side of the relay an endpoint sits on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Controller,
    Target,
}

impl Role {
    /// The role envelopes from this side are forwarded to.
    pub fn peer(&self) -> Role {
        match self {
            Role::Controller => Role::Target,
            Role::Target => Role::Controller,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Controller => "controller",
            Role::Target => "target",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error)]
#[error("unknown role '{0}' (expected 'controller' or 'target')")]
pub struct RoleParseError(String);

impl FromStr for Role {
    type Err = RoleParseError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "controller" => Ok(Role::Controller),
            "target" => Ok(Role::Target),
            _ => Err(RoleParseError(value.to_string())),
        }
    }
}

/// Generate a unique endpoint id
pub fn generate_endpoint_id() -> EndpointId {
    Uuid::new_v4().to_string()
}

pub const RELAY_WS_PATH: &str = "/ws";

#[derive(Debug, Error)]
pub enum EndpointUrlError {
    #[error("invalid relay url: {0}")]
    Invalid(#[from] url::ParseError),
    #[error("relay url must use ws or wss, got '{0}'")]
    UnsupportedScheme(String),
}

/// Websocket address an endpoint connects to: the relay base with the
/// `/ws` path and `role`/`id` query. `http(s)` bases are mapped to `ws(s)`.
pub fn endpoint_url(relay: &str, role: Role, id: &str) -> Result<Url, EndpointUrlError> {
    let mut url = Url::parse(relay)?;
    let scheme = match url.scheme() {
        "ws" | "http" => "ws",
        "wss" | "https" => "wss",
        other => return Err(EndpointUrlError::UnsupportedScheme(other.to_string())),
    };
    if url.scheme() != scheme && url.set_scheme(scheme).is_err() {
        return Err(EndpointUrlError::UnsupportedScheme(url.scheme().to_string()));
    }
    if !url.path().ends_with(RELAY_WS_PATH) {
        let base = url.path().trim_end_matches('/').to_string();
        url.set_path(&format!("{base}{RELAY_WS_PATH}"));
    }
    url.query_pairs_mut()
        .clear()
        .append_pair("role", role.as_str())
        .append_pair("id", id);
    Ok(url)
}
