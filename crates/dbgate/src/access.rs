//! Request authorization.
//!
//! Loopback listeners trust every request. Anything else must prove possession of
//! the per-process [`AccessToken`], either through the `MAGIC<port>` cookie or by
//! presenting it once as the `MAGIC` query parameter. In the latter case the
//! client is redirected to the same URL without the parameter and handed the
//! cookie, so the token does not linger in the address bar or referrer headers.

use std::{fmt, sync::Arc};

use axum::{
    extract::{Request, State},
    http::{
        header::{COOKIE, LOCATION, SET_COOKIE},
        HeaderMap, HeaderValue, StatusCode, Uri,
    },
    middleware::Next,
    response::{IntoResponse, Response},
};

const TARGET: &str = "dbgate.access";

/// Name of the one-time query parameter and prefix of the per-port cookie.
pub const MAGIC: &str = "MAGIC";

const COOKIE_MAX_AGE_SECS: u64 = 30 * 24 * 60 * 60;

/// The shared secret for remote access. Never printed by `Debug`.
#[derive(Clone, PartialEq, Eq)]
pub struct AccessToken(Arc<str>);

impl AccessToken {
    /// 256 random bits, hex encoded.
    pub fn generate() -> Result<Self, getrandom::Error> {
        let mut bytes = [0u8; 32];
        getrandom::getrandom(&mut bytes)?;
        Ok(Self(hex_encode(&bytes).into()))
    }

    pub fn new(token: impl Into<Arc<str>>) -> Self {
        Self(token.into())
    }

    /// The raw token, for handing to the operator.
    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn matches(&self, candidate: &str) -> bool {
        constant_time_eq(self.0.as_bytes(), candidate.as_bytes())
    }
}

impl fmt::Debug for AccessToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("AccessToken(<redacted>)")
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    const HEX: &[u8; 16] = b"0123456789abcdef";
    let mut out = String::with_capacity(bytes.len() * 2);
    for &b in bytes {
        out.push(HEX[(b >> 4) as usize] as char);
        out.push(HEX[(b & 0x0f) as usize] as char);
    }
    out
}

/// Compares without short-circuiting on the first differing byte.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[derive(Debug, Clone)]
pub enum AccessMode {
    Local,
    Remote { token: AccessToken, port: u16 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AccessDecision {
    Allow,
    /// Authorized by the one-time token: redirect to `location` and set `cookie`.
    Persist { location: String, cookie: String },
    Deny,
}

#[derive(Debug, Clone)]
pub struct AccessGuard {
    mode: AccessMode,
}

impl AccessGuard {
    pub fn local() -> Self {
        Self {
            mode: AccessMode::Local,
        }
    }

    pub fn remote(token: AccessToken, port: u16) -> Self {
        Self {
            mode: AccessMode::Remote { token, port },
        }
    }

    pub fn mode(&self) -> &AccessMode {
        &self.mode
    }

    /// Cookies are scoped by port because browsers share them across ports of one host.
    pub fn cookie_name(port: u16) -> String {
        format!("{MAGIC}{port}")
    }

    pub fn check(&self, headers: &HeaderMap, uri: &Uri) -> AccessDecision {
        let (token, port) = match &self.mode {
            AccessMode::Local => return AccessDecision::Allow,
            AccessMode::Remote { token, port } => (token, *port),
        };

        let cookie_name = Self::cookie_name(port);
        if cookie_values(headers, &cookie_name).any(|value| token.matches(value)) {
            return AccessDecision::Allow;
        }

        let query = uri.query().unwrap_or_default();
        let presented = url::form_urlencoded::parse(query.as_bytes())
            .any(|(key, value)| key == MAGIC && token.matches(&value));
        if !presented {
            return AccessDecision::Deny;
        }

        let remaining: Vec<(String, String)> = url::form_urlencoded::parse(query.as_bytes())
            .filter(|(key, _)| *key != MAGIC)
            .map(|(key, value)| (key.into_owned(), value.into_owned()))
            .collect();
        // A leading `//` would make the redirect protocol-relative.
        let mut location = format!("/{}", uri.path().trim_start_matches(['/', '\\']));
        if !remaining.is_empty() {
            location.push('?');
            location.push_str(
                &url::form_urlencoded::Serializer::new(String::new())
                    .extend_pairs(&remaining)
                    .finish(),
            );
        }

        AccessDecision::Persist {
            location,
            cookie: format!(
                "{cookie_name}={}; Path=/; Max-Age={COOKIE_MAX_AGE_SECS}; HttpOnly; Secure; SameSite=Strict",
                token.expose()
            ),
        }
    }
}

fn cookie_values<'a>(headers: &'a HeaderMap, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|header| header.split(';'))
        .filter_map(move |pair| {
            let (key, value) = pair.trim().split_once('=')?;
            (key.trim() == name).then(|| value.trim())
        })
}

/// Middleware applying [`AccessGuard::check`] to every request, including the
/// WebSocket handshake.
pub async fn enforce(State(guard): State<AccessGuard>, request: Request, next: Next) -> Response {
    match guard.check(request.headers(), request.uri()) {
        AccessDecision::Allow => next.run(request).await,
        AccessDecision::Persist { location, cookie } => {
            tracing::info!(target: TARGET, path = request.uri().path(), "access token accepted");
            let (Ok(location), Ok(cookie)) = (
                HeaderValue::from_str(&location),
                HeaderValue::from_str(&cookie),
            ) else {
                return StatusCode::BAD_REQUEST.into_response();
            };
            (
                StatusCode::FOUND,
                [(LOCATION, location), (SET_COOKIE, cookie)],
            )
                .into_response()
        }
        AccessDecision::Deny => {
            tracing::warn!(
                target: TARGET,
                method = %request.method(),
                path = request.uri().path(),
                "rejected unauthorized request"
            );
            (StatusCode::FORBIDDEN, "Permission Denied").into_response()
        }
    }
}
