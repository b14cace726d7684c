//! Browser origin policy and device token authentication.
//!
//! Origins are matched against an exact allowlist. A same-host fallback
//! (Origin host == request Host) exists behind an explicit opt-in, and
//! only when the Origin protocol matches the transport. Loopback-to-
//! loopback connections skip the protocol check: local tooling talks
//! plain http/ws. Anything missing or unparseable, including the literal
//! "null" origin, is rejected.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use courier_core::config::{AuthConfig, GatewayConfig};
use courier_core::CourierError;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

const MAX_AUTH_ATTEMPTS: u32 = 5;
const AUTH_LOCKOUT: Duration = Duration::from_secs(60);

/// Scheme, host, and effective port pulled out of an Origin header.
#[derive(Debug, PartialEq, Eq)]
struct ParsedOrigin {
    scheme: String,
    host: String,
    port: u16,
}

/// Hand-rolled parse of `scheme://host[:port]`. Returns `None` for
/// anything else, which callers treat as a denial.
fn parse_origin(origin: &str) -> Option<ParsedOrigin> {
    let (scheme, rest) = origin.split_once("://")?;
    if scheme.is_empty() || rest.is_empty() || rest.contains('/') {
        return None;
    }
    let (host, port) = if let Some(stripped) = rest.strip_prefix('[') {
        // Bracketed IPv6 literal.
        let (addr, tail) = stripped.split_once(']')?;
        let port = match tail.strip_prefix(':') {
            Some(p) => p.parse().ok()?,
            None if tail.is_empty() => default_port(scheme)?,
            None => return None,
        };
        (format!("[{addr}]"), port)
    } else {
        match rest.rsplit_once(':') {
            Some((h, p)) => (h.to_string(), p.parse().ok()?),
            None => (rest.to_string(), default_port(scheme)?),
        }
    };
    if host.is_empty() {
        return None;
    }
    Some(ParsedOrigin {
        scheme: scheme.to_ascii_lowercase(),
        host: host.to_ascii_lowercase(),
        port,
    })
}

fn default_port(scheme: &str) -> Option<u16> {
    match scheme {
        "http" | "ws" => Some(80),
        "https" | "wss" => Some(443),
        _ => None,
    }
}

fn is_loopback_host(host: &str) -> bool {
    matches!(host, "localhost" | "127.0.0.1" | "[::1]" | "::1")
}

fn is_secure_scheme(scheme: &str) -> bool {
    matches!(scheme, "https" | "wss")
}

/// Decide whether a browser WebSocket upgrade may proceed.
///
/// `host_header` is the request's Host header, used for the opt-in
/// same-host fallback. Fails closed: a missing Origin is rejected here —
/// whether a header-less (non-browser) client may skip the guard is the
/// upgrade path's decision, not this function's.
pub fn check_browser_origin(
    origin: Option<&str>,
    host_header: Option<&str>,
    cfg: &GatewayConfig,
) -> bool {
    let Some(origin) = origin else {
        debug!("rejecting request without an Origin header");
        return false;
    };
    if origin == "null" {
        debug!("rejecting opaque 'null' origin");
        return false;
    }
    let Some(parsed) = parse_origin(origin) else {
        debug!(origin, "rejecting malformed origin");
        return false;
    };

    // Exact allowlist match on the raw header value.
    if cfg.allowed_origins.iter().any(|allowed| allowed == origin) {
        return true;
    }

    // Loopback browser page talking to the loopback gateway. Scheme is
    // irrelevant here: local pages are plain http.
    if is_loopback_host(&parsed.host) && is_loopback_host(&cfg.host) {
        return true;
    }

    if cfg.allow_host_origin_fallback {
        if let Some(host_header) = host_header {
            let host_only = host_header
                .rsplit_once(':')
                .map(|(h, _)| h)
                .unwrap_or(host_header);
            let scheme_ok = is_secure_scheme(&parsed.scheme) || is_loopback_host(&parsed.host);
            if scheme_ok && parsed.host.eq_ignore_ascii_case(host_only) {
                return true;
            }
        }
    }

    debug!(origin, "origin not allowed");
    false
}

struct AttemptState {
    failures: u32,
    locked_until: Option<Instant>,
}

/// Shared-token device authentication with brute-force lockout.
///
/// Raw tokens from config are hashed once at startup; verification
/// compares digests in constant time. After [`MAX_AUTH_ATTEMPTS`]
/// consecutive failures the guard refuses all attempts for
/// [`AUTH_LOCKOUT`].
pub struct DeviceAuthGuard {
    required: bool,
    token_hashes: Mutex<Vec<[u8; 32]>>,
    attempts: Mutex<AttemptState>,
}

impl DeviceAuthGuard {
    pub fn new(cfg: &AuthConfig) -> Self {
        let token_hashes = cfg.tokens.iter().map(|t| hash_token(t)).collect();
        Self {
            required: cfg.require_device_auth,
            token_hashes: Mutex::new(token_hashes),
            attempts: Mutex::new(AttemptState {
                failures: 0,
                locked_until: None,
            }),
        }
    }

    /// Accept a freshly minted token (device pairing).
    pub fn add_token(&self, token: &str) {
        if let Ok(mut hashes) = self.token_hashes.lock() {
            hashes.push(hash_token(token));
        }
    }

    /// Verify a Hello token. `Ok(())` admits the connection.
    pub fn verify(&self, token: Option<&str>) -> Result<(), CourierError> {
        if !self.required {
            return Ok(());
        }

        let mut attempts = self
            .attempts
            .lock()
            .map_err(|_| CourierError::Unauthorized("auth state poisoned".into()))?;
        if let Some(until) = attempts.locked_until {
            if Instant::now() < until {
                return Err(CourierError::Unauthorized(
                    "too many failed attempts, try again later".into(),
                ));
            }
            attempts.locked_until = None;
            attempts.failures = 0;
        }

        let presented = match token {
            Some(t) if !t.is_empty() => hash_token(t),
            _ => {
                return Err(CourierError::Unauthorized("missing auth token".into()));
            }
        };

        let hashes = self
            .token_hashes
            .lock()
            .map_err(|_| CourierError::Unauthorized("auth state poisoned".into()))?;
        let mut matched = false;
        for expected in hashes.iter() {
            if constant_time_eq(expected, &presented) {
                matched = true;
            }
        }
        drop(hashes);

        if matched {
            attempts.failures = 0;
            Ok(())
        } else {
            attempts.failures += 1;
            if attempts.failures >= MAX_AUTH_ATTEMPTS {
                warn!("auth lockout engaged after {MAX_AUTH_ATTEMPTS} failures");
                attempts.locked_until = Some(Instant::now() + AUTH_LOCKOUT);
            }
            Err(CourierError::Unauthorized("invalid auth token".into()))
        }
    }
}

fn hash_token(token: &str) -> [u8; 32] {
    let digest = Sha256::digest(token.as_bytes());
    digest.into()
}

/// XOR-fold comparison over fixed-size digests; runtime does not depend
/// on where the inputs differ.
fn constant_time_eq(a: &[u8; 32], b: &[u8; 32]) -> bool {
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}
