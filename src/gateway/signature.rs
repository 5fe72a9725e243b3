use axum::http::HeaderMap;
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

/// Maximum age of a Slack request timestamp before it is rejected as a
/// replay, per Slack's signing guidance.
const SLACK_REPLAY_WINDOW_SECS: u64 = 300;

/// Webhook providers with a supported signature scheme. All three sign with
/// HMAC-SHA256; they differ in header names, hex prefix, and signed message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Provider {
    GitHub,
    Linear,
    Slack,
}

impl Provider {
    pub fn from_source(source: &str) -> Option<Self> {
        match source.to_ascii_lowercase().as_str() {
            "github" => Some(Provider::GitHub),
            "linear" => Some(Provider::Linear),
            "slack" => Some(Provider::Slack),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Provider::GitHub => "github",
            Provider::Linear => "linear",
            Provider::Slack => "slack",
        }
    }

    fn signature_header(self) -> &'static str {
        match self {
            Provider::GitHub => "x-hub-signature-256",
            Provider::Linear => "linear-signature",
            Provider::Slack => "x-slack-signature",
        }
    }

    fn timestamp_header(self) -> Option<&'static str> {
        match self {
            Provider::Slack => Some("x-slack-request-timestamp"),
            _ => None,
        }
    }
}

/// Signature material pulled from request headers.
#[derive(Debug, Clone)]
pub struct SignatureHeaders {
    pub signature: String,
    pub timestamp: Option<String>,
}

/// Extract the provider's signature (and timestamp, where the scheme needs
/// one) from the headers. Returns `None` when any required header is absent
/// so the caller can fail closed before touching rate-limit counters.
/// `HeaderMap` lookups are case-insensitive, so `X-Hub-Signature-256` and
/// `x-hub-signature-256` both match.
pub fn extract_signature_headers(provider: Provider, headers: &HeaderMap) -> Option<SignatureHeaders> {
    let signature = headers
        .get(provider.signature_header())
        .and_then(|v| v.to_str().ok())?
        .to_string();

    let timestamp = match provider.timestamp_header() {
        Some(name) => Some(
            headers
                .get(name)
                .and_then(|v| v.to_str().ok())?
                .to_string(),
        ),
        None => None,
    };

    Some(SignatureHeaders {
        signature,
        timestamp,
    })
}

/// Verify an inbound payload against the provider's scheme.
///
/// Invalid input of any kind (missing/malformed prefix, stale timestamp,
/// wrong digest) is `false`, never an error. A stale Slack timestamp is
/// rejected before any HMAC is computed.
pub fn validate_signature(
    provider: Provider,
    secret: &str,
    payload: &[u8],
    signature: &str,
    timestamp: Option<&str>,
) -> bool {
    match provider {
        Provider::GitHub => {
            // X-Hub-Signature-256: sha256=<hex>
            let Some(hex_sig) = signature.strip_prefix("sha256=") else {
                return false;
            };
            hmac_matches(secret, payload, hex_sig)
        }
        Provider::Linear => {
            // Linear-Signature: <hex>, no prefix
            hmac_matches(secret, payload, signature)
        }
        Provider::Slack => {
            // X-Slack-Signature: v0=<hex> over "v0:<timestamp>:<body>"
            let Some(ts) = timestamp else {
                return false;
            };
            let Ok(ts_secs) = ts.parse::<u64>() else {
                return false;
            };
            let now = std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or_default()
                .as_secs();
            if now.abs_diff(ts_secs) > SLACK_REPLAY_WINDOW_SECS {
                return false;
            }

            let Some(hex_sig) = signature.strip_prefix("v0=") else {
                return false;
            };
            let basestring = format!("v0:{}:{}", ts, String::from_utf8_lossy(payload));
            hmac_matches(secret, basestring.as_bytes(), hex_sig)
        }
    }
}

fn hmac_matches(secret: &str, message: &[u8], provided_hex: &str) -> bool {
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(message);
    let expected = hex::encode(mac.finalize().into_bytes());
    constant_time_eq(provided_hex.as_bytes(), expected.as_bytes())
}

/// Constant-time comparison: no early exit on the first mismatched byte, and
/// a length mismatch is "no match" without branching on position.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter()
        .zip(b.iter())
        .fold(0u8, |acc, (x, y)| acc | (x ^ y))
        == 0
}
