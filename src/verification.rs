use axum::http::HeaderMap;
use hmac::{Hmac, Mac};
use sha2::Sha256;

type HmacSha256 = Hmac<Sha256>;

pub const HEADER_GITHUB_SIGNATURE: &str = "x-hub-signature-256";
pub const HEADER_GITEA_SIGNATURE: &str = "x-gitea-signature";
pub const HEADER_BITBUCKET_SIGNATURE: &str = "x-hub-signature";
pub const HEADER_GITLAB_TOKEN: &str = "x-gitlab-token";

/// Which provider convention a request was signed with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureScheme {
    /// `X-Hub-Signature-256: sha256=<hex>`
    GitHub,
    /// `X-Gitea-Signature: <hex>`
    Gitea,
    /// `X-Hub-Signature: <hex>`
    Bitbucket,
    /// `X-Gitlab-Token: <secret>`
    GitLab,
}

impl SignatureScheme {
    pub fn header(self) -> &'static str {
        match self {
            SignatureScheme::GitHub => HEADER_GITHUB_SIGNATURE,
            SignatureScheme::Gitea => HEADER_GITEA_SIGNATURE,
            SignatureScheme::Bitbucket => HEADER_BITBUCKET_SIGNATURE,
            SignatureScheme::GitLab => HEADER_GITLAB_TOKEN,
        }
    }
}

/// Picks the scheme from the first signature header present.
pub fn detect_scheme(headers: &HeaderMap) -> Option<(SignatureScheme, &str)> {
    [
        SignatureScheme::GitHub,
        SignatureScheme::Gitea,
        SignatureScheme::Bitbucket,
        SignatureScheme::GitLab,
    ]
    .into_iter()
    .find_map(|scheme| {
        headers
            .get(scheme.header())
            .and_then(|v| v.to_str().ok())
            .map(|v| (scheme, v))
    })
}

/// Checks a request against every configured secret.
///
/// An empty secret list disables verification. With secrets configured, a
/// request without any recognised signature header is rejected.
pub fn verify_request(secrets: &[String], headers: &HeaderMap, body: &[u8]) -> bool {
    if secrets.is_empty() {
        return true;
    }
    let Some((scheme, value)) = detect_scheme(headers) else {
        return false;
    };
    secrets
        .iter()
        .any(|secret| verify_with_scheme(scheme, secret.as_bytes(), body, value))
}

pub fn verify_with_scheme(scheme: SignatureScheme, secret: &[u8], body: &[u8], value: &str) -> bool {
    match scheme {
        SignatureScheme::GitHub => match value.strip_prefix("sha256=") {
            Some(hex_sig) => verify_hmac_hex(secret, body, hex_sig),
            None => false,
        },
        // Both are plain hex; tolerate a GitHub-style prefix.
        SignatureScheme::Gitea | SignatureScheme::Bitbucket => {
            let hex_sig = value.strip_prefix("sha256=").unwrap_or(value);
            verify_hmac_hex(secret, body, hex_sig)
        }
        SignatureScheme::GitLab => verify_token(secret, value),
    }
}

/// Length of a hex-encoded SHA-256 digest.
const HMAC_HEX_LEN: usize = 64;

/// Verify a hex-encoded HMAC-SHA256 of `body`.
///
/// Only the canonical form is accepted: exactly 64 lowercase hex digits.
pub fn verify_hmac_hex(secret: &[u8], body: &[u8], hex_sig: &str) -> bool {
    if hex_sig.len() != HMAC_HEX_LEN
        || !hex_sig.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
    {
        return false;
    }
    let expected = match hex::decode(hex_sig) {
        Ok(b) => b,
        Err(_) => return false,
    };

    let mut mac = match HmacSha256::new_from_slice(secret) {
        Ok(m) => m,
        Err(_) => return false,
    };
    mac.update(body);

    // Constant-time comparison.
    mac.verify_slice(&expected).is_ok()
}

/// Verify a shared token header matches the secret exactly.
///
/// Both sides are hashed under the secret and the digests compared in
/// constant time.
pub fn verify_token(secret: &[u8], header_value: &str) -> bool {
    let Ok(mut expected) = HmacSha256::new_from_slice(secret) else {
        return false;
    };
    expected.update(secret);
    let expected = expected.finalize().into_bytes();

    let Ok(mut presented) = HmacSha256::new_from_slice(secret) else {
        return false;
    };
    presented.update(header_value.as_bytes());
    presented.verify_slice(&expected).is_ok()
}

/// Hex HMAC-SHA256 of `body`, for signing test requests and replay scripts.
pub fn compute_hmac_hex(secret: &[u8], body: &[u8]) -> String {
    // HMAC accepts keys of any length.
    let Ok(mut mac) = HmacSha256::new_from_slice(secret) else {
        return String::new();
    };
    mac.update(body);
    hex::encode(mac.finalize().into_bytes())
}

pub fn github_signature_header(secret: &[u8], body: &[u8]) -> String {
    format!("sha256={}", compute_hmac_hex(secret, body))
}
