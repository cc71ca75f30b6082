//! Payload signing.
//!
//! Computes the signature header(s) for an outbound dispatch. For every
//! configured signature version the payload is signed with each usable
//! secret in order, so subscribers can verify against the new or the old
//! key during rotation. Header value format:
//!
//! ```text
//! t=<unix-seconds>,v1=<digest>[,v1=<digest2>][,v2=<digest>...]
//! ```
//!
//! Versions that carry a header-name override are emitted as their own
//! header; all others share the project's signature header.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::{Sha256, Sha512};

use courier_db::models::{Secret, SignatureConfiguration, SignatureEncoding, SignatureHash};

type HmacSha256 = Hmac<Sha256>;
type HmacSha512 = Hmac<Sha512>;

/// Signature headers ready to attach to the outbound request, in
/// configuration order.
pub type SignedHeaders = Vec<(String, String)>;

/// Compute the signature header(s) for a payload.
///
/// Secrets must already be filtered to the usable set; expired secrets are
/// the caller's concern. Returns an empty set when there are no versions or
/// no secrets.
#[must_use]
pub fn signature_headers(
    config: &SignatureConfiguration,
    secrets: &[&Secret],
    payload: &[u8],
    now: DateTime<Utc>,
) -> SignedHeaders {
    if secrets.is_empty() || config.versions.is_empty() {
        return Vec::new();
    }

    let timestamp = now.timestamp();
    let mut headers: SignedHeaders = Vec::new();

    for (index, version) in config.versions.iter().enumerate() {
        let header_name = version.header.as_deref().unwrap_or(&config.header);
        let mut digests = Vec::with_capacity(secrets.len());
        for secret in secrets {
            digests.push(format!(
                "v{}={}",
                index + 1,
                sign(version.hash, version.encoding, &secret.value, payload)
            ));
        }

        match headers.iter_mut().find(|(name, _)| name == header_name) {
            Some((_, value)) => {
                value.push(',');
                value.push_str(&digests.join(","));
            }
            None => {
                headers.push((
                    header_name.to_string(),
                    format!("t={timestamp},{}", digests.join(",")),
                ));
            }
        }
    }

    headers
}

fn sign(hash: SignatureHash, encoding: SignatureEncoding, secret: &str, payload: &[u8]) -> String {
    let digest: Vec<u8> = match hash {
        SignatureHash::Sha256 => {
            let mut mac = <HmacSha256 as Mac>::new_from_slice(secret.as_bytes())
                .expect("HMAC can take key of any size");
            mac.update(payload);
            mac.finalize().into_bytes().to_vec()
        }
        SignatureHash::Sha512 => {
            let mut mac = <HmacSha512 as Mac>::new_from_slice(secret.as_bytes())
                .expect("HMAC can take key of any size");
            mac.update(payload);
            mac.finalize().into_bytes().to_vec()
        }
    };

    match encoding {
        SignatureEncoding::Hex => hex::encode(digest),
        SignatureEncoding::Base64 => BASE64.encode(digest),
    }
}
