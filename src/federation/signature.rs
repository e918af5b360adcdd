//! HTTP Signatures for ActivityPub
//!
//! Implements signing and verification per:
//! https://docs.joinmastodon.org/spec/security/
//!
//! Only `rsa-sha256` is produced and accepted.

use crate::error::AppError;
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use chrono::{DateTime, Utc};
use rsa::pkcs8::DecodePublicKey;
use rsa::signature::Verifier;
use rsa::{RsaPublicKey, pkcs1v15::Signature as Pkcs1v15Signature};
use sha2::{Digest, Sha256};
use std::net::IpAddr;

use super::resolver::ActorResolver;

/// Signature algorithm name
pub const SIGNATURE_ALGORITHM: &str = "rsa-sha256";

/// Maximum accepted distance between the Date header and now
pub const MAX_DATE_SKEW_SECONDS: i64 = 300;

const SIGNED_HEADERS: &str = "(request-target) host date digest";

fn is_disallowed_ip(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => {
            v4.is_loopback()
                || v4.is_private()
                || v4.is_link_local()
                || v4.is_multicast()
                || v4.is_unspecified()
        }
        IpAddr::V6(v6) => {
            v6.is_loopback()
                || v6.is_unique_local()
                || v6.is_unicast_link_local()
                || v6.is_multicast()
                || v6.is_unspecified()
        }
    }
}

fn is_disallowed_host(host: &str) -> bool {
    let normalized = host.trim_end_matches('.').to_ascii_lowercase();
    if normalized == "localhost" || normalized.ends_with(".localhost") {
        return true;
    }

    normalized
        .trim_start_matches('[')
        .trim_end_matches(']')
        .parse::<IpAddr>()
        .map(is_disallowed_ip)
        .unwrap_or(false)
}

pub(crate) async fn validate_resolved_host_ips(host: &str, port: u16) -> Result<(), AppError> {
    let normalized = host.trim_end_matches('.').to_ascii_lowercase();

    let mut resolved_any = false;
    let lookup = tokio::net::lookup_host((normalized.as_str(), port))
        .await
        .map_err(|e| AppError::Federation(format!("Failed to resolve actor host: {}", e)))?;

    for addr in lookup {
        resolved_any = true;
        if is_disallowed_ip(addr.ip()) {
            return Err(AppError::Forbidden);
        }
    }

    if !resolved_any {
        return Err(AppError::Federation(
            "No DNS records for actor host".to_string(),
        ));
    }

    Ok(())
}

/// Extract and validate remote actor domain from an actor URL or key ID URL.
///
/// This rejects non-HTTP(S) URLs and obvious local/private hosts.
pub fn extract_actor_domain(actor_or_key_id: &str) -> Result<String, AppError> {
    let actor_url = strip_fragment(actor_or_key_id);
    let parsed = url::Url::parse(actor_url)
        .map_err(|e| AppError::Validation(format!("Invalid actor URL: {}", e)))?;

    match parsed.scheme() {
        "http" | "https" => {}
        scheme => {
            return Err(AppError::Validation(format!(
                "Unsupported actor URL scheme: {}",
                scheme
            )));
        }
    }

    let host = parsed
        .host_str()
        .ok_or_else(|| AppError::Validation("Missing host in actor URL".to_string()))?
        .to_ascii_lowercase();

    if is_disallowed_host(&host) {
        return Err(AppError::Forbidden);
    }

    Ok(host)
}

fn strip_fragment(iri: &str) -> &str {
    iri.split('#').next().unwrap_or(iri)
}

/// `host[:port]` as sent in the Host header for this URL
fn host_header_value(url: &url::Url) -> Result<String, AppError> {
    let host = url
        .host_str()
        .ok_or_else(|| AppError::Validation("Missing host in URL".to_string()))?;
    Ok(match url.port() {
        Some(port) => format!("{}:{}", host, port),
        None => host.to_string(),
    })
}

fn format_http_date(now: DateTime<Utc>) -> String {
    now.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

/// Headers to add for signed request
#[derive(Debug, Clone)]
pub struct SignatureHeaders {
    /// Host header value, `host[:port]`
    pub host: String,
    /// Date header value (RFC 1123, GMT)
    pub date: String,
    /// Digest header value
    pub digest: String,
    /// Signature header value
    pub signature: String,
}

/// Sign an outbound POST
///
/// # Arguments
/// * `url` - Full destination URL
/// * `body` - Exact body bytes that will be sent
/// * `private_key_pem` - RSA private key in PKCS#8 PEM format
/// * `key_id` - Full URL to the public key (actor#main-key)
///
/// # Errors
/// `SignatureFailed` when the key cannot be parsed.
pub fn sign_request(
    url: &str,
    body: &[u8],
    private_key_pem: &str,
    key_id: &str,
) -> Result<SignatureHeaders, AppError> {
    sign_request_at(url, body, private_key_pem, key_id, Utc::now())
}

fn sign_request_at(
    url: &str,
    body: &[u8],
    private_key_pem: &str,
    key_id: &str,
    now: DateTime<Utc>,
) -> Result<SignatureHeaders, AppError> {
    use rsa::pkcs8::DecodePrivateKey;
    use rsa::signature::{RandomizedSigner, SignatureEncoding};

    let parsed_url =
        url::Url::parse(url).map_err(|e| AppError::Validation(format!("Invalid URL: {}", e)))?;

    let host = host_header_value(&parsed_url)?;
    let path_and_query = match parsed_url.query() {
        Some(q) => format!("{}?{}", parsed_url.path(), q),
        None => parsed_url.path().to_string(),
    };
    let date = format_http_date(now);
    let digest = generate_digest(body);

    let signing_string = format!(
        "(request-target): post {}\nhost: {}\ndate: {}\ndigest: {}",
        path_and_query, host, date, digest
    );

    let private_key = rsa::RsaPrivateKey::from_pkcs8_pem(private_key_pem)
        .map_err(|e| AppError::SignatureFailed(format!("Invalid private key: {}", e)))?;

    let signing_key = rsa::pkcs1v15::SigningKey::<Sha256>::new_unprefixed(private_key);
    let mut rng = rand::thread_rng();
    let signature = signing_key.sign_with_rng(&mut rng, signing_string.as_bytes());
    let signature_b64 = BASE64.encode(signature.to_bytes());

    let signature_header = format!(
        "keyId=\"{}\",algorithm=\"{}\",headers=\"{}\",signature=\"{}\"",
        key_id, SIGNATURE_ALGORITHM, SIGNED_HEADERS, signature_b64
    );

    Ok(SignatureHeaders {
        host,
        date,
        digest,
        signature: signature_header,
    })
}

/// Outcome of a successful inbound verification
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VerifiedSignature {
    /// keyId the request was signed with
    pub key_id: String,
    /// Actor that owns the key
    pub actor_iri: String,
}

/// Verify an inbound request on behalf of `claimed_actor`.
///
/// The actor's public key is obtained through the resolver (cache first).
/// If a cached key fails to verify, it is dropped and fetched once more
/// so rotated keys are picked up.
pub async fn verify_request(
    method: &str,
    path: &str,
    headers: &http::HeaderMap,
    body: &[u8],
    claimed_actor: &str,
    resolver: &ActorResolver,
) -> Result<VerifiedSignature, AppError> {
    let parsed = parse_signature_header(signature_header_value(headers)?)?;

    if !key_id_matches_actor(&parsed.key_id, claimed_actor) {
        return Err(AppError::InvalidSignature(format!(
            "keyId {} does not belong to actor {}",
            parsed.key_id, claimed_actor
        )));
    }

    let signing_string = build_verification_string(method, path, headers, Some(body), &parsed)?;

    let public_key_pem = resolver.public_key(&parsed.key_id).await?;
    if let Err(first) = verify_with_key(&signing_string, &parsed.signature, &public_key_pem) {
        resolver.invalidate_key(&parsed.key_id).await;
        let refreshed = resolver.public_key(&parsed.key_id).await?;
        if refreshed == public_key_pem {
            return Err(first);
        }
        verify_with_key(&signing_string, &parsed.signature, &refreshed)?;
    }

    Ok(VerifiedSignature {
        actor_iri: strip_fragment(&parsed.key_id).to_string(),
        key_id: parsed.key_id,
    })
}

fn signature_header_value(headers: &http::HeaderMap) -> Result<&str, AppError> {
    headers
        .get("signature")
        .ok_or_else(|| AppError::SignatureParseFailed("Missing Signature header".to_string()))?
        .to_str()
        .map_err(|_| AppError::SignatureParseFailed("Invalid Signature header".to_string()))
}

fn header_str<'a>(headers: &'a http::HeaderMap, name: &str) -> Result<&'a str, AppError> {
    headers
        .get(name)
        .ok_or_else(|| AppError::InvalidSignature(format!("Missing {} header", name)))?
        .to_str()
        .map_err(|_| AppError::InvalidSignature(format!("Invalid {} header", name)))
}

/// Structural checks (signed header set, Date window, Digest), then the
/// signing string rebuilt from the named headers.
fn build_verification_string(
    method: &str,
    path: &str,
    headers: &http::HeaderMap,
    body: Option<&[u8]>,
    parsed: &ParsedSignature,
) -> Result<String, AppError> {
    for required in ["(request-target)", "host", "date"] {
        if !parsed.headers.iter().any(|h| h == required) {
            return Err(AppError::InvalidSignature(format!(
                "Signed headers must include: {}",
                required
            )));
        }
    }

    if body.is_some() && !parsed.headers.iter().any(|h| h == "digest") {
        return Err(AppError::InvalidSignature(
            "Signed headers must include: digest".to_string(),
        ));
    }

    let date = DateTime::parse_from_rfc2822(header_str(headers, "date")?)
        .map_err(|_| AppError::InvalidSignature("Invalid Date format".to_string()))?;
    let diff = (Utc::now().timestamp() - date.timestamp()).abs();
    if diff > MAX_DATE_SKEW_SECONDS {
        return Err(AppError::InvalidSignature(
            "Date header too old or in future".to_string(),
        ));
    }

    if let Some(body_data) = body {
        if header_str(headers, "digest")? != generate_digest(body_data) {
            return Err(AppError::InvalidSignature("Digest mismatch".to_string()));
        }
    }

    let mut signing_parts = Vec::with_capacity(parsed.headers.len());
    for header_name in &parsed.headers {
        let value = match header_name.as_str() {
            "(request-target)" => format!("{} {}", method.to_lowercase(), path),
            "host" | "date" | "digest" | "content-type" => {
                header_str(headers, header_name)?.to_string()
            }
            _ => {
                return Err(AppError::InvalidSignature(format!(
                    "Unsupported header in signature: {}",
                    header_name
                )));
            }
        };
        signing_parts.push(format!("{}: {}", header_name, value));
    }

    Ok(signing_parts.join("\n"))
}

fn verify_with_key(
    signing_string: &str,
    signature_b64: &str,
    public_key_pem: &str,
) -> Result<(), AppError> {
    let signature_bytes = BASE64
        .decode(signature_b64)
        .map_err(|_| AppError::InvalidSignature("Invalid signature encoding".to_string()))?;

    let public_key = RsaPublicKey::from_public_key_pem(public_key_pem)
        .map_err(|e| AppError::PublicKeyFetchFailed(format!("Invalid public key: {}", e)))?;

    let verifier = rsa::pkcs1v15::VerifyingKey::<Sha256>::new_unprefixed(public_key);

    let signature = Pkcs1v15Signature::try_from(signature_bytes.as_slice())
        .map_err(|e| AppError::InvalidSignature(format!("Invalid signature format: {}", e)))?;

    verifier
        .verify(signing_string.as_bytes(), &signature)
        .map_err(|_| AppError::InvalidSignature("Signature verification failed".to_string()))
}

/// Validate that signature keyId points to the same actor as the activity actor.
pub fn key_id_matches_actor(key_id: &str, actor_id: &str) -> bool {
    strip_fragment(key_id) == strip_fragment(actor_id)
}

/// Parsed Signature header
#[derive(Debug, Clone)]
pub struct ParsedSignature {
    /// Key ID (URL to public key)
    pub key_id: String,
    /// Always `rsa-sha256` once parsed
    pub algorithm: String,
    /// Signed header names, lowercased
    pub headers: Vec<String>,
    /// Base64-encoded signature
    pub signature: String,
}

/// Parse Signature header value
///
/// # Format
/// ```text
/// keyId="...",algorithm="...",headers="...",signature="..."
/// ```
pub fn parse_signature_header(header: &str) -> Result<ParsedSignature, AppError> {
    let mut key_id = None;
    let mut algorithm = None;
    let mut headers = None;
    let mut signature = None;

    for part in header.split(',') {
        let part = part.trim();
        if let Some((key, value)) = part.split_once('=') {
            let key = key.trim();
            let value = value.trim().trim_matches('"');

            match key {
                "keyId" => key_id = Some(value.to_string()),
                "algorithm" => algorithm = Some(value.to_ascii_lowercase()),
                "headers" => {
                    headers = Some(
                        value
                            .split_whitespace()
                            .map(|s| s.to_ascii_lowercase())
                            .collect::<Vec<_>>(),
                    )
                }
                "signature" => signature = Some(value.to_string()),
                _ => {}
            }
        }
    }

    let missing = |field: &str| AppError::SignatureParseFailed(format!("Missing {}", field));
    let algorithm = algorithm.ok_or_else(|| missing("algorithm"))?;
    if algorithm != SIGNATURE_ALGORITHM {
        return Err(AppError::SignatureParseFailed(format!(
            "Unsupported signature algorithm: {}",
            algorithm
        )));
    }

    Ok(ParsedSignature {
        key_id: key_id.ok_or_else(|| missing("keyId"))?,
        algorithm,
        headers: headers.ok_or_else(|| missing("headers"))?,
        signature: signature.ok_or_else(|| missing("signature"))?,
    })
}

/// Generate SHA-256 digest for body
///
/// # Returns
/// `SHA-256=base64(hash)`
pub fn generate_digest(body: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(body);
    let hash = hasher.finalize();
    format!("SHA-256={}", BASE64.encode(hash))
}
