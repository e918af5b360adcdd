//! WebFinger protocol implementation
//!
//! Locates local actors from `acct:` addresses.

use serde::{Deserialize, Serialize};

/// WebFinger JRD response
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WebFingerResponse {
    pub subject: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aliases: Option<Vec<String>>,
    pub links: Vec<WebFingerLink>,
}

/// WebFinger link
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WebFingerLink {
    pub rel: String,
    #[serde(rename = "type")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub link_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub href: Option<String>,
}

/// Split `acct:user@host` (the `acct:` prefix is optional) into user and host.
pub fn parse_acct_resource(resource: &str) -> Option<(&str, &str)> {
    let address = resource.strip_prefix("acct:").unwrap_or(resource);
    let address = address.strip_prefix('@').unwrap_or(address);
    let (username, host) = address.split_once('@')?;
    if username.is_empty() || host.is_empty() || host.contains('@') {
        return None;
    }
    Some((username, host))
}

/// Whether a resource host names this instance
pub fn host_matches(resource_host: &str, domain: &str) -> bool {
    resource_host
        .trim_end_matches('.')
        .eq_ignore_ascii_case(domain.trim_end_matches('.'))
}

/// Generate WebFinger response for a local account.
///
/// # Arguments
/// * `username` - Local username
/// * `domain` - Instance domain
/// * `actor_iri` - The account's actor IRI
pub fn generate_webfinger_response(
    username: &str,
    domain: &str,
    actor_iri: &str,
) -> WebFingerResponse {
    WebFingerResponse {
        subject: format!("acct:{}@{}", username, domain),
        aliases: Some(vec![actor_iri.to_string()]),
        links: vec![
            WebFingerLink {
                rel: "self".to_string(),
                link_type: Some("application/activity+json".to_string()),
                href: Some(actor_iri.to_string()),
            },
            WebFingerLink {
                rel: "http://webfinger.net/rel/profile-page".to_string(),
                link_type: Some("text/html".to_string()),
                href: Some(actor_iri.to_string()),
            },
        ],
    }
}
