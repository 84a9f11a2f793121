//! Signatures for rules that proxy to signed origins.

use chrono::Utc;
use jsonwebtoken::{encode, EncodingKey, Header};
use serde::Serialize;

const SIGNATURE_TTL_SECS: i64 = 5 * 60;

#[derive(Debug, Serialize)]
struct SignedRedirect<'a> {
    deploy_context: &'a str,
    site_url: Option<&'a str>,
    id: Option<&'a str>,
    netlify_id: Option<&'a str>,
    iss: &'a str,
    exp: i64,
}

/// Sign a proxied request with `secret` (HS256).
pub fn sign_redirect(
    secret: &str,
    site_id: Option<&str>,
    site_url: Option<&str>,
) -> Result<String, jsonwebtoken::errors::Error> {
    let claims = SignedRedirect {
        deploy_context: "dev",
        site_url,
        id: site_id,
        netlify_id: site_id,
        iss: "netlify",
        exp: Utc::now().timestamp() + SIGNATURE_TTL_SECS,
    };
    encode(&Header::default(), &claims, &EncodingKey::from_secret(secret.as_bytes()))
}
