//! Token handling for role-gated rules.
//!
//! Tokens are decoded, never verified: locally there is no identity
//! provider whose signature could be checked.

use jsonwebtoken::{decode, DecodingKey, Validation};
use serde_json::Value;
use std::collections::HashSet;
use tracing::warn;

/// Cookie carrying the identity token.
pub const JWT_COOKIE: &str = "nf_jwt";

/// Path a request is sent to when a role-gated rule denies access.
pub const NOT_FOUND_PATH: &str = "/.netlify/non-existent-path";

/// Decode the claims of a JWT without checking its signature or expiry.
pub fn decode_claims(token: &str) -> Result<Value, jsonwebtoken::errors::Error> {
    let mut validation = Validation::default();
    validation.insecure_disable_signature_validation();
    validation.validate_exp = false;
    validation.validate_aud = false;
    validation.required_spec_claims.clear();
    decode::<Value>(token, &DecodingKey::from_secret(&[]), &validation).map(|data| data.claims)
}

/// Outcome of checking a token against a rule's allowed roles.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoleCheck {
    /// Serve the rule as usual.
    Allowed,
    /// Serve the not-found path instead.
    Denied,
    /// The token cannot be read; answer 400.
    Invalid,
}

fn claim_at<'a>(claims: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.')
        .filter(|segment| !segment.is_empty())
        .try_fold(claims, |value, segment| value.get(segment))
}

/// Check `token` against the comma separated `allowed_roles` of a rule.
///
/// Roles are read at the dot separated `role_path`; `now` is the current
/// UNIX time in seconds.
pub fn check_roles(token: Option<&str>, allowed_roles: &str, role_path: &str, now: i64) -> RoleCheck {
    let Some(token) = token else {
        return RoleCheck::Denied;
    };
    let claims = match decode_claims(token) {
        Ok(claims) => claims,
        Err(err) => {
            warn!("Error while decoding JWT provided in request: {}", err);
            return RoleCheck::Invalid;
        }
    };

    let exp = claims.get("exp").and_then(Value::as_i64).unwrap_or(0);
    if exp < now {
        warn!("Expired JWT provided in request");
        return RoleCheck::Denied;
    }

    let presented = match claim_at(&claims, role_path) {
        None | Some(Value::Null) => return RoleCheck::Denied,
        Some(Value::Array(roles)) => roles,
        Some(other) => {
            warn!("Invalid roles value provided in JWT {}: {}", role_path, other);
            return RoleCheck::Invalid;
        }
    };

    let expected: HashSet<&str> = allowed_roles
        .split(',')
        .map(|role| role.trim())
        .map(|role| role.strip_prefix(':').unwrap_or(role))
        .collect();
    if presented
        .iter()
        .filter_map(Value::as_str)
        .any(|role| expected.contains(role))
    {
        RoleCheck::Allowed
    } else {
        RoleCheck::Denied
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use jsonwebtoken::{encode, EncodingKey, Header};
    use serde_json::json;

    const ROLE_PATH: &str = "app_metadata.authorization.roles";
    const NOW: i64 = 1_700_000_000;

    fn token(claims: Value) -> String {
        encode(&Header::default(), &claims, &EncodingKey::from_secret(b"anything")).unwrap()
    }

    #[test]
    fn test_decode_ignores_signature_and_expiry() {
        let claims = decode_claims(&token(json!({ "sub": "1", "exp": 10 }))).unwrap();
        assert_eq!(claims["sub"], "1");
        assert!(decode_claims("not-a-token").is_err());
    }

    #[test]
    fn test_matching_role_is_allowed() {
        let jwt = token(json!({
            "exp": NOW + 60,
            "app_metadata": { "authorization": { "roles": ["editor"] } }
        }));
        assert_eq!(check_roles(Some(&jwt), "admin, :editor", ROLE_PATH, NOW), RoleCheck::Allowed);
    }

    #[test]
    fn test_expired_or_mismatched_is_denied() {
        let expired = token(json!({
            "exp": NOW - 1,
            "app_metadata": { "authorization": { "roles": ["admin"] } }
        }));
        assert_eq!(check_roles(Some(&expired), "admin", ROLE_PATH, NOW), RoleCheck::Denied);

        let other = token(json!({
            "exp": NOW + 60,
            "app_metadata": { "authorization": { "roles": ["viewer"] } }
        }));
        assert_eq!(check_roles(Some(&other), "admin", ROLE_PATH, NOW), RoleCheck::Denied);
        assert_eq!(check_roles(None, "admin", ROLE_PATH, NOW), RoleCheck::Denied);
    }

    #[test]
    fn test_unreadable_token_is_invalid() {
        assert_eq!(check_roles(Some("garbage"), "admin", ROLE_PATH, NOW), RoleCheck::Invalid);

        let scalar = token(json!({
            "exp": NOW + 60,
            "app_metadata": { "authorization": { "roles": "admin" } }
        }));
        assert_eq!(check_roles(Some(&scalar), "admin", ROLE_PATH, NOW), RoleCheck::Invalid);
    }
}
