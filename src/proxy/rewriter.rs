//! Interface to the redirect and rewrite rule engine.
//!
//! Rule matching itself lives outside this crate; the router only builds a
//! [`RuleRequest`] and acts on the [`Match`] it gets back.

use crate::http::{headers, DevRequest};
use async_trait::async_trait;
use hyper::header::ACCEPT_LANGUAGE;
use hyper::HeaderMap;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// A redirect or rewrite rule that matched a request.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct Match {
    pub from: String,
    /// Destination path or absolute URL.
    pub to: String,
    pub status: Option<u16>,
    /// Apply even when a static file exists at the source path.
    pub force: bool,
    /// Answer with the 404 page without looking any further.
    pub force404: bool,
    /// Rule exceptions keyed by kind; `JWT` holds the allowed roles.
    pub exceptions: BTreeMap<String, String>,
    /// Headers added to the request before it is forwarded.
    pub proxy_headers: BTreeMap<String, String>,
    /// Name of the environment variable holding the signing secret.
    pub signing_secret: Option<String>,
}

impl Match {
    pub fn new(from: impl Into<String>, to: impl Into<String>) -> Self {
        Self {
            from: from.into(),
            to: to.into(),
            ..Default::default()
        }
    }

    pub fn status(mut self, status: u16) -> Self {
        self.status = Some(status);
        self
    }

    pub fn forced(mut self) -> Self {
        self.force = true;
        self
    }

    /// Roles allowed by a JWT-gated rule.
    pub fn jwt_roles(&self) -> Option<&str> {
        self.exceptions.get("JWT").map(String::as_str)
    }

    /// Whether the destination is an absolute `http(s)` URL.
    pub fn is_external(&self) -> bool {
        self.to.starts_with("http://") || self.to.starts_with("https://")
    }

    /// Whether the rule answers with a redirect instead of a rewrite.
    pub fn is_redirect(&self) -> bool {
        self.status.map_or(false, is_redirect_status)
    }

    /// Whether the rule asked for its proxy to stay out of the logs.
    pub fn is_hidden_proxy(&self) -> bool {
        self.proxy_headers
            .iter()
            .any(|(key, value)| key.eq_ignore_ascii_case(headers::HIDDEN_PROXY) && value == "true")
    }
}

pub(crate) fn is_redirect_status(status: u16) -> bool {
    (300..400).contains(&status)
}

/// What the rule engine sees of a request.
#[derive(Debug, Clone)]
pub struct RuleRequest {
    pub scheme: String,
    pub host: String,
    /// Percent-decoded path.
    pub path: String,
    pub query: Option<String>,
    /// Request headers plus `x-language` and `x-country`.
    pub headers: HeaderMap,
    pub language: String,
    pub country: String,
}

impl RuleRequest {
    /// Describe `req` for rule matching.
    ///
    /// The language comes from the `nf_lang` cookie or `Accept-Language`; the
    /// country from the `nf_country` cookie or the configured country.
    pub fn from_request(req: &DevRequest, country: Option<&str>) -> Self {
        let cookies = req.cookies();
        let language = cookies
            .get("nf_lang")
            .cloned()
            .or_else(|| {
                req.get_header(ACCEPT_LANGUAGE.as_str())
                    .map(|value| value.chars().take(2).collect::<String>())
                    .filter(|value| !value.is_empty())
            })
            .unwrap_or_else(|| "en".to_string());
        let country = cookies
            .get("nf_country")
            .cloned()
            .or_else(|| country.map(str::to_string))
            .unwrap_or_else(|| "us".to_string());

        let mut rule_request = Self {
            scheme: req.scheme.to_string(),
            host: req.host(),
            path: req.decoded_path(),
            query: req.query.clone(),
            headers: req.headers.clone(),
            language,
            country,
        };
        for (name, value) in [
            (headers::LANGUAGE, rule_request.language.clone()),
            (headers::COUNTRY, rule_request.country.clone()),
        ] {
            if let Ok(value) = value.parse() {
                rule_request.headers.insert(name, value);
            }
        }
        rule_request
    }
}

/// The redirect/rewrite rule engine.
#[async_trait]
pub trait Rewriter: Send + Sync {
    /// The rule matching `req`, if any.
    async fn rewrite(&self, req: &RuleRequest) -> Option<Match>;
}

/// A rule engine without rules.
pub struct NoRules;

#[async_trait]
impl Rewriter for NoRules {
    async fn rewrite(&self, _req: &RuleRequest) -> Option<Match> {
        None
    }
}
