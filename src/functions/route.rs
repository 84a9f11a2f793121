//! Custom URL routes declared by functions.

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// HTTP method a route accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RouteMethod {
    Get,
    Post,
    Put,
    Delete,
    Patch,
    Head,
    Options,
}

impl RouteMethod {
    /// Check if this method matches the given method string.
    pub fn matches(&self, method: &str) -> bool {
        self.as_str().eq_ignore_ascii_case(method)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RouteMethod::Get => "GET",
            RouteMethod::Post => "POST",
            RouteMethod::Put => "PUT",
            RouteMethod::Delete => "DELETE",
            RouteMethod::Patch => "PATCH",
            RouteMethod::Head => "HEAD",
            RouteMethod::Options => "OPTIONS",
        }
    }
}

/// A route from a function's build data.
///
/// Exactly one of `literal` and `expression` is normally set. `pattern` is
/// the path the author wrote and is what the adapter reports as the route.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FunctionRoute {
    pub pattern: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub literal: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expression: Option<String>,
    /// Accepted methods; empty accepts any.
    #[serde(default)]
    pub methods: Vec<RouteMethod>,
    /// Yield to a static file at the same path.
    #[serde(default)]
    pub prefer_static: bool,
}

impl FunctionRoute {
    /// Route matching exactly `path`.
    pub fn literal(path: impl Into<String>) -> Self {
        let path = path.into();
        Self {
            pattern: path.clone(),
            literal: Some(path),
            ..Default::default()
        }
    }

    /// Route matching the regular expression `expression`.
    pub fn expression(pattern: impl Into<String>, expression: impl Into<String>) -> Self {
        Self {
            pattern: pattern.into(),
            expression: Some(expression.into()),
            ..Default::default()
        }
    }

    pub fn methods(mut self, methods: Vec<RouteMethod>) -> Self {
        self.methods = methods;
        self
    }

    pub fn prefer_static(mut self, prefer: bool) -> Self {
        self.prefer_static = prefer;
        self
    }

    /// Whether the route accepts `method` on the normalized `path`.
    pub fn matches(&self, path: &str, method: &str) -> bool {
        if !self.methods.is_empty() && !self.methods.iter().any(|m| m.matches(method)) {
            return false;
        }
        if let Some(literal) = &self.literal {
            return literal == path;
        }
        if let Some(expression) = &self.expression {
            return match Regex::new(expression) {
                Ok(regex) => regex.is_match(path),
                Err(err) => {
                    warn!("Invalid route expression {}: {}", expression, err);
                    false
                }
            };
        }
        false
    }
}

/// Normalize a request path for route matching: drop the trailing slash
/// (except for `/`) and lowercase.
pub fn normalize_path(path: &str) -> String {
    let trimmed = if path.len() > 1 {
        path.strip_suffix('/').unwrap_or(path)
    } else {
        path
    };
    trimmed.to_lowercase()
}
