//! Error pages rendered by the proxy itself.

use serde::Deserialize;
use serde_json::json;
use std::io::Read;
use std::path::Path;
use tracing::warn;

const FUNCTION_ERROR_TEMPLATE: &str = include_str!("../templates/function-error.html");

pub(crate) fn escape_html(text: &str) -> String {
    let mut escaped = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => escaped.push_str("&amp;"),
            '<' => escaped.push_str("&lt;"),
            '>' => escaped.push_str("&gt;"),
            '"' => escaped.push_str("&quot;"),
            '\'' => escaped.push_str("&#39;"),
            other => escaped.push(other),
        }
    }
    escaped
}

/// Render the crash page for a function of the given kind
/// (`function` or `edge function`).
pub fn render_error_template(error: &str, function_type: &str) -> String {
    FUNCTION_ERROR_TEMPLATE
        .replace("<!--@ERROR-DETAILS-->", &escape_html(error))
        .replace("<!--@FUNCTION-TYPE-->", &escape_html(function_type))
}

/// Body of the `404.html` page in `dist`, or `Not Found`.
pub async fn render_404(dist: &Path) -> String {
    let page = dist.join("404.html");
    match tokio::fs::read_to_string(&page).await {
        Ok(body) => body,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => "Not Found".to_string(),
        Err(err) => {
            warn!("Error while serving 404.html file: {}", err);
            "Not Found".to_string()
        }
    }
}

/// Failure to read the error an edge function reported.
#[derive(Debug, thiserror::Error)]
pub enum EdgeErrorFormatError {
    #[error("failed to decompress error body: {0}")]
    Decompress(#[from] std::io::Error),
    #[error("malformed error body: {0}")]
    Parse(#[from] serde_json::Error),
}

#[derive(Debug, Deserialize)]
struct EdgeErrorBody {
    error: EdgeErrorDetails,
}

#[derive(Debug, Deserialize)]
struct EdgeErrorDetails {
    #[serde(default)]
    name: String,
    #[serde(default)]
    message: String,
    #[serde(default)]
    stack: String,
}

fn decompress(body: &[u8], encoding: Option<&str>) -> std::io::Result<Vec<u8>> {
    let mut out = Vec::new();
    match encoding.map(str::trim) {
        Some("gzip") => {
            flate2::read::GzDecoder::new(body).read_to_end(&mut out)?;
        }
        Some("deflate") => {
            flate2::read::ZlibDecoder::new(body).read_to_end(&mut out)?;
        }
        Some("br") => {
            brotli::Decompressor::new(body, 4096).read_to_end(&mut out)?;
        }
        _ => out.extend_from_slice(body),
    }
    Ok(out)
}

/// Format the uncaught error an edge function reported in its response body.
///
/// HTML clients get the JSON payload the crash template renders, others the
/// error and its stack as text.
pub fn format_edge_error(
    body: &[u8],
    content_encoding: Option<&str>,
    accepts_html: bool,
) -> Result<String, EdgeErrorFormatError> {
    let body = decompress(body, content_encoding)?;
    let EdgeErrorBody { error } = serde_json::from_slice(&body)?;

    if !accepts_html {
        return Ok(format!("{}: {}\n {}", error.name, error.message, error.stack));
    }
    let trace: Vec<&str> = error.stack.split('\n').collect();
    Ok(json!({
        "errorType": error.name,
        "errorMessage": error.message,
        "trace": trace,
    })
    .to_string())
}
