//! Responses for scheduled functions invoked by hand.
//!
//! In production only the scheduler calls these functions and nobody sees
//! the response. Locally the developer gets a short report instead: what was
//! invoked, whether it failed and which parts of the result would be ignored.

use crate::functions::event::{InvocationError, LambdaResponse};
use crate::http::{Body, DevResponse};
use crate::proxy::escape_html;
use hyper::{Response, StatusCode};

/// User agent of the scheduler.
pub const CLOCKWORK_USER_AGENT: &str = "Netlify Clockwork";

fn describe_error(err: &InvocationError) -> String {
    let mut text = err.to_string();
    for frame in &err.stack_trace {
        text.push('\n');
        text.push_str(frame);
    }
    text
}

fn to_plain_text(paragraph: &str) -> String {
    paragraph
        .replace("<pre><code>", "```\n")
        .replace("</code></pre>", "\n```")
        .replace("<code>", "`")
        .replace("</code>", "`")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&amp;", "&")
}

fn html_document(paragraphs: &[String]) -> String {
    let body: String = paragraphs
        .iter()
        .map(|p| format!("<p>{}</p>", p.replace("\n\n", "</p><p>")))
        .collect();
    format!(
        "<!DOCTYPE html><html><head><meta charset=\"utf-8\"><title>Scheduled Function</title>\
         <style>body{{font-family:sans-serif;max-width:48rem;margin:3rem auto;line-height:1.5}}\
         pre{{background:#f4f4f4;padding:1rem;overflow:auto}}</style></head>\
         <body><h1>Scheduled Function</h1>{}</body></html>",
        body
    )
}

/// Render the report for an invocation of a scheduled function.
///
/// `ignore_result` skips the check for ignored response keys, for runtimes
/// whose responses are not produced by user code.
pub fn handle_scheduled(
    path: &str,
    user_agent: Option<&str>,
    accepts_html: bool,
    result: Result<Option<LambdaResponse>, InvocationError>,
    ignore_result: bool,
) -> Response<Body> {
    let mut paragraphs = Vec::new();

    if user_agent != Some(CLOCKWORK_USER_AGENT) {
        paragraphs.push(format!(
            "You performed an HTTP request to <code>{}</code>, which is a scheduled function. \
             You can do this to test your functions locally, but it won't work in production.",
            escape_html(path)
        ));
    }

    let failed = result.is_err();
    match &result {
        Err(err) => paragraphs.push(format!(
            "There was an error during execution of your scheduled function:\n\n<pre><code>{}</code></pre>",
            escape_html(&describe_error(err))
        )),
        Ok(Some(response)) if !ignore_result => {
            let keys = response.extra_keys();
            if !keys.is_empty() {
                let keys: Vec<String> = keys
                    .iter()
                    .map(|k| format!("<code>{}</code>", escape_html(k)))
                    .collect();
                paragraphs.push(format!(
                    "Your function returned {}. Is this an accident? It won't work in production.",
                    keys.join(", ")
                ));
            }
        }
        Ok(_) => {}
    }

    let status = if failed {
        StatusCode::INTERNAL_SERVER_ERROR
    } else {
        StatusCode::OK
    };

    if accepts_html {
        DevResponse::html(status, html_document(&paragraphs)).into_response()
    } else {
        let text: Vec<String> = paragraphs.iter().map(|p| to_plain_text(p)).collect();
        DevResponse::text(status, text.join("\n\n")).into_response()
    }
}
