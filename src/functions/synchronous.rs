//! Turning the result of a synchronous invocation into an HTTP response.

use crate::functions::event::{InvocationError, LambdaBody, LambdaResponse};
use crate::http::{full, Body, DevResponse};
use crate::proxy::render_error_template;
use base64::Engine;
use bytes::Bytes;
use hyper::header::{HeaderName, HeaderValue, CONTENT_LENGTH};
use hyper::{HeaderMap, Response, StatusCode};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use tracing::error;

/// Build the response for a synchronous function invocation.
pub fn handle_synchronous(
    name: &str,
    result: Result<Option<LambdaResponse>, InvocationError>,
    accepts_html: bool,
) -> Response<Body> {
    let response = match result {
        Ok(response) => response,
        Err(err) => {
            error!(
                "Function {} has returned an error: {}\n{}",
                name,
                err.error_message,
                err.stack_trace.join("\n")
            );
            return handle_err(&format_error(&err, accepts_html), accepts_html);
        }
    };

    let (response, status) = match validate(response) {
        Ok(valid) => valid,
        Err(message) => {
            error!("{}", message);
            return handle_err(&message, accepts_html);
        }
    };

    let mut headers = HeaderMap::new();
    if let Err(message) = add_headers(&mut headers, &response.headers)
        .and_then(|_| add_headers(&mut headers, &response.multi_value_headers))
    {
        error!("Failed to set header in function {}: {}", name, message);
        let err = InvocationError::new(message);
        return handle_err(&format_error(&err, accepts_html), accepts_html);
    }

    let body = match response.body {
        Some(LambdaBody::Stream(stream)) => {
            headers.remove(CONTENT_LENGTH);
            let mut out = Response::new(stream);
            *out.status_mut() = status;
            *out.headers_mut() = headers;
            return out;
        }
        Some(LambdaBody::Text(text)) if response.is_base64_encoded => {
            match base64::engine::general_purpose::STANDARD.decode(text.as_bytes()) {
                Ok(bytes) => Bytes::from(bytes),
                Err(err) => {
                    let message = format!("Function {} returned an invalid base64 body: {}", name, err);
                    error!("{}", message);
                    return handle_err(&message, accepts_html);
                }
            }
        }
        Some(LambdaBody::Text(text)) => Bytes::from(text),
        _ => Bytes::new(),
    };

    headers.insert(CONTENT_LENGTH, HeaderValue::from(body.len()));
    let mut out = Response::new(full(body));
    *out.status_mut() = status;
    *out.headers_mut() = headers;
    out
}

fn validate(response: Option<LambdaResponse>) -> Result<(LambdaResponse, StatusCode), String> {
    let Some(response) = response else {
        return Err(
            "no lambda response. check your function code again. make sure to return a promise or use the callback."
                .to_string(),
        );
    };

    let status = response
        .status()
        .and_then(|code| StatusCode::from_u16(code).ok())
        .ok_or_else(|| {
            format!(
                "Your function response must have a numerical statusCode. You gave: {}",
                response.status_code
            )
        })?;

    if let Some(LambdaBody::Other(value)) = &response.body {
        return Err(format!(
            "Your function response must have a string or a stream body. You gave: {}",
            value
        ));
    }

    Ok((response, status))
}

fn header_text(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn add_headers(headers: &mut HeaderMap, values: &BTreeMap<String, Value>) -> Result<(), String> {
    for (key, value) in values {
        let name = HeaderName::from_bytes(key.as_bytes())
            .map_err(|_| format!("Invalid header name \"{}\"", key))?;

        let texts: Vec<String> = match value {
            Value::Array(items) => items.iter().map(header_text).collect::<Option<_>>(),
            other => header_text(other).map(|text| vec![text]),
        }
        .ok_or_else(|| format!("Invalid value \"{}\" for header \"{}\"", value, key))?;

        headers.remove(&name);
        for text in texts {
            let value = HeaderValue::from_str(&text)
                .map_err(|_| format!("Invalid character in header content [\"{}\"]", key))?;
            headers.append(name.clone(), value);
        }
    }
    Ok(())
}

/// Format an invocation error for the error page.
///
/// HTML pages receive a JSON payload the template renders; plain text
/// clients get the error and its stack.
pub fn format_error(err: &InvocationError, accepts_html: bool) -> String {
    let trace: Vec<String> = err
        .stack_trace
        .iter()
        .map(|line| format!("    at {}", line))
        .collect();

    if accepts_html {
        json!({
            "errorType": err.error_type,
            "errorMessage": err.error_message,
            "trace": trace,
        })
        .to_string()
    } else {
        format!("{}: {}\n {}", err.error_type, err.error_message, trace.join("\n"))
    }
}

/// A 500 response carrying `message` as text or inside the error template.
pub fn handle_err(message: &str, accepts_html: bool) -> Response<Body> {
    if accepts_html {
        DevResponse::new(StatusCode::INTERNAL_SERVER_ERROR)
            .header("content-type", "text/html")
            .body(render_error_template(message, "function"))
            .into_response()
    } else {
        DevResponse::text(StatusCode::INTERNAL_SERVER_ERROR, message).into_response()
    }
}
