//! Local emulation of form submissions.
//!
//! A form POSTed to a path that no function serves is parsed and turned into
//! the JSON payload the platform hands to its `submission-created` handler,
//! and the request is redirected to that handler.

use crate::functions::registry::FunctionsRegistry;
use crate::http::{headers, DevRequest};
use bytes::Bytes;
use chrono::{SecondsFormat, Utc};
use hyper::header::{CONTENT_LENGTH, CONTENT_TYPE, REFERER, USER_AGENT};
use hyper::Method;
use serde_json::{json, Map, Value};
use std::convert::Infallible;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

/// Uploads older than this are removed on the next submission.
const UPLOAD_RETENTION: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Error)]
pub enum FormError {
    #[error("invalid multipart body: {0}")]
    Multipart(#[from] multer::Error),
    #[error("failed to store uploaded file: {0}")]
    Io(#[from] std::io::Error),
}

const FIELD_ALIASES: &[(&str, &[&str])] = &[
    ("company", &["company", "business", "employer"]),
    ("last_name", &["lastname", "surname", "byname"]),
    ("first_name", &["firstname", "givenname", "forename"]),
    ("name", &["name", "fullname"]),
    ("email", &["email", "mail", "from", "twitter", "sender"]),
    ("title", &["title", "subject"]),
];

/// Add `value` under `key`, turning repeated keys into arrays.
fn push_value(map: &mut Map<String, Value>, key: String, value: Value) {
    match map.get_mut(&key) {
        Some(Value::Array(values)) => values.push(value),
        Some(existing) => {
            let first = existing.take();
            *existing = Value::Array(vec![first, value]);
        }
        None => {
            map.insert(key, value);
        }
    }
}

fn capitalize(key: &str) -> String {
    let mut chars = key.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

fn lookup(fields: &Map<String, Value>, aliases: &[&str]) -> Option<Value> {
    fields
        .iter()
        .find(|(name, _)| aliases.contains(&name.to_lowercase().as_str()))
        .map(|(_, value)| value.clone())
}

fn parse_urlencoded(body: &[u8]) -> Map<String, Value> {
    let mut fields = Map::new();
    for (key, value) in url::form_urlencoded::parse(body) {
        push_value(&mut fields, key.into_owned(), Value::String(value.into_owned()));
    }
    fields
}

async fn prune_uploads(dir: &Path) {
    let Ok(mut entries) = tokio::fs::read_dir(dir).await else {
        return;
    };
    while let Ok(Some(entry)) = entries.next_entry().await {
        let stale = entry
            .metadata()
            .await
            .ok()
            .and_then(|meta| meta.modified().ok())
            .and_then(|modified| modified.elapsed().ok())
            .map_or(false, |age| age > UPLOAD_RETENTION);
        if stale {
            if let Err(err) = tokio::fs::remove_file(entry.path()).await {
                debug!("Could not remove upload {}: {}", entry.path().display(), err);
            }
        }
    }
}

async fn parse_multipart(
    content_type: &str,
    body: Bytes,
    uploads: &Path,
) -> Result<(Map<String, Value>, Map<String, Value>), FormError> {
    let boundary = multer::parse_boundary(content_type)?;
    let stream = futures::stream::once(async move { Ok::<Bytes, Infallible>(body) });
    let mut multipart = multer::Multipart::new(stream, boundary);

    let mut fields = Map::new();
    let mut files = Map::new();
    while let Some(field) = multipart.next_field().await? {
        let name = field.name().unwrap_or_default().to_string();
        match field.file_name().map(str::to_string) {
            Some(filename) => {
                let file_type = field.content_type().map(|mime| mime.to_string());
                let data = field.bytes().await?;
                tokio::fs::create_dir_all(uploads).await?;
                let path = tempfile::Builder::new()
                    .prefix("upload-")
                    .tempfile_in(uploads)?
                    .into_temp_path()
                    .keep()
                    .map_err(|err| err.error)?;
                tokio::fs::write(&path, &data).await?;
                let file = json!({
                    "filename": filename,
                    "size": data.len(),
                    "type": file_type,
                    "url": path.to_string_lossy(),
                });
                push_value(&mut files, name, file);
            }
            None => {
                let text = field.text().await?;
                push_value(&mut fields, name, Value::String(text));
            }
        }
    }
    Ok((fields, files))
}

fn file_urls(file: &Value) -> Value {
    match file {
        Value::Array(entries) => Value::Array(entries.iter().map(|e| e["url"].clone()).collect()),
        other => other["url"].clone(),
    }
}

fn build_payload(
    req: &DevRequest,
    fields: Map<String, Value>,
    files: Map<String, Value>,
    site_url: &str,
) -> Value {
    let mut payload = Map::new();
    for (key, aliases) in FIELD_ALIASES {
        if let Some(value) = lookup(&fields, aliases) {
            payload.insert(key.to_string(), value);
        }
    }

    let mut human = fields.clone();
    for (name, file) in &files {
        human.insert(name.clone(), file_urls(file));
    }
    let human_fields: Map<String, Value> = human
        .iter()
        .map(|(key, value)| (capitalize(key), value.clone()))
        .collect();
    let ordered_human_fields: Vec<Value> = human
        .iter()
        .map(|(key, value)| json!({ "title": capitalize(key), "name": key, "value": value }))
        .collect();

    let mut data = fields;
    data.extend(files);
    data.insert("ip".to_string(), json!(req.remote_addr.ip().to_string()));
    data.insert(
        "user_agent".to_string(),
        json!(req.get_header(USER_AGENT.as_str())),
    );
    data.insert("referrer".to_string(), json!(req.get_header(REFERER.as_str())));

    payload.insert("data".to_string(), Value::Object(data));
    payload.insert(
        "created_at".to_string(),
        json!(Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)),
    );
    payload.insert("human_fields".to_string(), Value::Object(human_fields));
    payload.insert("ordered_human_fields".to_string(), Value::Array(ordered_human_fields));
    payload.insert("site_url".to_string(), json!(site_url));

    json!({ "payload": payload })
}

/// Rewrite a form POST into an invocation of the form handler.
///
/// Requests that are not form submissions, or that some function already
/// serves, are left untouched.
pub async fn rewrite_form_submission(
    registry: &FunctionsRegistry,
    req: &mut DevRequest,
    site_url: &str,
) {
    if req.path.starts_with("/.netlify/") || req.method != Method::POST {
        return;
    }
    let no_static = || async { false };
    if registry
        .get_function_for_url_path(&req.url(), req.method.as_str(), &no_static)
        .await
        .is_some()
    {
        return;
    }
    let Some(handler) = registry.form_handler().await else {
        warn!("Missing form submission function handler");
        return;
    };

    let body = req.body.clone().unwrap_or_default();
    let (fields, files) = match req.content_type().as_deref() {
        Some(ct) if ct.ends_with("/x-www-form-urlencoded") => (parse_urlencoded(&body), Map::new()),
        Some("multipart/form-data") => {
            let raw_type = req.get_header(CONTENT_TYPE.as_str()).unwrap_or_default().to_string();
            let uploads = registry.uploads_dir();
            prune_uploads(&uploads).await;
            match parse_multipart(&raw_type, body, &uploads).await {
                Ok(parsed) => parsed,
                Err(err) => {
                    warn!("{}", err);
                    return;
                }
            }
        }
        _ => {
            warn!("Invalid Content-Type for Netlify Dev forms request");
            return;
        }
    };

    let payload = build_payload(req, fields, files, site_url).to_string();
    let pathname = req.path.clone();
    let search = req.search();

    req.set_header(CONTENT_TYPE.as_str(), "application/json");
    req.set_header(CONTENT_LENGTH.as_str(), &payload.len().to_string());
    req.set_header(headers::ORIGINAL_PATHNAME, &pathname);
    if !search.is_empty() {
        req.set_header(headers::ORIGINAL_SEARCH, &search);
    }
    req.body = Some(Bytes::from(payload));
    req.set_url(&format!("/.netlify/functions/{}{}", handler.name(), search));
}
