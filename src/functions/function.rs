//! A single local function and its build state.

use crate::functions::event::{ClientContext, InvocationError, InvocationEvent, LambdaResponse};
use crate::functions::packaging::FunctionDescriptor;
use crate::functions::route::{normalize_path, FunctionRoute};
use crate::functions::runtime::{BuildResult, FunctionRuntime, FunctionSource, Invocation};
use crate::runtime::{BlobsContext, FunctionsSettings};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use cron::Schedule;
use serde_json::json;
use std::collections::BTreeSet;
use std::future::Future;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, warn};

const BACKGROUND_SUFFIX: &str = "-background";

/// Whether `name` only has alphanumerics, hyphens and underscores.
pub fn is_valid_name(name: &str) -> bool {
    !name.is_empty()
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

/// Parse a cron expression, accepting the 5-field form without seconds.
pub fn parse_schedule(expression: &str) -> Result<Schedule, cron::error::Error> {
    let expression = expression.trim();
    if expression.split_whitespace().count() == 5 {
        Schedule::from_str(&format!("0 {}", expression))
    } else {
        Schedule::from_str(expression)
    }
}

/// Source files gained and lost by a rebuild.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SrcFilesDiff {
    pub added: Vec<PathBuf>,
    pub deleted: Vec<PathBuf>,
    pub included_files: Vec<PathBuf>,
}

#[derive(Default)]
struct BuildState {
    result: Option<BuildResult>,
    error: Option<InvocationError>,
    src_files: BTreeSet<PathBuf>,
}

/// A function registered from disk.
///
/// Builds hold the state lock for writing, so invocations and route lookups
/// wait for an in-progress build to settle.
pub struct LocalFunction {
    source: FunctionSource,
    extension: String,
    runtime: Arc<dyn FunctionRuntime>,
    config_schedule: Option<String>,
    timeout: Duration,
    background_timeout: Duration,
    blobs: Option<BlobsContext>,
    state: RwLock<BuildState>,
}

impl LocalFunction {
    pub fn new(
        descriptor: &FunctionDescriptor,
        runtime: Arc<dyn FunctionRuntime>,
        settings: &FunctionsSettings,
        blobs: Option<BlobsContext>,
    ) -> Self {
        Self {
            source: FunctionSource {
                name: descriptor.name.clone(),
                main_file: descriptor.main_file.clone(),
                directory: descriptor.directory.clone(),
            },
            extension: descriptor.extension.clone(),
            runtime,
            config_schedule: settings
                .config
                .get(&descriptor.name)
                .and_then(|c| c.schedule.clone()),
            timeout: settings.timeout(),
            background_timeout: settings.background_timeout(),
            blobs,
            state: RwLock::new(BuildState::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.source.name
    }

    pub fn main_file(&self) -> &PathBuf {
        &self.source.main_file
    }

    pub fn extension(&self) -> &str {
        &self.extension
    }

    pub fn runtime_name(&self) -> &str {
        self.runtime.name()
    }

    pub fn has_valid_name(&self) -> bool {
        is_valid_name(self.name())
    }

    pub fn is_background(&self) -> bool {
        self.name().ends_with(BACKGROUND_SUFFIX)
    }

    /// Schedule from the site configuration, else from the build.
    pub async fn schedule(&self) -> Option<String> {
        if let Some(schedule) = &self.config_schedule {
            return Some(schedule.clone());
        }
        let state = self.state.read().await;
        state.result.as_ref().and_then(|r| r.schedule.clone())
    }

    pub async fn is_scheduled(&self) -> bool {
        self.schedule().await.is_some()
    }

    /// Next time the schedule fires, in UTC.
    pub async fn next_run(&self) -> Option<DateTime<Utc>> {
        let schedule = self.schedule().await?;
        match parse_schedule(&schedule) {
            Ok(parsed) => parsed.upcoming(Utc).next(),
            Err(err) => {
                warn!("Invalid schedule '{}' for function {}: {}", schedule, self.name(), err);
                None
            }
        }
    }

    pub async fn routes(&self) -> Vec<FunctionRoute> {
        let state = self.state.read().await;
        state
            .result
            .as_ref()
            .map(|r| r.routes.clone())
            .unwrap_or_default()
    }

    /// Runtime API version of the last build; unversioned builds count as 1.
    pub async fn runtime_api_version(&self) -> u8 {
        let state = self.state.read().await;
        state
            .result
            .as_ref()
            .map_or(1, |r| r.runtime_api_version.max(1))
    }

    pub async fn build_error(&self) -> Option<InvocationError> {
        self.state.read().await.error.clone()
    }

    /// Build the function, replacing any previous build result.
    pub async fn build(&self) -> Result<SrcFilesDiff, InvocationError> {
        let mut state = self.state.write().await;
        match self.runtime.build(&self.source).await {
            Ok(result) => {
                let src_files: BTreeSet<PathBuf> = result.src_files.iter().cloned().collect();
                let diff = SrcFilesDiff {
                    added: src_files.difference(&state.src_files).cloned().collect(),
                    deleted: state.src_files.difference(&src_files).cloned().collect(),
                    included_files: result.included_files.clone(),
                };
                state.src_files = src_files;
                state.result = Some(result);
                state.error = None;
                Ok(diff)
            }
            Err(err) => {
                state.error = Some(err.clone());
                Err(err)
            }
        }
    }

    /// Install build data computed elsewhere, as for packaged archives.
    pub async fn set_build(&self, result: BuildResult) {
        let mut state = self.state.write().await;
        state.src_files = result.src_files.iter().cloned().collect();
        state.result = Some(result);
        state.error = None;
    }

    /// The first route accepting `method` on `path`.
    ///
    /// `has_static` is only consulted for routes that yield to static files.
    pub async fn match_url_path<F, Fut>(
        &self,
        path: &str,
        method: &str,
        has_static: &F,
    ) -> Option<FunctionRoute>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = bool>,
    {
        let routes = self.routes().await;
        let path = normalize_path(path);
        let route = routes.into_iter().find(|r| r.matches(&path, method))?;
        if route.prefer_static && has_static().await {
            debug!("Static file shadows route {} of {}", route.pattern, self.name());
            return None;
        }
        Some(route)
    }

    /// Run the function with the given event.
    pub async fn invoke(
        &self,
        mut event: InvocationEvent,
        context: ClientContext,
    ) -> Result<Option<LambdaResponse>, InvocationError> {
        let source = {
            let state = self.state.read().await;
            if let Some(err) = &state.error {
                return Err(InvocationError::new(err.error_message.clone()));
            }
            let mut source = self.source.clone();
            if let Some(main_file) = state.result.as_ref().and_then(|r| r.main_file.clone()) {
                source.main_file = main_file;
            }
            source
        };

        if let Some(blobs) = &self.blobs {
            let payload = json!({ "url": blobs.url, "token": blobs.token });
            event.blobs = Some(BASE64.encode(payload.to_string()));
        }

        let timeout = if self.is_background() {
            self.background_timeout
        } else {
            self.timeout
        };
        let invocation = Invocation {
            event,
            context,
            timeout,
        };
        match tokio::time::timeout(timeout, self.runtime.invoke(&source, invocation)).await {
            Ok(result) => result,
            Err(_) => Err(InvocationError::with_type(
                "TimeoutError",
                format!("Task timed out after {:.2} seconds", timeout.as_secs_f64()),
            )),
        }
    }
}
