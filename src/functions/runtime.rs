//! Function runtimes: the components that build and execute function code.

use crate::functions::event::{ClientContext, InvocationError, InvocationEvent, LambdaResponse};
use crate::functions::route::FunctionRoute;
use async_trait::async_trait;
use serde_json::json;
use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

/// A function as handed to its runtime.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionSource {
    pub name: String,
    /// Entry point, possibly replaced by the build output.
    pub main_file: PathBuf,
    /// Directory holding the function, for directory-style functions.
    pub directory: Option<PathBuf>,
}

/// Output of a successful build.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BuildResult {
    /// Built entry point, when it differs from the source.
    pub main_file: Option<PathBuf>,
    /// Source files the build read; watched for changes.
    pub src_files: Vec<PathBuf>,
    /// Extra files bundled with the function; also watched.
    pub included_files: Vec<PathBuf>,
    pub routes: Vec<FunctionRoute>,
    /// Schedule found in the function source.
    pub schedule: Option<String>,
    pub runtime_api_version: u8,
}

/// One invocation of a function.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub event: InvocationEvent,
    pub context: ClientContext,
    pub timeout: Duration,
}

/// Builds and runs functions of one runtime kind.
///
/// `Ok(None)` from `invoke` means the function finished without producing
/// a response.
#[async_trait]
pub trait FunctionRuntime: Send + Sync {
    /// Runtime name, as assigned by the function lister.
    fn name(&self) -> &str;

    async fn build(&self, function: &FunctionSource) -> Result<BuildResult, InvocationError>;

    async fn invoke(
        &self,
        function: &FunctionSource,
        invocation: Invocation,
    ) -> Result<Option<LambdaResponse>, InvocationError>;
}

/// Runs executable functions as child processes.
///
/// The process receives `{"event": .., "context": ..}` as JSON on stdin and
/// must print the response object as JSON on stdout.
pub struct ProcessRuntime {
    env: HashMap<String, String>,
}

impl ProcessRuntime {
    pub const NAME: &'static str = "exec";

    pub fn new(env: HashMap<String, String>) -> Self {
        Self { env }
    }
}

#[async_trait]
impl FunctionRuntime for ProcessRuntime {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn build(&self, function: &FunctionSource) -> Result<BuildResult, InvocationError> {
        if !tokio::fs::try_exists(&function.main_file).await? {
            return Err(InvocationError::new(format!(
                "Entry point {} does not exist",
                function.main_file.display()
            )));
        }
        Ok(BuildResult {
            src_files: vec![function.main_file.clone()],
            ..Default::default()
        })
    }

    async fn invoke(
        &self,
        function: &FunctionSource,
        invocation: Invocation,
    ) -> Result<Option<LambdaResponse>, InvocationError> {
        let input = serde_json::to_vec(&json!({
            "event": invocation.event,
            "context": { "clientContext": invocation.context },
        }))?;

        let mut command = Command::new(&function.main_file);
        command
            .envs(&self.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &function.directory {
            command.current_dir(dir);
        }

        debug!("Spawning {}", function.main_file.display());
        let mut child = command.spawn()?;
        if let Some(mut stdin) = child.stdin.take() {
            // A function that never reads its input closes the pipe early.
            if let Err(err) = stdin.write_all(&input).await {
                debug!("Could not write event to {}: {}", function.name, err);
            }
        }
        let output = child.wait_with_output().await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let mut lines = stderr.lines().map(str::to_string);
            let message = lines
                .next()
                .unwrap_or_else(|| format!("process exited with {}", output.status));
            return Err(InvocationError::with_type("ProcessError", message).stack(lines.collect()));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let stdout = stdout.trim();
        if stdout.is_empty() || stdout == "null" {
            return Ok(None);
        }
        LambdaResponse::from_value(serde_json::from_str(stdout)?).map(Some)
    }
}
