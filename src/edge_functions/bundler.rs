//! Interface to the external edge function bundler and isolate.

use crate::edge_functions::declaration::{FunctionConfig, Tier};
use crate::edge_functions::graph::ModuleGraph;
use crate::runtime::DevConfig;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::io::AsyncWriteExt;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// An edge function source file found on disk.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EdgeFunction {
    pub name: String,
    /// Entry module.
    pub path: PathBuf,
    pub tier: Tier,
}

impl EdgeFunction {
    pub fn new(name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        Self {
            name: name.into(),
            path: path.into(),
            tier: Tier::User,
        }
    }
}

/// Outcome of a bundler run.
#[derive(Debug, Clone, Default)]
pub struct BuildOutput {
    pub success: bool,
    /// In-source configuration keyed by function name.
    pub function_configs: HashMap<String, FunctionConfig>,
    /// Module graph of everything the build loaded.
    pub graph: Option<ModuleGraph>,
}

/// Errors from the bundler or from the registry around it.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BundlerError {
    #[error("failed to find edge functions: {0}")]
    Find(String),
    #[error("{0}")]
    Build(String),
    #[error("edge functions build was aborted: {0}")]
    Aborted(String),
}

impl From<tokio::task::JoinError> for BundlerError {
    fn from(err: tokio::task::JoinError) -> Self {
        BundlerError::Aborted(err.to_string())
    }
}

/// The bundler and isolate process that compiles and serves edge functions.
#[async_trait]
pub trait EdgeBundler: Send + Sync {
    /// List the edge functions in the given directories.
    async fn find(&self, directories: &[PathBuf]) -> Result<Vec<EdgeFunction>, BundlerError>;

    /// Build the functions and load them into the isolate.
    async fn build(
        &self,
        functions: &[EdgeFunction],
        env: &HashMap<String, String>,
    ) -> Result<BuildOutput, BundlerError>;
}

const EXTENSIONS: &[&str] = &["ts", "tsx", "js", "jsx", "mjs", "mts"];

fn entry_in(dir: &Path, name: &str) -> Option<PathBuf> {
    ["index", name].iter().find_map(|stem| {
        EXTENSIONS
            .iter()
            .map(|ext| dir.join(format!("{}.{}", stem, ext)))
            .find(|candidate| candidate.is_file())
    })
}

/// List `*.{ts,js,mjs,tsx,jsx}` entries in `directories`.
///
/// Each top-level file is a function named after its stem; a directory is a
/// function when it holds an `index` or same-named entry.
pub async fn find_entries(directories: &[PathBuf]) -> Result<Vec<EdgeFunction>, BundlerError> {
    let mut functions = Vec::new();
    for directory in directories {
        let mut entries = match tokio::fs::read_dir(directory).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
            Err(err) => return Err(BundlerError::Find(err.to_string())),
        };
        let mut found = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| BundlerError::Find(e.to_string()))?
        {
            let path = entry.path();
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()).map(str::to_string)
            else {
                continue;
            };
            if path.is_dir() {
                if let Some(entry) = entry_in(&path, &stem) {
                    found.push(EdgeFunction::new(stem, entry));
                }
            } else if path
                .extension()
                .and_then(|e| e.to_str())
                .map_or(false, |e| EXTENSIONS.contains(&e))
            {
                found.push(EdgeFunction::new(stem, path));
            }
        }
        found.sort_by(|a, b| a.name.cmp(&b.name));
        functions.extend(found);
    }
    Ok(functions)
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct BuildRequest<'a> {
    functions: Vec<BuildEntry<'a>>,
    isolate_port: u16,
}

#[derive(Serialize)]
struct BuildEntry<'a> {
    name: &'a str,
    path: &'a Path,
    tier: Tier,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct BuildReport {
    success: bool,
    #[serde(alias = "function_configs")]
    function_configs: HashMap<String, FunctionConfig>,
    graph: Option<ModuleGraph>,
}

fn command(argv: &[String], what: &str) -> Result<Command, BundlerError> {
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| BundlerError::Build(format!("no {} command configured", what)))?;
    let mut command = Command::new(program);
    command.args(args);
    Ok(command)
}

/// Bundler backed by external commands.
///
/// The build command receives `{"functions": [..], "isolatePort": ..}` as
/// JSON on stdin and prints `{"success", "functionConfigs", "graph"}` on
/// stdout. The optional isolate command is a server started once, before
/// the first build, and restarted when it has exited.
pub struct ProcessBundler {
    build: Vec<String>,
    isolate: Vec<String>,
    isolate_port: u16,
    project_dir: PathBuf,
    server: Mutex<Option<Child>>,
}

impl ProcessBundler {
    pub fn new(build: Vec<String>, project_dir: impl Into<PathBuf>) -> Self {
        Self {
            build,
            isolate: Vec::new(),
            isolate_port: 0,
            project_dir: project_dir.into(),
            server: Mutex::new(None),
        }
    }

    /// The bundler configured for `config`, if there is a build command.
    pub fn from_config(config: &DevConfig) -> Option<Self> {
        let edge = &config.edge_functions;
        if edge.bundler.is_empty() {
            return None;
        }
        Some(
            Self::new(edge.bundler.clone(), &config.project_dir)
                .with_isolate(edge.isolate.clone(), edge.isolate_port),
        )
    }

    pub fn with_isolate(mut self, command: Vec<String>, port: u16) -> Self {
        self.isolate = command;
        self.isolate_port = port;
        self
    }

    async fn ensure_isolate(&self, env: &HashMap<String, String>) -> Result<(), BundlerError> {
        if self.isolate.is_empty() {
            return Ok(());
        }
        let mut server = self.server.lock().await;
        if let Some(child) = server.as_mut() {
            match child.try_wait() {
                Ok(None) => return Ok(()),
                Ok(Some(status)) => warn!("Edge functions isolate exited with {}, restarting", status),
                Err(err) => warn!("Could not poll edge functions isolate: {}", err),
            }
        }

        let mut command = command(&self.isolate, "isolate")?;
        command
            .envs(env)
            .env("EDGEDEV_ISOLATE_PORT", self.isolate_port.to_string())
            .current_dir(&self.project_dir)
            .stdin(Stdio::null())
            .kill_on_drop(true);
        let child = command
            .spawn()
            .map_err(|err| BundlerError::Build(format!("could not start isolate: {}", err)))?;
        info!("Started edge functions isolate on port {}", self.isolate_port);
        *server = Some(child);
        Ok(())
    }
}

#[async_trait]
impl EdgeBundler for ProcessBundler {
    async fn find(&self, directories: &[PathBuf]) -> Result<Vec<EdgeFunction>, BundlerError> {
        find_entries(directories).await
    }

    async fn build(
        &self,
        functions: &[EdgeFunction],
        env: &HashMap<String, String>,
    ) -> Result<BuildOutput, BundlerError> {
        self.ensure_isolate(env).await?;

        let input = serde_json::to_vec(&BuildRequest {
            functions: functions
                .iter()
                .map(|f| BuildEntry {
                    name: &f.name,
                    path: &f.path,
                    tier: f.tier,
                })
                .collect(),
            isolate_port: self.isolate_port,
        })
        .map_err(|err| BundlerError::Build(err.to_string()))?;

        let mut command = command(&self.build, "bundler")?;
        command
            .envs(env)
            .current_dir(&self.project_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!("Building {} edge functions", functions.len());
        let mut child = command
            .spawn()
            .map_err(|err| BundlerError::Build(format!("could not start bundler: {}", err)))?;
        if let Some(mut stdin) = child.stdin.take() {
            if let Err(err) = stdin.write_all(&input).await {
                debug!("Could not write functions to bundler: {}", err);
            }
        }
        let output = child
            .wait_with_output()
            .await
            .map_err(|err| BundlerError::Build(err.to_string()))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let message = stderr
                .lines()
                .find(|line| !line.trim().is_empty())
                .map(str::to_string)
                .unwrap_or_else(|| format!("bundler exited with {}", output.status));
            return Err(BundlerError::Build(message));
        }

        let report: BuildReport = serde_json::from_slice(&output.stdout)
            .map_err(|err| BundlerError::Build(format!("invalid bundler output: {}", err)))?;
        Ok(BuildOutput {
            success: report.success,
            function_configs: report.function_configs,
            graph: report.graph,
        })
    }
}
