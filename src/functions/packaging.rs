//! Discovery of functions on disk and unpacking of zipped functions.

use crate::runtime::FunctionsSettings;
use crate::functions::runtime::ProcessRuntime;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Runtime name for JavaScript and TypeScript functions.
pub const JS_RUNTIME: &str = "js";

const JS_EXTENSIONS: &[&str] = &["js", "mjs", "cjs", "ts", "mts", "cts"];

/// Errors from listing or unpacking functions.
#[derive(Debug, thiserror::Error)]
pub enum PackagingError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid packaging manifest {path}: {source}")]
    Manifest {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to extract {path}: {source}")]
    Zip {
        path: PathBuf,
        #[source]
        source: zip::result::ZipError,
    },
    #[error("packaging task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// A function found on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FunctionDescriptor {
    pub name: String,
    pub main_file: PathBuf,
    /// Name of the runtime that builds and runs it.
    pub runtime: String,
    /// Extension of the main file, with the leading dot.
    pub extension: String,
    /// Set for functions living in their own directory.
    pub directory: Option<PathBuf>,
}

impl FunctionDescriptor {
    pub fn new(name: impl Into<String>, main_file: impl Into<PathBuf>, runtime: &str) -> Self {
        let main_file = main_file.into();
        let extension = main_file
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| format!(".{}", e))
            .unwrap_or_default();
        Self {
            name: name.into(),
            main_file,
            runtime: runtime.to_string(),
            extension,
            directory: None,
        }
    }

    pub fn is_zip(&self) -> bool {
        self.extension == ".zip"
    }
}

/// Lists the functions in a set of directories.
///
/// Directories come in precedence order: a function in a later directory
/// overrides one of the same name in an earlier directory.
#[async_trait]
pub trait FunctionLister: Send + Sync {
    async fn list_functions(
        &self,
        directories: &[PathBuf],
        config: &FunctionsSettings,
    ) -> Result<Vec<FunctionDescriptor>, PackagingError>;
}

/// Lister that inspects the top level of each directory.
///
/// Files with a JavaScript or TypeScript extension and `.zip` archives belong
/// to the `js` runtime, executables and `.sh` scripts to the process runtime.
/// A sub-directory is a function when it holds a `<name>` or `index` entry.
pub struct DirectoryLister;

fn extension_of(path: &Path) -> Option<&str> {
    path.extension().and_then(|e| e.to_str())
}

#[cfg(unix)]
fn is_executable(metadata: &std::fs::Metadata) -> bool {
    use std::os::unix::fs::PermissionsExt;
    metadata.is_file() && metadata.permissions().mode() & 0o111 != 0
}

#[cfg(not(unix))]
fn is_executable(_metadata: &std::fs::Metadata) -> bool {
    false
}

async fn runtime_for(path: &Path) -> Option<&'static str> {
    match extension_of(path) {
        Some(ext) if JS_EXTENSIONS.contains(&ext) || ext == "zip" => Some(JS_RUNTIME),
        Some("sh") => Some(ProcessRuntime::NAME),
        None => {
            let metadata = tokio::fs::metadata(path).await.ok()?;
            is_executable(&metadata).then_some(ProcessRuntime::NAME)
        }
        Some(_) => None,
    }
}

async fn directory_entry(dir: &Path, name: &str) -> Option<(PathBuf, &'static str)> {
    let mut candidates = Vec::new();
    for stem in [name, "index"] {
        for ext in JS_EXTENSIONS.iter().chain(["sh"].iter()) {
            candidates.push(dir.join(format!("{}.{}", stem, ext)));
        }
    }
    candidates.push(dir.join(name));

    for candidate in candidates {
        if !candidate.is_file() {
            continue;
        }
        if let Some(runtime) = runtime_for(&candidate).await {
            return Some((candidate, runtime));
        }
    }
    None
}

#[async_trait]
impl FunctionLister for DirectoryLister {
    async fn list_functions(
        &self,
        directories: &[PathBuf],
        _config: &FunctionsSettings,
    ) -> Result<Vec<FunctionDescriptor>, PackagingError> {
        let mut functions = Vec::new();
        for directory in directories {
            let mut entries = match tokio::fs::read_dir(directory).await {
                Ok(entries) => entries,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
                Err(source) => {
                    return Err(PackagingError::Io {
                        path: directory.clone(),
                        source,
                    })
                }
            };

            let mut found = Vec::new();
            loop {
                let entry = entries.next_entry().await.map_err(|source| PackagingError::Io {
                    path: directory.clone(),
                    source,
                })?;
                let Some(entry) = entry else { break };
                let path = entry.path();
                let Some(stem) = path.file_stem().and_then(|s| s.to_str()).map(str::to_string)
                else {
                    continue;
                };
                if stem.starts_with('.') {
                    continue;
                }

                if path.is_dir() {
                    if let Some((main_file, runtime)) = directory_entry(&path, &stem).await {
                        let mut descriptor = FunctionDescriptor::new(stem, main_file, runtime);
                        descriptor.directory = Some(path);
                        found.push(descriptor);
                    }
                } else if let Some(runtime) = runtime_for(&path).await {
                    found.push(FunctionDescriptor::new(stem, path, runtime));
                }
            }
            found.sort_by(|a, b| a.name.cmp(&b.name));
            debug!("Found {} functions in {}", found.len(), directory.display());
            functions.extend(found);
        }
        Ok(functions)
    }
}

/// Extract a zipped function into `target`, replacing earlier contents.
pub async fn unzip_function(archive: &Path, target: &Path) -> Result<(), PackagingError> {
    let archive = archive.to_path_buf();
    let target = target.to_path_buf();
    tokio::task::spawn_blocking(move || {
        let io_error = |source| PackagingError::Io {
            path: target.clone(),
            source,
        };
        if target.exists() {
            std::fs::remove_dir_all(&target).map_err(io_error)?;
        }
        std::fs::create_dir_all(&target).map_err(io_error)?;

        let file = std::fs::File::open(&archive).map_err(|source| PackagingError::Io {
            path: archive.clone(),
            source,
        })?;
        let zip_error = |source| PackagingError::Zip {
            path: archive.clone(),
            source,
        };
        let mut zip = zip::ZipArchive::new(file).map_err(zip_error)?;
        zip.extract(&target).map_err(zip_error)
    })
    .await?
}
