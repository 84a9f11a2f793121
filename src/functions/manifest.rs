//! Packaging manifest written next to zipped functions.
//!
//! The manifest lists every packaged function together with the build data
//! the packager computed, so archives can be served without rebuilding them.

use crate::functions::packaging::PackagingError;
use crate::functions::route::FunctionRoute;
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Contents of a `manifest.json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct PackagingManifest {
    #[serde(default)]
    pub functions: Vec<ManifestFunction>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<u32>,
}

/// One packaged function.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ManifestFunction {
    pub name: String,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub runtime: String,
    #[serde(default)]
    pub build_data: ManifestBuildData,
    #[serde(default)]
    pub routes: Vec<FunctionRoute>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schedule: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ManifestBuildData {
    #[serde(rename = "runtimeAPIVersion", default = "default_api_version")]
    pub runtime_api_version: u8,
}

fn default_api_version() -> u8 {
    1
}

impl Default for ManifestBuildData {
    fn default() -> Self {
        Self {
            runtime_api_version: default_api_version(),
        }
    }
}

impl PackagingManifest {
    /// Read a manifest from disk.
    pub async fn load(path: &Path) -> Result<Self, PackagingError> {
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|source| PackagingError::Io {
                path: path.to_path_buf(),
                source,
            })?;
        serde_json::from_slice(&bytes).map_err(|source| PackagingError::Manifest {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Entry for the named function.
    pub fn function(&self, name: &str) -> Option<&ManifestFunction> {
        self.functions.iter().find(|f| f.name == name)
    }
}
