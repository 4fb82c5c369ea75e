//! Specification compiler contract.
//!
//! Turns free-text intent into a file plan, per-file content and setup files,
//! and later turns a build error into a patch. Field names on the wire are
//! camelCase.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::ClientResult;
use crate::executor::SourceFile;

/// A secret the generated bot needs at runtime (API keys and the like).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretSpec {
    pub key: String,
    #[serde(default)]
    pub description: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlannedFile {
    pub name: String,
    #[serde(default)]
    pub purpose: String,
    #[serde(default = "default_required")]
    pub required: bool,
}

fn default_required() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FilePlan {
    pub files: Vec<PlannedFile>,
    #[serde(default)]
    pub dependencies: Vec<String>,
    #[serde(default)]
    pub run_command: String,
    #[serde(default)]
    pub complexity: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileContent {
    pub file_name: String,
    pub code: String,
    #[serde(default)]
    pub notes: String,
}

/// Packaging files produced once all source files exist.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetupFiles {
    pub dependency_manifest: String,
    pub containerfile: String,
    pub compose_file: String,
    pub readme: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchedFile {
    pub name: String,
    pub code: String,
    #[serde(default)]
    pub summary: String,
}

/// Answer to a repair request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RepairPatch {
    #[serde(default)]
    pub patched_files: Vec<PatchedFile>,
    #[serde(default)]
    pub updated_dependencies: Option<Vec<String>>,
    #[serde(default)]
    pub confidence: f64,
}

#[async_trait]
pub trait SpecCompiler: Send + Sync {
    /// Secrets the bot described by `intent` will need.
    async fn required_secrets(&self, intent: &str) -> ClientResult<Vec<SecretSpec>>;

    async fn plan(&self, intent: &str, library: &str) -> ClientResult<FilePlan>;

    async fn content(
        &self,
        intent: &str,
        plan: &FilePlan,
        file: &PlannedFile,
        secret_keys: &[String],
    ) -> ClientResult<FileContent>;

    async fn setup_files(
        &self,
        intent: &str,
        plan: &FilePlan,
        library: &str,
        secret_keys: &[String],
    ) -> ClientResult<SetupFiles>;

    /// Patch `files` so the build error in `error_transcript` goes away.
    async fn repair(
        &self,
        intent: &str,
        files: &[SourceFile],
        error_transcript: &str,
        library: &str,
    ) -> ClientResult<RepairPatch>;
}
