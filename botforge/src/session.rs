//! Session store: everything one build-through-run attempt knows.
//!
//! The orchestrator is the only writer, apart from explicit user edits made
//! through a [`FileEditor`].

use std::collections::BTreeMap;
use std::fmt::Write as _;

use botforge_sdk::compiler::{FilePlan, SecretSpec};
use botforge_sdk::executor::{BuildRequest, SourceFile};
use botforge_sdk::verifier::BotIdentity;
use serde::{Deserialize, Serialize};

/// Name of the dependency manifest produced by setup generation.
pub const DEPENDENCY_MANIFEST: &str = "requirements.txt";
pub const CONTAINERFILE: &str = "Dockerfile";
pub const COMPOSE_FILE: &str = "docker-compose.yml";
pub const README: &str = "README.md";
/// Environment file assembled for every build request. Never stored in the session.
pub const ENV_FILE: &str = ".env";

/// Lifecycle stage of a build session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BuildState {
    Idle,
    Validating,
    GatheringConfig,
    Planning,
    Coding,
    Building,
    Debugging,
    /// Build-phase "executing an attempt" marker. No edge of the transition
    /// table enters it; build attempts are tracked as `Building`.
    Running,
    Success,
    Error,
}

impl std::fmt::Display for BuildState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            BuildState::Idle => "IDLE",
            BuildState::Validating => "VALIDATING",
            BuildState::GatheringConfig => "GATHERING_CONFIG",
            BuildState::Planning => "PLANNING",
            BuildState::Coding => "CODING",
            BuildState::Building => "BUILDING",
            BuildState::Debugging => "DEBUGGING",
            BuildState::Running => "RUNNING",
            BuildState::Success => "SUCCESS",
            BuildState::Error => "ERROR",
        };
        f.write_str(name)
    }
}

impl BuildState {
    /// Whether `self -> to` is an edge of the lifecycle table. Reset (any
    /// non-idle state back to `Idle`) is always allowed.
    pub fn can_transition_to(self, to: BuildState) -> bool {
        use BuildState as S;
        if to == S::Idle {
            return self != S::Idle;
        }
        matches!(
            (self, to),
            (S::Idle, S::Validating)
                | (S::Validating, S::GatheringConfig)
                | (S::Validating, S::Planning)
                | (S::GatheringConfig, S::Planning)
                | (S::Planning, S::Coding)
                | (S::Planning, S::Error)
                | (S::Coding, S::Building)
                | (S::Coding, S::Error)
                | (S::Building, S::Success)
                | (S::Building, S::Debugging)
                | (S::Building, S::Error)
                | (S::Debugging, S::Building)
                | (S::Debugging, S::Error)
                | (S::Success, S::Building)
                | (S::Error, S::Building)
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GeneratedFile {
    pub name: String,
    pub code: String,
}

/// Ordered file set with unique names. Order is insertion order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileSet {
    files: Vec<GeneratedFile>,
}

/// What [`FileSet::upsert`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Upsert {
    Replaced,
    Appended,
}

impl FileSet {
    /// Replace the content of `name` in place, or append it at the end.
    pub fn upsert(&mut self, name: &str, code: impl Into<String>) -> Upsert {
        let code = code.into();
        match self.get_mut(name) {
            Some(existing) => {
                existing.code = code;
                Upsert::Replaced
            }
            None => {
                self.files.push(GeneratedFile {
                    name: name.to_string(),
                    code,
                });
                Upsert::Appended
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<&GeneratedFile> {
        self.files.iter().find(|f| f.name == name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut GeneratedFile> {
        self.files.iter_mut().find(|f| f.name == name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &GeneratedFile> {
        self.files.iter()
    }

    pub fn names(&self) -> Vec<&str> {
        self.files.iter().map(|f| f.name.as_str()).collect()
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    pub fn clear(&mut self) {
        self.files.clear();
    }

    pub fn to_sources(&self) -> Vec<SourceFile> {
        self.files
            .iter()
            .map(|f| SourceFile {
                name: f.name.clone(),
                code: f.code.clone(),
            })
            .collect()
    }
}

/// Caller-selected capability for [`BuildSession::view`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    ReadOnly,
    Editable,
}

pub enum FileView<'a> {
    ReadOnly(&'a GeneratedFile),
    Editable(FileEditor<'a>),
}

impl FileView<'_> {
    pub fn file(&self) -> &GeneratedFile {
        match self {
            FileView::ReadOnly(file) => file,
            FileView::Editable(editor) => editor.file(),
        }
    }
}

/// Write access to one file. Saving different content marks the session as
/// having changes that have not been rebuilt.
pub struct FileEditor<'a> {
    file: &'a mut GeneratedFile,
    dirty: &'a mut bool,
}

impl FileEditor<'_> {
    pub fn file(&self) -> &GeneratedFile {
        self.file
    }

    /// Overwrite the file. Returns whether anything changed.
    pub fn save(self, code: impl Into<String>) -> bool {
        let code = code.into();
        if self.file.code == code {
            return false;
        }
        self.file.code = code;
        *self.dirty = true;
        true
    }
}

/// Mutable state of one session.
#[derive(Debug, Clone)]
pub struct BuildSession {
    pub(crate) intent: String,
    pub(crate) credential: String,
    pub(crate) library: String,
    pub(crate) identity: Option<BotIdentity>,
    pub(crate) required_secrets: Vec<SecretSpec>,
    pub(crate) secrets: BTreeMap<String, String>,
    pub(crate) plan: Option<FilePlan>,
    pub(crate) files: FileSet,
    pub(crate) state: BuildState,
    pub(crate) attempt: u32,
    pub(crate) last_error: Option<String>,
    pub(crate) has_unrebuilt_changes: bool,
    pub(crate) image: Option<String>,
}

impl Default for BuildSession {
    fn default() -> Self {
        Self {
            intent: String::new(),
            credential: String::new(),
            library: String::new(),
            identity: None,
            required_secrets: Vec::new(),
            secrets: BTreeMap::new(),
            plan: None,
            files: FileSet::default(),
            state: BuildState::Idle,
            attempt: 0,
            last_error: None,
            has_unrebuilt_changes: false,
            image: None,
        }
    }
}

impl BuildSession {
    pub fn intent(&self) -> &str {
        &self.intent
    }

    pub fn library(&self) -> &str {
        &self.library
    }

    pub fn identity(&self) -> Option<&BotIdentity> {
        self.identity.as_ref()
    }

    pub fn required_secrets(&self) -> &[SecretSpec] {
        &self.required_secrets
    }

    pub fn secrets(&self) -> &BTreeMap<String, String> {
        &self.secrets
    }

    pub fn plan(&self) -> Option<&FilePlan> {
        self.plan.as_ref()
    }

    pub fn files(&self) -> &FileSet {
        &self.files
    }

    pub fn state(&self) -> BuildState {
        self.state
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    pub fn has_unrebuilt_changes(&self) -> bool {
        self.has_unrebuilt_changes
    }

    /// Image produced by the last successful build.
    pub fn image(&self) -> Option<&str> {
        self.image.as_deref()
    }

    pub fn secret_keys(&self) -> Vec<String> {
        self.required_secrets.iter().map(|s| s.key.clone()).collect()
    }

    /// Borrow one file with the capability the caller asks for.
    pub fn view(&mut self, name: &str, access: Access) -> Option<FileView<'_>> {
        match access {
            Access::ReadOnly => self.files.get(name).map(FileView::ReadOnly),
            Access::Editable => {
                let dirty = &mut self.has_unrebuilt_changes;
                self.files
                    .get_mut(name)
                    .map(|file| FileView::Editable(FileEditor { file, dirty }))
            }
        }
    }

    /// Required keys that have no non-blank value yet.
    pub fn missing_secrets(&self) -> Vec<String> {
        self.required_secrets
            .iter()
            .filter(|s| {
                self.secrets
                    .get(&s.key)
                    .is_none_or(|v| v.trim().is_empty())
            })
            .map(|s| s.key.clone())
            .collect()
    }

    /// The request for one build attempt: the file set plus a freshly
    /// assembled `.env`, authenticated with the bot credential.
    pub fn build_request(&self) -> BuildRequest {
        let mut files: Vec<SourceFile> = self
            .files
            .to_sources()
            .into_iter()
            .filter(|f| f.name != ENV_FILE)
            .collect();
        files.push(SourceFile {
            name: ENV_FILE.to_string(),
            code: self.env_file(),
        });
        BuildRequest {
            files,
            token: self.credential.clone(),
        }
    }

    fn env_file(&self) -> String {
        let mut out = format!("BOT_TOKEN={}\n", self.credential);
        for (key, value) in &self.secrets {
            let _ = writeln!(out, "{key}={value}");
        }
        out
    }
}
