//! Bounded repair loop: decides whether a failed build gets another try and
//! merges the repair service's patch into the file set.

use botforge_sdk::compiler::{RepairPatch, SpecCompiler};

use crate::error::LifecycleError;
use crate::session::{BuildSession, DEPENDENCY_MANIFEST, FileSet, Upsert};

/// Builds allowed per session before the loop gives up.
pub const MAX_BUILD_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Repair { attempt: u32 },
    Exhausted { attempt: u32 },
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DebugLoop;

impl DebugLoop {
    /// Count a failed build. The counter moves before the bound is checked,
    /// so [`MAX_BUILD_ATTEMPTS`] allows three builds and two repairs.
    pub fn admit(&self, attempt: &mut u32) -> Admission {
        *attempt += 1;
        if *attempt >= MAX_BUILD_ATTEMPTS {
            Admission::Exhausted { attempt: *attempt }
        } else {
            Admission::Repair { attempt: *attempt }
        }
    }

    /// Ask the compiler for a patch against the session's last build error.
    pub async fn repair(
        &self,
        compiler: &dyn SpecCompiler,
        session: &BuildSession,
    ) -> Result<RepairPatch, LifecycleError> {
        let files = session.files().to_sources();
        let transcript = session.last_error().unwrap_or_default();
        let patch = compiler
            .repair(session.intent(), &files, transcript, session.library())
            .await
            .map_err(|e| LifecycleError::DebugService(e.message()))?;
        if patch.patched_files.is_empty() {
            return Err(LifecycleError::DebugService(
                "repair returned no patched files".into(),
            ));
        }
        Ok(patch)
    }
}

/// What [`apply_patch`] changed.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct MergeReport {
    pub replaced: Vec<String>,
    pub appended: Vec<String>,
    pub dependencies_added: Vec<String>,
    /// Reported confidence, clamped to `0.0..=1.0`.
    pub confidence: f64,
}

/// Merge `patch` into `files`: patched names replace in place, unknown names
/// are appended, and dependency updates are unioned into the manifest when
/// one exists.
pub fn apply_patch(files: &mut FileSet, patch: &RepairPatch) -> MergeReport {
    let mut report = MergeReport {
        confidence: clamp_confidence(patch.confidence),
        ..MergeReport::default()
    };
    for patched in &patch.patched_files {
        match files.upsert(&patched.name, patched.code.clone()) {
            Upsert::Replaced => report.replaced.push(patched.name.clone()),
            Upsert::Appended => report.appended.push(patched.name.clone()),
        }
    }
    if let Some(updates) = &patch.updated_dependencies {
        if let Some(manifest) = files.get_mut(DEPENDENCY_MANIFEST) {
            let (merged, added) = union_dependencies(&manifest.code, updates);
            manifest.code = merged;
            report.dependencies_added = added;
        }
    }
    report
}

/// Union of the manifest's requirement lines and `updates`. Existing lines
/// keep their order; new entries follow in the order given.
pub fn union_dependencies(manifest: &str, updates: &[String]) -> (String, Vec<String>) {
    let mut lines: Vec<String> = Vec::new();
    for line in manifest.lines().map(str::trim).filter(|l| !l.is_empty()) {
        if !lines.iter().any(|l| l == line) {
            lines.push(line.to_string());
        }
    }
    let mut added = Vec::new();
    for dep in updates.iter().map(|d| d.trim()).filter(|d| !d.is_empty()) {
        if !lines.iter().any(|l| l == dep) {
            lines.push(dep.to_string());
            added.push(dep.to_string());
        }
    }
    let mut merged = lines.join("\n");
    merged.push('\n');
    (merged, added)
}

fn clamp_confidence(c: f64) -> f64 {
    if c.is_finite() { c.clamp(0.0, 1.0) } else { 0.0 }
}
