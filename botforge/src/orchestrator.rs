//! Lifecycle orchestrator: drives one session from intent to a running bot.
//!
//! All session mutation happens here, one step at a time. Collaborator
//! callbacks arrive through the inbox as [`Inbound`] events and are applied
//! by [`Orchestrator::handle`] in arrival order; events from a superseded
//! build connection or a stopped runtime are dropped on the way in.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use botforge_sdk::compiler::SpecCompiler;
use botforge_sdk::executor::BuildTransport;
use botforge_sdk::runtime::{RuntimeController, RuntimeInfo};
use botforge_sdk::verifier::CredentialVerifier;
use botforge_sdk::{LogEntry, LogKind};
use tokio::sync::mpsc;

use crate::build_client::{BuildExecutorClient, DEFAULT_WATCHDOG};
use crate::debug_loop::{Admission, DebugLoop, apply_patch};
use crate::error::LifecycleError;
use crate::event::{BuildEvent, BuildOutcome, Inbound, RuntimeEvent, SessionEvent};
use crate::logs::{LogAggregator, Phase};
use crate::runtime_session::{
    DEFAULT_RESTART_DELAY, DEFAULT_RUNTIME_DURATION, RuntimeSessionManager, RuntimeState,
    StartOutcome, StopOutcome,
};
use crate::session::{
    Access, BuildSession, BuildState, COMPOSE_FILE, CONTAINERFILE, DEPENDENCY_MANIFEST, FileView,
    README,
};

/// Bot framework used when the caller does not name one.
pub const DEFAULT_LIBRARY: &str = "aiogram";

/// The external services a session talks to.
#[derive(Clone)]
pub struct Collaborators {
    pub verifier: Arc<dyn CredentialVerifier>,
    pub compiler: Arc<dyn SpecCompiler>,
    pub executor: Arc<dyn BuildTransport>,
    pub runtime: Arc<dyn RuntimeController>,
}

/// Timing bounds. The build attempt bound is fixed at [`crate::debug_loop::MAX_BUILD_ATTEMPTS`].
#[derive(Debug, Clone, PartialEq)]
pub struct Limits {
    /// Longest a single build attempt may run.
    pub watchdog: Duration,
    /// How long a started bot keeps running.
    pub runtime_duration: Duration,
    /// Pause between stop and start on restart.
    pub restart_delay: Duration,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            watchdog: DEFAULT_WATCHDOG,
            runtime_duration: DEFAULT_RUNTIME_DURATION,
            restart_delay: DEFAULT_RESTART_DELAY,
        }
    }
}

/// User input that starts a session.
#[derive(Debug, Clone, Default)]
pub struct StartRequest {
    pub intent: String,
    pub credential: String,
    /// Bot framework; blank means [`DEFAULT_LIBRARY`].
    pub library: String,
}

pub struct Orchestrator {
    verifier: Arc<dyn CredentialVerifier>,
    compiler: Arc<dyn SpecCompiler>,
    session: BuildSession,
    logs: LogAggregator,
    builds: BuildExecutorClient,
    runtime: RuntimeSessionManager,
    debug: DebugLoop,
    inbox: mpsc::UnboundedReceiver<Inbound>,
    events: Option<mpsc::UnboundedSender<SessionEvent>>,
}

impl Orchestrator {
    pub fn new(collaborators: Collaborators, limits: Limits) -> Self {
        let (tx, inbox) = mpsc::unbounded_channel();
        Self {
            verifier: collaborators.verifier,
            compiler: collaborators.compiler,
            session: BuildSession::default(),
            logs: LogAggregator::new(),
            builds: BuildExecutorClient::new(collaborators.executor, tx.clone(), limits.watchdog),
            runtime: RuntimeSessionManager::new(
                collaborators.runtime,
                tx,
                limits.runtime_duration,
                limits.restart_delay,
            ),
            debug: DebugLoop,
            inbox,
            events: None,
        }
    }

    /// Receive every [`SessionEvent`] from now on. Replaces any earlier subscriber.
    pub fn subscribe(&mut self) -> mpsc::UnboundedReceiver<SessionEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.events = Some(tx);
        rx
    }

    pub fn session(&self) -> &BuildSession {
        &self.session
    }

    pub fn state(&self) -> BuildState {
        self.session.state()
    }

    pub fn logs(&self) -> &LogAggregator {
        &self.logs
    }

    pub fn runtime_state(&self) -> RuntimeState {
        self.runtime.state()
    }

    /// Seconds left before the running bot is stopped.
    pub fn countdown(&self) -> u64 {
        self.runtime.countdown()
    }

    /// Identity the runtime controller reported for the running bot.
    pub fn runtime_info(&self) -> Option<&RuntimeInfo> {
        self.runtime.info()
    }

    // ── Commands ────────────────────────────────────────────────────

    /// Verify the credential, ask which secrets are needed, then either wait
    /// for them or go straight on to generation and the first build.
    pub async fn start(&mut self, request: StartRequest) -> Result<(), LifecycleError> {
        if self.state() != BuildState::Idle {
            return Err(LifecycleError::validation(
                "a session is already in progress; reset it first",
            ));
        }
        let intent = request.intent.trim().to_string();
        let credential = request.credential.trim().to_string();
        if intent.is_empty() {
            return Err(LifecycleError::validation("describe the bot to build"));
        }
        if credential.is_empty() {
            return Err(LifecycleError::validation("a bot token is required"));
        }
        let library = match request.library.trim() {
            "" => DEFAULT_LIBRARY.to_string(),
            other => other.to_string(),
        };

        self.session.intent = intent.clone();
        self.session.credential = credential.clone();
        self.session.library = library;
        self.transition(BuildState::Validating)?;
        self.log(Phase::Build, LogEntry::new(LogKind::User, intent.clone()));

        let identity = match self.verifier.verify(&credential).await {
            Ok(identity) => identity,
            Err(e) => {
                let message = e.message();
                tracing::warn!(error = %e, "Credential rejected");
                self.log(Phase::Build, LogEntry::error(format!("Token check failed: {message}")));
                self.transition(BuildState::Idle)?;
                return Err(LifecycleError::Credential(message));
            }
        };
        self.log(
            Phase::Build,
            LogEntry::bot(format!("Authorized as {}", identity.display_name)),
        );
        self.session.identity = Some(identity);

        let secrets = match self.compiler.required_secrets(&intent).await {
            Ok(secrets) => secrets,
            Err(e) => {
                let message = e.message();
                self.log(Phase::Build, LogEntry::error(format!("Secret detection failed: {message}")));
                self.transition(BuildState::Idle)?;
                return Err(LifecycleError::Generation(message));
            }
        };
        let secrets: Vec<_> = secrets.into_iter().filter(|s| !s.key.trim().is_empty()).collect();

        if secrets.is_empty() {
            self.transition(BuildState::Planning)?;
            return self.generate().await;
        }
        let keys: Vec<&str> = secrets.iter().map(|s| s.key.as_str()).collect();
        self.log(
            Phase::Build,
            LogEntry::bot(format!("This bot needs: {}", keys.join(", "))),
        );
        self.session.required_secrets = secrets;
        self.transition(BuildState::GatheringConfig)
    }

    /// Provide values for the secrets asked for in `GATHERING_CONFIG`.
    /// Unrequested keys are ignored. Proceeds only once every key has a value.
    pub async fn submit_secrets(
        &mut self,
        values: BTreeMap<String, String>,
    ) -> Result<(), LifecycleError> {
        if self.state() != BuildState::GatheringConfig {
            return Err(LifecycleError::validation("no secrets are being requested"));
        }
        let wanted = self.session.secret_keys();
        for (key, value) in values {
            if wanted.contains(&key) {
                self.session.secrets.insert(key, value.trim().to_string());
            }
        }
        let missing = self.session.missing_secrets();
        if !missing.is_empty() {
            return Err(LifecycleError::validation(format!(
                "missing values for: {}",
                missing.join(", ")
            )));
        }
        self.transition(BuildState::Planning)?;
        self.generate().await
    }

    /// Borrow a generated file. Editing is only offered once a build has finished.
    pub fn open_file(&mut self, name: &str, access: Access) -> Result<FileView<'_>, LifecycleError> {
        if access == Access::Editable
            && !matches!(self.state(), BuildState::Success | BuildState::Error)
        {
            return Err(LifecycleError::validation(
                "files can be edited once a build has finished",
            ));
        }
        self.session
            .view(name, access)
            .ok_or_else(|| LifecycleError::validation(format!("no file named {name}")))
    }

    /// Build the current files again. Allowed after a success with unbuilt
    /// edits, or after an error when there is something to build. Each
    /// rebuild starts with a fresh attempt count.
    pub async fn rebuild(&mut self) -> Result<(), LifecycleError> {
        match self.state() {
            BuildState::Success if self.session.has_unrebuilt_changes => {}
            BuildState::Error if !self.session.files.is_empty() => {}
            BuildState::Success => {
                return Err(LifecycleError::validation("no changes since the last build"));
            }
            BuildState::Error => return Err(LifecycleError::validation("nothing to rebuild")),
            _ => {
                return Err(LifecycleError::validation(
                    "rebuild is available once a build has finished",
                ));
            }
        }
        self.halt_runtime("rebuilding").await;
        self.runtime.reset_countdown();
        self.logs.clear_build();
        self.session.has_unrebuilt_changes = false;
        self.session.image = None;
        self.session.attempt = 0;
        self.log(Phase::Build, LogEntry::bot("Rebuilding with the current files"));
        self.enter_building()
    }

    pub async fn start_runtime(&mut self) -> Result<(), LifecycleError> {
        if self.state() != BuildState::Success {
            return Err(LifecycleError::validation("the bot can run after a successful build"));
        }
        let Some(image) = self.session.image.clone() else {
            return Err(LifecycleError::validation("nothing has been built yet"));
        };
        match self.runtime.start(&image).await {
            Ok(StartOutcome::AlreadyRunning) => Ok(()),
            Ok(StartOutcome::Started) => {
                self.logs.clear_runtime();
                self.emit(SessionEvent::RuntimeChanged {
                    from: RuntimeState::Stopped,
                    to: RuntimeState::Running,
                });
                let secs = self.runtime.countdown();
                self.log(
                    Phase::Runtime,
                    LogEntry::bot(format!("Bot started, stopping in {secs}s")),
                );
                Ok(())
            }
            Err(e) => {
                let message = match &e {
                    LifecycleError::RuntimeStart(m) => m.clone(),
                    other => other.to_string(),
                };
                self.log(Phase::Runtime, LogEntry::error(e.to_string()));
                self.emit(SessionEvent::RuntimeStartFailed { message });
                Err(e)
            }
        }
    }

    pub async fn stop_runtime(&mut self) {
        self.halt_runtime("stopped by user").await;
    }

    /// Stop, wait the restart delay, then start again.
    pub async fn restart_runtime(&mut self) -> Result<(), LifecycleError> {
        if self.state() != BuildState::Success {
            return Err(LifecycleError::validation("the bot can run after a successful build"));
        }
        self.halt_runtime("restarting").await;
        tokio::time::sleep(self.runtime.restart_delay()).await;
        self.start_runtime().await
    }

    /// Tear everything down and return to `IDLE`. Connections and timers are
    /// closed before any session data is cleared.
    pub async fn reset(&mut self) {
        self.builds.supersede();
        self.halt_runtime("session reset").await;
        while self.inbox.try_recv().is_ok() {}

        self.logs.clear_all();
        if self.state() != BuildState::Idle {
            let from = self.state();
            self.session.state = BuildState::Idle;
            tracing::info!(from = %from, "Session reset");
            self.emit(SessionEvent::StateChanged {
                from,
                to: BuildState::Idle,
            });
        }
        self.session = BuildSession::default();
        self.runtime.reset_countdown();
    }

    // ── Inbox ───────────────────────────────────────────────────────

    /// Wait for the next collaborator callback.
    pub async fn next_inbound(&mut self) -> Option<Inbound> {
        self.inbox.recv().await
    }

    /// Apply one collaborator callback.
    pub async fn handle(&mut self, inbound: Inbound) -> Result<(), LifecycleError> {
        match inbound {
            Inbound::Build { epoch, event } => {
                let Some(event) = self.builds.accept(epoch, event) else {
                    return Ok(());
                };
                match event {
                    BuildEvent::Log(line) => {
                        let entry = if line.to_ascii_lowercase().contains("error") {
                            LogEntry::error(line)
                        } else {
                            LogEntry::raw(line)
                        };
                        self.log(Phase::Build, entry);
                        Ok(())
                    }
                    BuildEvent::Finished(BuildOutcome::Succeeded { image }) => {
                        self.on_build_succeeded(image).await
                    }
                    BuildEvent::Finished(BuildOutcome::Failed { message }) => {
                        self.on_build_failed(message).await
                    }
                }
            }
            Inbound::Runtime { generation, event } => {
                if !self.runtime.is_current(generation) {
                    tracing::trace!(generation, "Dropping stale runtime event");
                    return Ok(());
                }
                match event {
                    RuntimeEvent::Log(entry) => {
                        self.log(Phase::Runtime, entry);
                        Ok(())
                    }
                    RuntimeEvent::Tick => {
                        if self.runtime.tick() {
                            self.halt_runtime("time limit reached").await;
                        }
                        Ok(())
                    }
                    RuntimeEvent::Disconnected { reason } => {
                        tracing::warn!(%reason, "Runtime log stream disconnected");
                        self.log(
                            Phase::Runtime,
                            LogEntry::error(format!("Log stream disconnected: {reason}")),
                        );
                        self.halt_runtime("log stream disconnected").await;
                        Err(LifecycleError::StreamDisconnect(reason))
                    }
                }
            }
        }
    }

    /// Process callbacks until the build pipeline settles. Returns the
    /// settled state, or the error that ended the pipeline.
    pub async fn drive_build(&mut self) -> Result<BuildState, LifecycleError> {
        while matches!(self.state(), BuildState::Building | BuildState::Debugging) {
            let Some(inbound) = self.next_inbound().await else {
                break;
            };
            self.handle(inbound).await?;
        }
        Ok(self.state())
    }

    // ── Internals ───────────────────────────────────────────────────

    fn transition(&mut self, to: BuildState) -> Result<(), LifecycleError> {
        let from = self.state();
        if !from.can_transition_to(to) {
            return Err(LifecycleError::InvalidTransition { from, to });
        }
        self.session.state = to;
        tracing::info!(from = %from, to = %to, "Session state changed");
        self.emit(SessionEvent::StateChanged { from, to });
        Ok(())
    }

    fn emit(&self, event: SessionEvent) {
        if let Some(tx) = &self.events {
            let _ = tx.send(event);
        }
    }

    fn log(&mut self, phase: Phase, entry: LogEntry) {
        self.logs.push(phase, entry.clone());
        self.emit(SessionEvent::Log { phase, entry });
    }

    /// Planning and coding, ending in the first build.
    async fn generate(&mut self) -> Result<(), LifecycleError> {
        let intent = self.session.intent.clone();
        let library = self.session.library.clone();
        let keys = self.session.secret_keys();

        self.log(Phase::Build, LogEntry::bot("Planning project files"));
        let plan = match self.compiler.plan(&intent, &library).await {
            Ok(plan) if plan.files.is_empty() => {
                return self.fail_generation("planning", "the plan lists no files".into());
            }
            Ok(plan) => plan,
            Err(e) => return self.fail_generation("planning", e.message()),
        };
        self.log(
            Phase::Build,
            LogEntry::bot(format!(
                "Plan ready: {} file(s), complexity {}",
                plan.files.len(),
                if plan.complexity.is_empty() { "unknown" } else { plan.complexity.as_str() }
            )),
        );
        self.session.plan = Some(plan.clone());
        self.transition(BuildState::Coding)?;

        for file in &plan.files {
            let content = match self.compiler.content(&intent, &plan, file, &keys).await {
                Ok(content) => content,
                Err(e) if !file.required => {
                    tracing::warn!(file = %file.name, error = %e, "Skipping optional file");
                    self.log(
                        Phase::Build,
                        LogEntry::error(format!("Skipped optional {}: {}", file.name, e.message())),
                    );
                    continue;
                }
                Err(e) => return self.fail_generation(&format!("writing {}", file.name), e.message()),
            };
            let name = match content.file_name.trim() {
                "" => file.name.clone(),
                given => given.to_string(),
            };
            self.session.files.upsert(&name, content.code);
            self.log(Phase::Build, LogEntry::bot(format!("Wrote {name}")));
        }

        let setup = match self.compiler.setup_files(&intent, &plan, &library, &keys).await {
            Ok(setup) => setup,
            Err(e) => return self.fail_generation("setup files", e.message()),
        };
        for (name, code) in [
            (DEPENDENCY_MANIFEST, setup.dependency_manifest),
            (CONTAINERFILE, setup.containerfile),
            (COMPOSE_FILE, setup.compose_file),
            (README, setup.readme),
        ] {
            self.session.files.upsert(name, code);
        }
        self.log(
            Phase::Build,
            LogEntry::bot(format!("Generated {} files", self.session.files.len())),
        );
        self.enter_building()
    }

    fn fail_generation(&mut self, stage: &str, message: String) -> Result<(), LifecycleError> {
        let message = format!("{stage} failed: {message}");
        tracing::warn!(%message, "Generation failed");
        self.session.last_error = Some(message.clone());
        self.log(Phase::Build, LogEntry::error(message.clone()));
        self.transition(BuildState::Error)?;
        Err(LifecycleError::Generation(message))
    }

    fn enter_building(&mut self) -> Result<(), LifecycleError> {
        self.transition(BuildState::Building)?;
        self.logs.mark_build_boundary();
        let attempt = self.session.attempt + 1;
        self.log(Phase::Build, LogEntry::bot(format!("Build attempt {attempt} started")));
        self.builds.open(self.session.build_request());
        Ok(())
    }

    async fn on_build_succeeded(&mut self, image: String) -> Result<(), LifecycleError> {
        self.log(Phase::Build, LogEntry::bot(format!("Build succeeded: {image}")));
        self.session.image = Some(image);
        self.session.last_error = None;
        self.transition(BuildState::Success)?;
        if let Err(e) = self.start_runtime().await {
            tracing::warn!(error = %e, "Bot built but did not start");
        }
        Ok(())
    }

    async fn on_build_failed(&mut self, message: String) -> Result<(), LifecycleError> {
        self.session.last_error = Some(message.clone());
        self.log(Phase::Build, LogEntry::error(message.clone()));

        let attempt = match self.debug.admit(&mut self.session.attempt) {
            Admission::Repair { attempt } => attempt,
            Admission::Exhausted { attempt } => {
                tracing::warn!(attempt, "Build attempts exhausted");
                self.log(
                    Phase::Build,
                    LogEntry::error(format!("Giving up after {attempt} failed builds")),
                );
                self.transition(BuildState::Error)?;
                return Err(LifecycleError::Build(message));
            }
        };

        self.transition(BuildState::Debugging)?;
        self.log(
            Phase::Build,
            LogEntry::bot(format!("Build failed, requesting a fix (repair {attempt})")),
        );
        let patch = match self.debug.repair(self.compiler.as_ref(), &self.session).await {
            Ok(patch) => patch,
            Err(e) => {
                tracing::warn!(error = %e, "Repair failed");
                self.session.last_error = Some(e.to_string());
                self.log(Phase::Build, LogEntry::error(e.to_string()));
                self.transition(BuildState::Error)?;
                return Err(e);
            }
        };

        let report = apply_patch(&mut self.session.files, &patch);
        let summaries: Vec<String> = patch
            .patched_files
            .iter()
            .map(|f| match f.summary.trim() {
                "" => format!("{}: updated", f.name),
                s => format!("{}: {s}", f.name),
            })
            .collect();
        tracing::info!(
            attempt,
            confidence = report.confidence,
            replaced = report.replaced.len(),
            appended = report.appended.len(),
            "Repair applied"
        );
        self.log(
            Phase::Build,
            LogEntry::bot(format!(
                "Applied fix to {} file(s), confidence {:.0}%",
                summaries.len(),
                report.confidence * 100.0
            )),
        );
        if !report.dependencies_added.is_empty() {
            self.log(
                Phase::Build,
                LogEntry::bot(format!("Added dependencies: {}", report.dependencies_added.join(", "))),
            );
        }
        self.emit(SessionEvent::RepairApplied {
            attempt,
            confidence: report.confidence,
            summaries,
        });
        self.enter_building()
    }

    async fn halt_runtime(&mut self, reason: &str) {
        match self.runtime.stop().await {
            StopOutcome::AlreadyStopped => {}
            StopOutcome::Stopped { warning } => {
                self.emit(SessionEvent::RuntimeChanged {
                    from: RuntimeState::Running,
                    to: RuntimeState::Stopped,
                });
                self.log(Phase::Runtime, LogEntry::bot(format!("Bot stopped: {reason}")));
                if let Some(warning) = warning {
                    self.log(
                        Phase::Runtime,
                        LogEntry::error(format!("Stop request failed: {warning}")),
                    );
                }
            }
        }
    }
}
