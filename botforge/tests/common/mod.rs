//! In-memory collaborators for lifecycle tests.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use botforge::event::SessionEvent;
use botforge::{Collaborators, Limits, Orchestrator};
use botforge_sdk::compiler::{
    FileContent, FilePlan, PatchedFile, PlannedFile, RepairPatch, SecretSpec, SetupFiles,
    SpecCompiler,
};
use botforge_sdk::executor::{BuildConnection, BuildRequest, BuildTransport, SourceFile};
use botforge_sdk::runtime::{LogStream, RuntimeController, RuntimeInfo};
use botforge_sdk::verifier::{BotIdentity, CredentialVerifier};
use botforge_sdk::{ClientError, ClientResult, ExecutorEvent, LogEntry};
use tokio::sync::mpsc;

// ── Verifier ──

#[derive(Default)]
pub struct FakeVerifier {
    pub reject: Option<String>,
}

#[async_trait]
impl CredentialVerifier for FakeVerifier {
    async fn verify(&self, _credential: &str) -> ClientResult<BotIdentity> {
        match &self.reject {
            Some(msg) => Err(ClientError::Rejected(msg.clone())),
            None => Ok(BotIdentity {
                id: 42,
                display_name: "@weather_bot".into(),
            }),
        }
    }
}

// ── Compiler ──

pub struct FakeCompiler {
    pub secrets: Vec<SecretSpec>,
    pub fail_plan: bool,
    pub repairs: Mutex<VecDeque<ClientResult<RepairPatch>>>,
    pub secret_calls: AtomicUsize,
    pub repair_calls: AtomicUsize,
}

impl Default for FakeCompiler {
    fn default() -> Self {
        Self {
            secrets: Vec::new(),
            fail_plan: false,
            repairs: Mutex::new(VecDeque::new()),
            secret_calls: AtomicUsize::new(0),
            repair_calls: AtomicUsize::new(0),
        }
    }
}

impl FakeCompiler {
    pub fn with_repairs(repairs: Vec<ClientResult<RepairPatch>>) -> Self {
        Self {
            repairs: Mutex::new(repairs.into()),
            ..Self::default()
        }
    }

    /// Queue more repair answers after construction.
    pub fn push_repairs(&self, repairs: Vec<ClientResult<RepairPatch>>) {
        self.repairs.lock().unwrap().extend(repairs);
    }

    pub fn repair_calls(&self) -> usize {
        self.repair_calls.load(Ordering::SeqCst)
    }
}

pub fn patch(name: &str, code: &str, confidence: f64) -> ClientResult<RepairPatch> {
    Ok(RepairPatch {
        patched_files: vec![PatchedFile {
            name: name.into(),
            code: code.into(),
            summary: "fix import".into(),
        }],
        updated_dependencies: Some(vec!["aiohttp".into()]),
        confidence,
    })
}

/// A repair answer that patches nothing.
pub fn empty_patch() -> ClientResult<RepairPatch> {
    Ok(RepairPatch {
        patched_files: Vec::new(),
        updated_dependencies: None,
        confidence: 0.8,
    })
}

#[async_trait]
impl SpecCompiler for FakeCompiler {
    async fn required_secrets(&self, _intent: &str) -> ClientResult<Vec<SecretSpec>> {
        self.secret_calls.fetch_add(1, Ordering::SeqCst);
        Ok(self.secrets.clone())
    }

    async fn plan(&self, _intent: &str, _library: &str) -> ClientResult<FilePlan> {
        if self.fail_plan {
            return Err(ClientError::Transport("compiler offline".into()));
        }
        Ok(FilePlan {
            files: vec![
                PlannedFile {
                    name: "main.py".into(),
                    purpose: "entry point".into(),
                    required: true,
                },
                PlannedFile {
                    name: "handlers.py".into(),
                    purpose: "commands".into(),
                    required: true,
                },
            ],
            dependencies: vec!["aiogram==3.1".into()],
            run_command: "python main.py".into(),
            complexity: "low".into(),
        })
    }

    async fn content(
        &self,
        _intent: &str,
        _plan: &FilePlan,
        file: &PlannedFile,
        _secret_keys: &[String],
    ) -> ClientResult<FileContent> {
        Ok(FileContent {
            file_name: file.name.clone(),
            code: format!("# {}\n", file.name),
            notes: String::new(),
        })
    }

    async fn setup_files(
        &self,
        _intent: &str,
        _plan: &FilePlan,
        _library: &str,
        _secret_keys: &[String],
    ) -> ClientResult<SetupFiles> {
        Ok(SetupFiles {
            dependency_manifest: "aiogram==3.1\n".into(),
            containerfile: "FROM python:3.12-slim\n".into(),
            compose_file: "services: {}\n".into(),
            readme: "# bot\n".into(),
        })
    }

    async fn repair(
        &self,
        _intent: &str,
        _files: &[SourceFile],
        _error_transcript: &str,
        _library: &str,
    ) -> ClientResult<RepairPatch> {
        self.repair_calls.fetch_add(1, Ordering::SeqCst);
        self.repairs
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(ClientError::Transport("no repair scripted".into())))
    }
}

// ── Build executor ──

/// Events one connection delivers; after the last one it stays silent.
pub type Script = Vec<ExecutorEvent>;

#[derive(Default)]
pub struct FakeExecutor {
    scripts: Mutex<VecDeque<Script>>,
    pub requests: Mutex<Vec<BuildRequest>>,
    pub closes: Arc<Mutex<Vec<u16>>>,
}

impl FakeExecutor {
    pub fn scripted(scripts: Vec<Script>) -> Self {
        Self {
            scripts: Mutex::new(scripts.into()),
            ..Self::default()
        }
    }

    pub fn push(&self, script: Script) {
        self.scripts.lock().unwrap().push_back(script);
    }

    pub fn opens(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

pub fn done(image: &str) -> Script {
    vec![
        ExecutorEvent::Log("Step 1/3 : FROM python:3.12-slim".into()),
        ExecutorEvent::Done {
            image: image.into(),
        },
    ]
}

pub fn failed(message: &str) -> Script {
    vec![
        ExecutorEvent::Log("Step 2/3 : RUN pip install -r requirements.txt".into()),
        ExecutorEvent::Failed {
            message: message.into(),
        },
    ]
}

struct FakeConnection {
    events: VecDeque<ExecutorEvent>,
    closes: Arc<Mutex<Vec<u16>>>,
}

#[async_trait]
impl BuildConnection for FakeConnection {
    async fn next_event(&mut self) -> Option<ExecutorEvent> {
        match self.events.pop_front() {
            Some(event) => Some(event),
            None => std::future::pending().await,
        }
    }

    async fn close(&mut self, code: u16, _reason: &str) {
        self.closes.lock().unwrap().push(code);
    }
}

#[async_trait]
impl BuildTransport for FakeExecutor {
    async fn open(&self, request: &BuildRequest) -> ClientResult<Box<dyn BuildConnection>> {
        self.requests.lock().unwrap().push(request.clone());
        let events = self.scripts.lock().unwrap().pop_front().unwrap_or_default();
        Ok(Box::new(FakeConnection {
            events: events.into(),
            closes: self.closes.clone(),
        }))
    }
}

// ── Runtime ──

#[derive(Default)]
pub struct FakeRuntime {
    pub fail_start: Option<String>,
    pub starts: AtomicUsize,
    pub stops: AtomicUsize,
    logs: Mutex<Option<mpsc::UnboundedReceiver<ClientResult<LogEntry>>>>,
}

impl FakeRuntime {
    /// A controller whose `start` answers HTTP 500 with `message` as the body.
    pub fn failing_start(message: &str) -> Self {
        Self {
            fail_start: Some(message.into()),
            ..Self::default()
        }
    }

    /// Feed the next log stream. Dropping the sender ends the stream.
    pub fn log_feed(&self) -> mpsc::UnboundedSender<ClientResult<LogEntry>> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.logs.lock().unwrap() = Some(rx);
        tx
    }

    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn stops(&self) -> usize {
        self.stops.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RuntimeController for FakeRuntime {
    async fn start(&self, _image: &str) -> ClientResult<RuntimeInfo> {
        if let Some(msg) = &self.fail_start {
            return Err(ClientError::Http {
                status: 500,
                body: msg.clone(),
            });
        }
        self.starts.fetch_add(1, Ordering::SeqCst);
        Ok(RuntimeInfo {
            id: Some("c-1".into()),
            name: Some("weather-bot".into()),
        })
    }

    async fn stop(&self) -> ClientResult<()> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn logs(&self) -> ClientResult<LogStream> {
        let feed = self.logs.lock().unwrap().take();
        match feed {
            Some(rx) => Ok(Box::pin(futures::stream::unfold(rx, |mut rx| async move {
                rx.recv().await.map(|item| (item, rx))
            }))),
            None => Ok(Box::pin(futures::stream::pending())),
        }
    }
}

// ── Harness ──

pub struct Harness {
    pub orch: Orchestrator,
    pub events: mpsc::UnboundedReceiver<SessionEvent>,
    pub verifier: Arc<FakeVerifier>,
    pub compiler: Arc<FakeCompiler>,
    pub executor: Arc<FakeExecutor>,
    pub runtime: Arc<FakeRuntime>,
}

impl Harness {
    pub fn new(compiler: FakeCompiler, executor: FakeExecutor) -> Self {
        Self::with(FakeVerifier::default(), compiler, executor, FakeRuntime::default())
    }

    pub fn with(
        verifier: FakeVerifier,
        compiler: FakeCompiler,
        executor: FakeExecutor,
        runtime: FakeRuntime,
    ) -> Self {
        let verifier = Arc::new(verifier);
        let compiler = Arc::new(compiler);
        let executor = Arc::new(executor);
        let runtime = Arc::new(runtime);
        let mut orch = Orchestrator::new(
            Collaborators {
                verifier: verifier.clone(),
                compiler: compiler.clone(),
                executor: executor.clone(),
                runtime: runtime.clone(),
            },
            Limits::default(),
        );
        let events = orch.subscribe();
        Self {
            orch,
            events,
            verifier,
            compiler,
            executor,
            runtime,
        }
    }

    /// Everything emitted so far.
    pub fn drain(&mut self) -> Vec<SessionEvent> {
        let mut out = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            out.push(event);
        }
        out
    }
}

pub fn request() -> botforge::StartRequest {
    botforge::StartRequest {
        intent: "Reply with the weather for a city".into(),
        credential: "123:abc".into(),
        library: String::new(),
    }
}
