//! End-to-end lifecycle scenarios against in-memory collaborators.

mod common;

use std::collections::BTreeMap;
use std::time::Duration;

use botforge::event::SessionEvent;
use botforge::logs::Phase;
use botforge::runtime_session::RuntimeState;
use botforge::session::{DEPENDENCY_MANIFEST, ENV_FILE};
use botforge::{Access, BuildState, FileView, LifecycleError};
use botforge_sdk::LogEntry;
use botforge_sdk::compiler::SecretSpec;
use botforge_sdk::executor::{CLOSE_CLIENT_TIMEOUT, CLOSE_NORMAL};
use common::*;

fn states(events: &[SessionEvent]) -> Vec<BuildState> {
    events
        .iter()
        .filter_map(|e| match e {
            SessionEvent::StateChanged { to, .. } => Some(*to),
            _ => None,
        })
        .collect()
}

fn build_messages(h: &Harness) -> Vec<String> {
    h.orch
        .logs()
        .entries(Phase::Build)
        .iter()
        .map(|e| e.message.clone())
        .collect()
}

async fn built_and_running() -> Harness {
    let mut h = Harness::new(
        FakeCompiler::default(),
        FakeExecutor::scripted(vec![done("bot:1")]),
    );
    h.orch.start(request()).await.unwrap();
    assert_eq!(h.orch.drive_build().await.unwrap(), BuildState::Success);
    h
}

#[tokio::test]
async fn first_build_succeeds_and_bot_runs() {
    let mut h = built_and_running().await;

    assert_eq!(
        states(&h.drain()),
        vec![
            BuildState::Validating,
            BuildState::Planning,
            BuildState::Coding,
            BuildState::Building,
            BuildState::Success,
        ]
    );
    assert_eq!(h.orch.runtime_state(), RuntimeState::Running);
    assert_eq!(h.orch.session().image(), Some("bot:1"));
    assert_eq!(h.orch.session().attempt(), 0);
    assert!(h.orch.session().files().get(DEPENDENCY_MANIFEST).is_some());
    assert!(h.orch.session().files().get(ENV_FILE).is_none());
    assert_eq!(h.runtime.starts(), 1);
    let info = h.orch.runtime_info().unwrap();
    assert_eq!(info.id.as_deref(), Some("c-1"));
    assert_eq!(info.name.as_deref(), Some("weather-bot"));

    let log = build_messages(&h);
    assert!(log.iter().any(|m| m.contains("Step 1/3")));
    assert!(log.iter().any(|m| m.contains("@weather_bot")));
}

#[tokio::test]
async fn two_failures_are_repaired_before_success() {
    let compiler = FakeCompiler::with_repairs(vec![
        patch("main.py", "import aiogram\n", 0.6),
        patch("handlers.py", "from aiogram import Router\n", 0.9),
    ]);
    let executor = FakeExecutor::scripted(vec![
        failed("ModuleNotFoundError: No module named 'aiogram'"),
        failed("ImportError: cannot import name 'Router'"),
        done("bot:3"),
    ]);
    let mut h = Harness::new(compiler, executor);
    h.orch.start(request()).await.unwrap();

    assert_eq!(h.orch.drive_build().await.unwrap(), BuildState::Success);
    assert_eq!(h.orch.session().attempt(), 2);
    assert_eq!(h.compiler.repair_calls(), 2);
    assert_eq!(h.executor.opens(), 3);

    let confidences: Vec<f64> = h
        .drain()
        .into_iter()
        .filter_map(|e| match e {
            SessionEvent::RepairApplied { confidence, .. } => Some(confidence),
            _ => None,
        })
        .collect();
    assert_eq!(confidences, vec![0.6, 0.9]);

    let manifest = &h.orch.session().files().get(DEPENDENCY_MANIFEST).unwrap().code;
    assert_eq!(manifest, "aiogram==3.1\naiohttp\n");
    let last = h.executor.requests.lock().unwrap().last().cloned().unwrap();
    let main = last.files.iter().find(|f| f.name == "main.py").unwrap();
    assert_eq!(main.code, "import aiogram\n");
}

#[tokio::test]
async fn failing_repair_ends_in_error() {
    let compiler = FakeCompiler::with_repairs(vec![Err(botforge_sdk::ClientError::Transport(
        "debug service down".into(),
    ))]);
    let mut h = Harness::new(compiler, FakeExecutor::scripted(vec![failed("SyntaxError")]));
    h.orch.start(request()).await.unwrap();

    let err = h.orch.drive_build().await.unwrap_err();
    assert!(matches!(err, LifecycleError::DebugService(_)));
    assert_eq!(h.orch.state(), BuildState::Error);
    assert_eq!(h.orch.session().attempt(), 1);
    assert_eq!(h.orch.runtime_state(), RuntimeState::Stopped);
}

#[tokio::test]
async fn empty_repair_patch_ends_in_error() {
    let compiler = FakeCompiler::with_repairs(vec![empty_patch()]);
    let mut h = Harness::new(compiler, FakeExecutor::scripted(vec![failed("SyntaxError")]));
    h.orch.start(request()).await.unwrap();

    let err = h.orch.drive_build().await.unwrap_err();
    assert!(matches!(err, LifecycleError::DebugService(_)));
    assert_eq!(h.orch.state(), BuildState::Error);
    assert_eq!(h.orch.session().attempt(), 1);
    assert_eq!(h.executor.opens(), 1);
    assert_eq!(h.compiler.repair_calls(), 1);
}

#[tokio::test]
async fn rebuild_recovers_from_a_failed_repair() {
    let compiler = FakeCompiler::with_repairs(vec![Err(botforge_sdk::ClientError::Transport(
        "debug service down".into(),
    ))]);
    let mut h = Harness::new(compiler, FakeExecutor::scripted(vec![failed("SyntaxError")]));
    h.orch.start(request()).await.unwrap();
    assert!(h.orch.drive_build().await.is_err());
    assert_eq!(h.orch.state(), BuildState::Error);
    h.drain();

    h.executor.push(done("bot:2"));
    h.orch.rebuild().await.unwrap();
    assert_eq!(h.orch.session().attempt(), 0);
    assert_eq!(h.orch.drive_build().await.unwrap(), BuildState::Success);
    assert_eq!(states(&h.drain()), vec![BuildState::Building, BuildState::Success]);
    assert_eq!(h.orch.session().image(), Some("bot:2"));
    assert_eq!(h.orch.runtime_state(), RuntimeState::Running);
}

#[tokio::test]
async fn each_rebuild_gets_the_full_attempt_budget() {
    let compiler = FakeCompiler::with_repairs(vec![
        patch("main.py", "v2", 0.5),
        patch("main.py", "v3", 0.5),
    ]);
    let executor = FakeExecutor::scripted(vec![failed("boom"), failed("boom"), failed("boom")]);
    let mut h = Harness::new(compiler, executor);
    h.orch.start(request()).await.unwrap();
    assert!(h.orch.drive_build().await.is_err());
    assert_eq!(h.orch.session().attempt(), 3);

    // A rebuild that keeps failing stays within the same bound.
    for _ in 0..3 {
        h.executor.push(failed("boom"));
    }
    h.compiler
        .push_repairs(vec![patch("main.py", "v4", 0.5), patch("main.py", "v5", 0.5)]);
    h.orch.rebuild().await.unwrap();
    let err = h.orch.drive_build().await.unwrap_err();
    assert_eq!(err, LifecycleError::Build("boom".into()));
    assert_eq!(h.orch.session().attempt(), 3);
    assert_eq!(h.executor.opens(), 6);
    assert_eq!(h.compiler.repair_calls(), 4);

    h.executor.push(done("bot:7"));
    h.orch.rebuild().await.unwrap();
    assert_eq!(h.orch.drive_build().await.unwrap(), BuildState::Success);
    assert_eq!(h.orch.session().attempt(), 0);
    assert_eq!(h.executor.opens(), 7);
}

#[tokio::test]
async fn persistent_failure_stops_after_three_builds() {
    let compiler = FakeCompiler::with_repairs(vec![
        patch("main.py", "v2", 0.5),
        patch("main.py", "v3", 0.5),
        patch("main.py", "v4", 0.5),
    ]);
    let executor = FakeExecutor::scripted(vec![failed("boom"), failed("boom"), failed("boom")]);
    let mut h = Harness::new(compiler, executor);
    h.orch.start(request()).await.unwrap();

    let err = h.orch.drive_build().await.unwrap_err();
    assert_eq!(err, LifecycleError::Build("boom".into()));
    assert_eq!(h.executor.opens(), 3);
    assert_eq!(h.compiler.repair_calls(), 2);
    assert_eq!(h.orch.state(), BuildState::Error);
    assert_eq!(h.orch.session().last_error(), Some("boom"));
}

#[tokio::test]
async fn rejected_credential_returns_to_idle() {
    let mut h = Harness::with(
        FakeVerifier {
            reject: Some("Unauthorized".into()),
        },
        FakeCompiler::default(),
        FakeExecutor::default(),
        FakeRuntime::default(),
    );
    let err = h.orch.start(request()).await.unwrap_err();
    assert_eq!(err, LifecycleError::Credential("Unauthorized".into()));
    assert_eq!(h.orch.state(), BuildState::Idle);
    assert_eq!(states(&h.drain()), vec![BuildState::Validating, BuildState::Idle]);
    assert_eq!(
        h.compiler
            .secret_calls
            .load(std::sync::atomic::Ordering::SeqCst),
        0
    );
}

#[tokio::test]
async fn blank_input_is_rejected_before_any_call() {
    let mut h = Harness::new(FakeCompiler::default(), FakeExecutor::default());
    let mut req = request();
    req.credential = "   ".into();
    assert!(matches!(
        h.orch.start(req).await,
        Err(LifecycleError::Validation(_))
    ));
    assert_eq!(h.orch.state(), BuildState::Idle);
    assert!(h.drain().is_empty());
}

#[tokio::test]
async fn secrets_are_gathered_then_sent_with_the_build() {
    let compiler = FakeCompiler {
        secrets: vec![SecretSpec {
            key: "WEATHER_API_KEY".into(),
            description: "OpenWeather key".into(),
        }],
        ..FakeCompiler::default()
    };
    let mut h = Harness::new(compiler, FakeExecutor::scripted(vec![done("bot:1")]));
    h.orch.start(request()).await.unwrap();
    assert_eq!(h.orch.state(), BuildState::GatheringConfig);

    let err = h.orch.submit_secrets(BTreeMap::new()).await.unwrap_err();
    assert!(matches!(err, LifecycleError::Validation(m) if m.contains("WEATHER_API_KEY")));
    assert_eq!(h.orch.state(), BuildState::GatheringConfig);

    let values = BTreeMap::from([("WEATHER_API_KEY".to_string(), "w-123".to_string())]);
    h.orch.submit_secrets(values).await.unwrap();
    assert_eq!(h.orch.state(), BuildState::Building);
    assert_eq!(h.orch.drive_build().await.unwrap(), BuildState::Success);

    let req = h.executor.requests.lock().unwrap()[0].clone();
    let env = req.files.iter().find(|f| f.name == ENV_FILE).unwrap();
    assert_eq!(env.code, "BOT_TOKEN=123:abc\nWEATHER_API_KEY=w-123\n");
    assert_eq!(req.token, "123:abc");
}

#[tokio::test]
async fn planning_failure_is_a_generation_error() {
    let compiler = FakeCompiler {
        fail_plan: true,
        ..FakeCompiler::default()
    };
    let mut h = Harness::new(compiler, FakeExecutor::default());
    let err = h.orch.start(request()).await.unwrap_err();
    assert!(matches!(err, LifecycleError::Generation(_)));
    assert_eq!(h.orch.state(), BuildState::Error);
    assert_eq!(h.executor.opens(), 0);
}

#[tokio::test]
async fn runtime_start_failure_keeps_the_build_successful() {
    let mut h = Harness::with(
        FakeVerifier::default(),
        FakeCompiler::default(),
        FakeExecutor::scripted(vec![done("bot:1")]),
        FakeRuntime::failing_start("no capacity"),
    );
    h.orch.start(request()).await.unwrap();
    assert_eq!(h.orch.drive_build().await.unwrap(), BuildState::Success);
    assert_eq!(h.orch.runtime_state(), RuntimeState::Stopped);
    assert!(h.drain().contains(&SessionEvent::RuntimeStartFailed {
        message: "no capacity".into()
    }));
}

#[tokio::test]
async fn edits_unlock_rebuild_and_reset_the_build_log() {
    let mut h = built_and_running().await;

    let err = h.orch.rebuild().await.unwrap_err();
    assert!(matches!(err, LifecycleError::Validation(_)));

    let Ok(FileView::Editable(editor)) = h.orch.open_file("main.py", Access::Editable) else {
        panic!("expected an editor after success");
    };
    assert!(editor.save("print('v2')\n"));
    assert!(h.orch.session().has_unrebuilt_changes());

    h.executor.push(done("bot:2"));
    h.orch.rebuild().await.unwrap();
    assert_eq!(h.orch.state(), BuildState::Building);
    assert_eq!(h.orch.runtime_state(), RuntimeState::Stopped);
    assert_eq!(h.runtime.stops(), 1);
    assert!(!build_messages(&h).iter().any(|m| m.contains("Build succeeded")));
    assert!(build_messages(&h).iter().any(|m| m.contains("Plan ready")));

    // No editing while a build is in flight.
    assert!(h.orch.open_file("main.py", Access::Editable).is_err());
    assert!(h.orch.open_file("main.py", Access::ReadOnly).is_ok());

    assert_eq!(h.orch.drive_build().await.unwrap(), BuildState::Success);
    assert_eq!(h.orch.session().image(), Some("bot:2"));
    let last = h.executor.requests.lock().unwrap().last().cloned().unwrap();
    let main = last.files.iter().find(|f| f.name == "main.py").unwrap();
    assert_eq!(main.code, "print('v2')\n");
}

#[tokio::test]
async fn reset_mid_build_closes_the_connection_and_clears_everything() {
    let mut h = Harness::new(FakeCompiler::default(), FakeExecutor::default());
    h.orch.start(request()).await.unwrap();
    assert_eq!(h.orch.state(), BuildState::Building);
    tokio::task::yield_now().await;

    h.orch.reset().await;
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
    assert_eq!(*h.executor.closes.lock().unwrap(), vec![CLOSE_NORMAL]);
    assert_eq!(h.orch.state(), BuildState::Idle);
    assert!(h.orch.session().files().is_empty());
    assert!(h.orch.logs().entries(Phase::Build).is_empty());
    assert_eq!(h.orch.session().attempt(), 0);

    // A fresh session can start right away.
    h.executor.push(done("bot:9"));
    h.orch.start(request()).await.unwrap();
    assert_eq!(h.orch.drive_build().await.unwrap(), BuildState::Success);
}

#[tokio::test]
async fn reset_while_running_stops_the_bot() {
    let mut h = built_and_running().await;
    h.orch.reset().await;

    assert_eq!(h.orch.state(), BuildState::Idle);
    assert_eq!(h.orch.runtime_state(), RuntimeState::Stopped);
    assert_eq!(h.orch.countdown(), 600);
    assert_eq!(h.runtime.stops(), 1);
    assert!(h.orch.logs().entries(Phase::Runtime).is_empty());
    assert!(h.orch.session().image().is_none());
}

#[tokio::test(start_paused = true)]
async fn countdown_stops_the_bot_exactly_once() {
    let mut h = built_and_running().await;
    let started = tokio::time::Instant::now();

    while h.orch.runtime_state() == RuntimeState::Running {
        let inbound = h.orch.next_inbound().await.unwrap();
        h.orch.handle(inbound).await.unwrap();
    }
    assert_eq!(started.elapsed(), Duration::from_secs(600));
    assert_eq!(h.orch.countdown(), 0);
    assert_eq!(h.orch.state(), BuildState::Success);

    let stops = h
        .drain()
        .into_iter()
        .filter(|e| {
            matches!(
                e,
                SessionEvent::RuntimeChanged {
                    from: RuntimeState::Running,
                    to: RuntimeState::Stopped
                }
            )
        })
        .count();
    assert_eq!(stops, 1);
    assert_eq!(h.runtime.stops(), 1);
}

#[tokio::test]
async fn lost_log_stream_stops_the_runtime_only() {
    let mut h = Harness::new(
        FakeCompiler::default(),
        FakeExecutor::scripted(vec![done("bot:1")]),
    );
    let feed = h.runtime.log_feed();
    h.orch.start(request()).await.unwrap();
    h.orch.drive_build().await.unwrap();

    feed.send(Ok(LogEntry::log("polling started"))).unwrap();
    drop(feed);

    let mut disconnected = false;
    while h.orch.runtime_state() == RuntimeState::Running {
        let inbound = h.orch.next_inbound().await.unwrap();
        if let Err(e) = h.orch.handle(inbound).await {
            assert!(matches!(e, LifecycleError::StreamDisconnect(_)));
            disconnected = true;
        }
    }
    assert!(disconnected);
    assert_eq!(h.orch.state(), BuildState::Success);
    let runtime_log: Vec<_> = h
        .orch
        .logs()
        .entries(Phase::Runtime)
        .iter()
        .map(|e| e.message.as_str())
        .collect();
    assert!(runtime_log.contains(&"polling started"));
}

#[tokio::test(start_paused = true)]
async fn hung_builds_time_out_with_client_close_code() {
    let compiler = FakeCompiler::with_repairs(vec![
        patch("main.py", "v2", 0.4),
        patch("main.py", "v3", 0.4),
    ]);
    let mut h = Harness::new(compiler, FakeExecutor::default());
    h.orch.start(request()).await.unwrap();

    let err = h.orch.drive_build().await.unwrap_err();
    let LifecycleError::Build(message) = err else {
        panic!("expected a build error");
    };
    assert!(message.contains("timed out"));
    assert_eq!(
        *h.executor.closes.lock().unwrap(),
        vec![CLOSE_CLIENT_TIMEOUT; 3]
    );
}

#[tokio::test]
async fn restart_runs_the_same_image_again() {
    let mut h = built_and_running().await;
    h.orch.restart_runtime().await.unwrap();
    assert_eq!(h.orch.runtime_state(), RuntimeState::Running);
    assert_eq!(h.runtime.starts(), 2);
    assert_eq!(h.runtime.stops(), 1);
    assert_eq!(h.orch.countdown(), 600);
}
