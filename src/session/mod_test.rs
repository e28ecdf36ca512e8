use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::json;
use tokio::sync::broadcast;

use crate::config::{Config, SubmitFailurePolicy};
use crate::error::AppError;
use crate::fixtures::{self, ScriptRuntime, Step};
use crate::models::catalog::{Catalog, FIELD_SELECTED};
use crate::models::descriptor::FieldValues;
use crate::models::lifecycle::{DiscoveryError, LifecycleEvent, LifecycleState};
use crate::runner::CATALOG_FILE;
use crate::session::submit::SubmitRequest;
use crate::session::{EditRequest, SessionCtl, SessionHandle};

const TIMEOUT: Duration = Duration::from_secs(10);

struct Harness {
    handle: SessionHandle,
    runtime: Arc<ScriptRuntime>,
    events: broadcast::Receiver<LifecycleEvent>,
    config: Arc<Config>,
    _shutdown: broadcast::Sender<()>,
    _tmpdir: tempfile::TempDir,
}

async fn setup(runtime: ScriptRuntime) -> Result<Harness> {
    setup_with(runtime, |_| ()).await
}

async fn setup_with(runtime: ScriptRuntime, tweak: impl FnOnce(&mut Config)) -> Result<Harness> {
    let (config, tmpdir) = Config::new_test()?;
    let mut config = (*config).clone();
    tweak(&mut config);
    let config = Arc::new(config);
    let runtime = Arc::new(runtime);
    let (shutdown, _) = broadcast::channel(1);
    let (ctl, handle) = SessionCtl::new(config.clone(), runtime.clone(), &shutdown).await?;
    let events = handle.subscribe_events();
    let _handle = ctl.spawn();
    Ok(Harness {
        handle,
        runtime,
        events,
        config,
        _shutdown: shutdown,
        _tmpdir: tmpdir,
    })
}

async fn wait_for_state(handle: &SessionHandle, expected: LifecycleState) -> Result<()> {
    let mut state = handle.watch_state();
    let res = tokio::time::timeout(TIMEOUT, async {
        loop {
            if *state.borrow_and_update() == expected {
                return Ok(());
            }
            state.changed().await.context("session state channel closed")?;
        }
    })
    .await;
    res.with_context(|| format!("timeout waiting for state {}, session is {}", expected, handle.state()))?
}

async fn next_event(events: &mut broadcast::Receiver<LifecycleEvent>, name: &str) -> Result<LifecycleEvent> {
    tokio::time::timeout(TIMEOUT, async {
        loop {
            let event = events.recv().await.context("lifecycle event channel closed")?;
            if event.name() == name {
                return Ok(event);
            }
        }
    })
    .await
    .with_context(|| format!("timeout waiting for event {}", name))?
}

fn target_values() -> FieldValues {
    let mut values = FieldValues::new();
    values.insert("api_token".into(), json!("secret"));
    values
}

fn edit(stream_id: &str, field: &str, value: serde_json::Value) -> EditRequest {
    EditRequest {
        stream_id: stream_id.into(),
        breadcrumb: None,
        index: None,
        field: field.into(),
        value,
    }
}

/// Drive the given harness to the point where the discovered catalog awaits edits.
async fn discover(harness: &Harness) -> Result<()> {
    harness.handle.select_target(fixtures::target_descriptor()).await?;
    harness.handle.select_tap(fixtures::tap_descriptor(), FieldValues::new()).await?;
    wait_for_state(&harness.handle, LifecycleState::AwaitingEdits).await
}

#[tokio::test]
async fn happy_path_reaches_configured() -> Result<()> {
    let mut harness = setup(ScriptRuntime::happy()).await?;

    harness.handle.select_target(fixtures::target_descriptor()).await?;
    assert_eq!(harness.handle.state(), LifecycleState::Installed, "expected target to be installed");
    harness.handle.select_tap(fixtures::tap_descriptor(), FieldValues::new()).await?;
    wait_for_state(&harness.handle, LifecycleState::AwaitingEdits).await?;
    harness.handle.edit_field(edit("public-users", "replication-key", json!("updated_at"))).await?;
    harness
        .handle
        .submit(SubmitRequest {
            field_values: target_values(),
            start_date: Some("2024-01-01".into()),
            catalog: None,
        })
        .await?;
    wait_for_state(&harness.handle, LifecycleState::Configured).await?;

    for name in ["targetSelected", "targetInstalled", "discoveryStarted", "schemaLoaded", "catalogEdited", "submitting", "targetConfigured"] {
        next_event(&mut harness.events, name).await?;
    }
    let workdir = std::path::Path::new(&harness.config.work_dir).join(harness.handle.id.to_string());
    let catalog = Catalog::parse(&tokio::fs::read_to_string(workdir.join(CATALOG_FILE)).await?)?;
    let key = catalog.replication_key("public-users")?;
    assert_eq!(key.as_deref(), Some("updated_at"), "expected persisted catalog to carry the edit, got {:?}", key);
    Ok(())
}

#[tokio::test]
async fn discovery_output_is_published_to_the_session_log() -> Result<()> {
    use futures::stream::StreamExt;
    let harness = setup(ScriptRuntime::happy()).await?;

    discover(&harness).await?;
    let mut logs = harness.handle.subscribe_logs(Some(0)).await?;

    let mut found = false;
    while let Ok(Some(line)) = tokio::time::timeout(Duration::from_millis(500), logs.next()).await {
        if line.text.contains("INFO discovering streams") {
            found = true;
            break;
        }
    }
    assert!(found, "expected tap stderr output to be published to the session log");
    Ok(())
}

#[tokio::test]
async fn duplicate_select_target_attaches_to_inflight_install() -> Result<()> {
    let runtime = ScriptRuntime::happy();
    runtime.set(Step::Install, "sleep 0.5; echo installed");
    let harness = setup(runtime).await?;

    let (first, second) = tokio::join!(
        harness.handle.select_target(fixtures::target_descriptor()),
        harness.handle.select_target(fixtures::target_descriptor()),
    );

    assert!(first.is_ok() && second.is_ok(), "expected both requests to succeed, got {:?} & {:?}", first, second);
    assert_eq!(harness.runtime.spawned(Step::Install), 1, "expected exactly one install process");
    assert_eq!(harness.handle.state(), LifecycleState::Installed, "expected target to be installed");
    Ok(())
}

#[tokio::test]
async fn failed_install_reports_error_to_every_waiter() -> Result<()> {
    let runtime = ScriptRuntime::happy();
    runtime.set(Step::Install, "sleep 0.3; echo 'manifest unknown' >&2; exit 1");
    let mut harness = setup(runtime).await?;

    let (first, second) = tokio::join!(
        harness.handle.select_target(fixtures::target_descriptor()),
        harness.handle.select_target(fixtures::target_descriptor()),
    );

    assert!(matches!(first, Err(AppError::InstallFailed(_))), "expected InstallFailed, got {:?}", first);
    assert!(matches!(second, Err(AppError::InstallFailed(_))), "expected InstallFailed, got {:?}", second);
    assert_eq!(harness.handle.state(), LifecycleState::InstallFailed, "unexpected state");
    match next_event(&mut harness.events, "targetInstalled").await? {
        LifecycleEvent::TargetInstalled { error: Some(error), .. } => {
            assert!(error.contains("manifest unknown"), "expected diagnostic in event, got {}", error)
        }
        event => anyhow::bail!("expected targetInstalled with an error, got {:?}", event),
    }
    Ok(())
}

#[tokio::test]
async fn tap_failure_moves_to_tap_error_with_diagnostic() -> Result<()> {
    let runtime = ScriptRuntime::happy();
    runtime.set(Step::Discover, "echo 'CRITICAL auth failed' >&2; exit 1");
    let mut harness = setup(runtime).await?;

    harness.handle.select_target(fixtures::target_descriptor()).await?;
    harness.handle.select_tap(fixtures::tap_descriptor(), FieldValues::new()).await?;
    wait_for_state(&harness.handle, LifecycleState::TapError).await?;

    match next_event(&mut harness.events, "discoveryFailed").await? {
        LifecycleEvent::DiscoveryFailed { error, diagnostic } => {
            assert_eq!(error, DiscoveryError::TapError, "unexpected discovery error");
            assert!(diagnostic.contains("auth failed"), "expected diagnostic to carry the tap's output, got {}", diagnostic);
        }
        event => anyhow::bail!("expected discoveryFailed, got {:?}", event),
    }
    Ok(())
}

#[tokio::test]
async fn malformed_discovery_output_moves_to_invalid_schema() -> Result<()> {
    let runtime = ScriptRuntime::happy();
    runtime.set(Step::Discover, "echo '{\"streams\": [{\"tap_stream_id\": \"a\"}]}'");
    let harness = setup(runtime).await?;

    harness.handle.select_target(fixtures::target_descriptor()).await?;
    harness.handle.select_tap(fixtures::tap_descriptor(), FieldValues::new()).await?;

    wait_for_state(&harness.handle, LifecycleState::InvalidSchema).await
}

#[tokio::test]
async fn mount_denial_moves_to_docker_config_error() -> Result<()> {
    let runtime = ScriptRuntime::happy();
    runtime.set(Step::Discover, "echo 'docker: Error response from daemon: Mounts denied: path is not shared from the host' >&2; exit 125");
    let mut harness = setup(runtime).await?;

    harness.handle.select_target(fixtures::target_descriptor()).await?;
    harness.handle.select_tap(fixtures::tap_descriptor(), FieldValues::new()).await?;
    wait_for_state(&harness.handle, LifecycleState::DockerConfigError).await?;

    let event = next_event(&mut harness.events, "discoveryFailed").await?;
    assert!(
        matches!(event, LifecycleEvent::DiscoveryFailed { error: DiscoveryError::DockerConfig, .. }),
        "expected a docker config failure, got {:?}",
        event
    );
    Ok(())
}

#[tokio::test]
async fn silent_tap_times_out() -> Result<()> {
    let runtime = ScriptRuntime::happy();
    runtime.set(Step::Discover, "exec sleep 30");
    let harness = setup_with(runtime, |config| config.discovery_timeout_seconds = 1).await?;

    harness.handle.select_target(fixtures::target_descriptor()).await?;
    harness.handle.select_tap(fixtures::tap_descriptor(), FieldValues::new()).await?;

    wait_for_state(&harness.handle, LifecycleState::DiscoveryTimeout).await
}

#[tokio::test]
async fn tap_selected_early_is_discovered_after_install() -> Result<()> {
    let harness = setup(ScriptRuntime::happy()).await?;

    harness.handle.select_tap(fixtures::tap_descriptor(), FieldValues::new()).await?;
    assert_eq!(harness.runtime.spawned(Step::Discover), 0, "expected discovery to wait for the install");
    harness.handle.select_target(fixtures::target_descriptor()).await?;
    wait_for_state(&harness.handle, LifecycleState::AwaitingEdits).await?;

    assert_eq!(harness.runtime.spawned(Step::Discover), 1, "expected a single implicit discovery");
    let snapshot = harness.handle.snapshot().await?;
    assert_eq!(snapshot.tap.as_deref(), Some("tap-test"), "unexpected snapshot {:?}", snapshot);
    assert!(snapshot.catalog.is_some(), "expected snapshot to carry the discovered catalog");
    Ok(())
}

#[tokio::test]
async fn submit_without_selected_streams_fails_without_spawning() -> Result<()> {
    let harness = setup(ScriptRuntime::happy()).await?;
    discover(&harness).await?;
    harness.handle.edit_field(edit("public-users", FIELD_SELECTED, json!(false))).await?;

    let res = harness
        .handle
        .submit(SubmitRequest {
            field_values: target_values(),
            ..Default::default()
        })
        .await;

    assert!(matches!(res, Err(AppError::InvalidInput(_))), "expected validation error, got {:?}", res);
    assert_eq!(harness.runtime.spawned(Step::Configure), 0, "expected no configure process");
    assert_eq!(harness.handle.state(), LifecycleState::AwaitingEdits, "expected session to keep awaiting edits");
    Ok(())
}

#[tokio::test]
async fn edits_are_rejected_before_discovery() -> Result<()> {
    let harness = setup(ScriptRuntime::happy()).await?;

    let res = harness.handle.edit_field(edit("public-users", FIELD_SELECTED, json!(true))).await;

    assert!(
        matches!(res, Err(AppError::InvalidTransition { state: LifecycleState::Idle, .. })),
        "expected invalid transition, got {:?}",
        res
    );
    Ok(())
}

#[tokio::test]
async fn invalid_edit_leaves_catalog_untouched() -> Result<()> {
    let harness = setup(ScriptRuntime::happy()).await?;
    discover(&harness).await?;

    let unknown = harness.handle.edit_field(edit("public-missing", FIELD_SELECTED, json!(true))).await;
    let mistyped = harness.handle.edit_field(edit("public-users", FIELD_SELECTED, json!("yes"))).await;

    assert!(matches!(unknown, Err(AppError::Catalog(_))), "expected catalog error, got {:?}", unknown);
    assert!(matches!(mistyped, Err(AppError::Catalog(_))), "expected catalog error, got {:?}", mistyped);
    let snapshot = harness.handle.snapshot().await?;
    let catalog = snapshot.catalog.context("expected a catalog")?;
    assert!(catalog.stream("public-users")?.is_selected(), "expected selection to be unchanged");
    Ok(())
}

#[tokio::test]
async fn reconfigure_mid_install_kills_process_and_allows_fresh_selection() -> Result<()> {
    let runtime = ScriptRuntime::happy();
    runtime.set(Step::Install, "echo pulling; exec sleep 30");
    let mut harness = setup(runtime).await?;

    let pending = {
        let handle = harness.handle.clone();
        tokio::spawn(async move { handle.select_target(fixtures::target_descriptor()).await })
    };
    wait_for_state(&harness.handle, LifecycleState::Installing).await?;
    harness.handle.reconfigure().await?;
    let cancelled = tokio::time::timeout(TIMEOUT, pending).await.context("timeout awaiting cancelled install")??;

    assert!(matches!(cancelled, Err(AppError::Cancelled)), "expected pending install to be cancelled, got {:?}", cancelled);
    assert_eq!(harness.handle.state(), LifecycleState::Idle, "expected session to be idle");
    next_event(&mut harness.events, "reconfigured").await?;

    // The killed install's exit must not disturb the fresh selection.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(harness.handle.state(), LifecycleState::Idle, "expected stale exit to be ignored");
    harness.runtime.set(Step::Install, "echo installed");
    harness.handle.select_target(fixtures::target_descriptor()).await?;
    assert_eq!(harness.runtime.spawned(Step::Install), 2, "expected a fresh install process");
    assert_eq!(harness.handle.state(), LifecycleState::Installed, "expected fresh install to succeed");
    Ok(())
}

#[tokio::test]
async fn configure_failure_is_surfaced_by_default() -> Result<()> {
    let runtime = ScriptRuntime::happy();
    runtime.set(Step::Configure, "echo 'invalid api token' >&2; exit 2");
    let mut harness = setup(runtime).await?;
    discover(&harness).await?;

    harness
        .handle
        .submit(SubmitRequest {
            field_values: target_values(),
            ..Default::default()
        })
        .await?;
    wait_for_state(&harness.handle, LifecycleState::ConfigureFailed).await?;

    match next_event(&mut harness.events, "configureFailed").await? {
        LifecycleEvent::ConfigureFailed { diagnostic, .. } => {
            assert!(diagnostic.contains("invalid api token"), "unexpected diagnostic {}", diagnostic)
        }
        event => anyhow::bail!("expected configureFailed, got {:?}", event),
    }
    Ok(())
}

#[tokio::test]
async fn configure_failure_is_only_logged_under_log_only_policy() -> Result<()> {
    let runtime = ScriptRuntime::happy();
    runtime.set(Step::Configure, "echo 'invalid api token' >&2; exit 2");
    let mut harness = setup_with(runtime, |config| config.submit_failure_policy = SubmitFailurePolicy::LogOnly).await?;
    discover(&harness).await?;

    harness
        .handle
        .submit(SubmitRequest {
            field_values: target_values(),
            ..Default::default()
        })
        .await?;
    wait_for_state(&harness.handle, LifecycleState::ConfigureFailed).await?;
    harness.handle.reconfigure().await?;

    let mut seen = Vec::new();
    loop {
        let event = tokio::time::timeout(TIMEOUT, harness.events.recv()).await.context("timeout awaiting events")??;
        if let LifecycleEvent::Reconfigured = event {
            break;
        }
        seen.push(event.name());
    }
    assert!(!seen.contains(&"configureFailed"), "expected no configureFailed event, got {:?}", seen);
    assert!(seen.contains(&"submitting"), "expected submitting event, got {:?}", seen);
    Ok(())
}

#[tokio::test]
async fn closed_session_rejects_further_requests() -> Result<()> {
    let harness = setup(ScriptRuntime::happy()).await?;
    let workdir = std::path::Path::new(&harness.config.work_dir).join(harness.handle.id.to_string());
    assert!(workdir.exists(), "expected session work dir to exist");

    harness.handle.close().await?;
    let res = harness.handle.snapshot().await;

    assert!(matches!(res, Err(AppError::UnknownSession)), "expected closed session to be unknown, got {:?}", res);
    assert!(!workdir.exists(), "expected session work dir to be removed");
    Ok(())
}
