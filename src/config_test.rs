use std::time::Duration;

use anyhow::Result;

use crate::config::{Config, SubmitFailurePolicy, DEFAULT_CLIENT_PORT, DEFAULT_DISCOVERY_TIMEOUT_SECONDS, DEFAULT_DOCKER_BIN, DEFAULT_WORK_DIR};

#[test]
fn config_deserializes_from_full_env() -> Result<()> {
    let config: Config = envy::from_iter(vec![
        ("RUST_LOG".into(), "error".into()),
        ("CLIENT_PORT".into(), "7000".into()),
        ("METRICS_PORT".into(), "7001".into()),
        ("WORK_DIR".into(), "/var/lib/knot".into()),
        ("DOCKER_BIN".into(), "/usr/bin/podman".into()),
        ("PLUGINS_PATH".into(), "/etc/knot/plugins.json".into()),
        ("DISCOVERY_TIMEOUT_SECONDS".into(), "60".into()),
        ("SUBMIT_FAILURE_POLICY".into(), "log_only".into()),
    ])?;

    assert!(config.rust_log == "error", "unexpected value parsed for RUST_LOG, got {}, expected {}", config.rust_log, "error");
    assert!(config.client_port == 7000, "unexpected value parsed for CLIENT_PORT, got {}, expected {}", config.client_port, "7000");
    assert!(config.metrics_port == 7001, "unexpected value parsed for METRICS_PORT, got {}, expected {}", config.metrics_port, "7001");
    assert!(config.work_dir == "/var/lib/knot", "unexpected value parsed for WORK_DIR, got {}, expected {}", config.work_dir, "/var/lib/knot");
    assert!(
        config.docker_bin == "/usr/bin/podman",
        "unexpected value parsed for DOCKER_BIN, got {}, expected {}",
        config.docker_bin,
        "/usr/bin/podman"
    );
    assert!(
        config.plugins_path.as_deref() == Some("/etc/knot/plugins.json"),
        "unexpected value parsed for PLUGINS_PATH, got {:?}, expected {:?}",
        config.plugins_path,
        Some("/etc/knot/plugins.json")
    );
    assert!(
        config.discovery_timeout() == Duration::from_secs(60),
        "unexpected value parsed for DISCOVERY_TIMEOUT_SECONDS, got {:?}, expected {:?}",
        config.discovery_timeout(),
        Duration::from_secs(60)
    );
    assert!(
        config.submit_failure_policy == SubmitFailurePolicy::LogOnly,
        "unexpected value parsed for SUBMIT_FAILURE_POLICY, got {:?}, expected {:?}",
        config.submit_failure_policy,
        SubmitFailurePolicy::LogOnly
    );

    Ok(())
}

#[test]
fn config_deserializes_from_sparse_env() -> Result<()> {
    let config: Config = envy::from_iter(Vec::<(String, String)>::new())?;

    assert!(config.rust_log == "info", "unexpected default for RUST_LOG, got {}, expected {}", config.rust_log, "info");
    assert!(
        config.client_port == DEFAULT_CLIENT_PORT,
        "unexpected default for CLIENT_PORT, got {}, expected {}",
        config.client_port,
        DEFAULT_CLIENT_PORT
    );
    assert!(config.work_dir == DEFAULT_WORK_DIR, "unexpected default for WORK_DIR, got {}, expected {}", config.work_dir, DEFAULT_WORK_DIR);
    assert!(config.docker_bin == DEFAULT_DOCKER_BIN, "unexpected default for DOCKER_BIN, got {}, expected {}", config.docker_bin, DEFAULT_DOCKER_BIN);
    assert!(config.plugins_path.is_none(), "expected PLUGINS_PATH to default to None, got {:?}", config.plugins_path);
    assert!(
        config.discovery_timeout_seconds == DEFAULT_DISCOVERY_TIMEOUT_SECONDS,
        "unexpected default for DISCOVERY_TIMEOUT_SECONDS, got {}, expected {}",
        config.discovery_timeout_seconds,
        DEFAULT_DISCOVERY_TIMEOUT_SECONDS
    );
    assert!(
        config.submit_failure_policy == SubmitFailurePolicy::Surface,
        "unexpected default for SUBMIT_FAILURE_POLICY, got {:?}, expected {:?}",
        config.submit_failure_policy,
        SubmitFailurePolicy::Surface
    );

    Ok(())
}

#[test]
fn config_rejects_unknown_submit_failure_policy() {
    let res: std::result::Result<Config, envy::Error> = envy::from_iter(vec![("SUBMIT_FAILURE_POLICY".into(), "retry".into())]);
    assert!(res.is_err(), "expected unknown SUBMIT_FAILURE_POLICY to be rejected, got {:?}", res);
}
