use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use serde_json::json;
use tokio::process::Command;
use uuid::Uuid;

use crate::models::descriptor::{Descriptor, DescriptorField, PluginKind};
use crate::runner::{ContainerRuntime, RunMode};

/// A catalog as emitted by a tap in discovery mode, including tap-specific fields.
pub fn catalog_json() -> serde_json::Value {
    json!({
        "streams": [
            {
                "stream": "users",
                "tap_stream_id": "public-users",
                "table_name": "users",
                "key_properties": ["id"],
                "schema": {"type": "object", "properties": {"id": {"type": "integer"}, "updated_at": {"type": "string", "format": "date-time"}}},
                "metadata": [
                    {
                        "breadcrumb": [],
                        "metadata": {
                            "selected": true,
                            "valid-replication-keys": ["updated_at"],
                            "table-key-properties": ["id"],
                            "database-name": "public",
                            "row-count": 1204
                        }
                    },
                    {"breadcrumb": ["properties", "id"], "metadata": {"inclusion": "automatic", "sql-datatype": "int4"}},
                    {"breadcrumb": ["properties", "updated_at"], "metadata": {"inclusion": "available", "sql-datatype": "timestamp"}}
                ]
            },
            {
                "stream": "orders",
                "tap_stream_id": "public-orders",
                "schema": {"type": "object", "properties": {"id": {"type": "integer"}}},
                "metadata": [
                    {"breadcrumb": ["properties", "id"], "metadata": {"inclusion": "automatic"}},
                    {"breadcrumb": [], "metadata": {"selected": false, "is-view": false}}
                ]
            }
        ],
        "version": 2
    })
}

/// A target descriptor requiring a single field.
pub fn target_descriptor() -> Descriptor {
    Descriptor {
        name: "target-test".into(),
        image: "knot/target-test:latest".into(),
        fields: vec![DescriptorField {
            key: "api_token".into(),
            label: "API Token".into(),
            input_type: "password".into(),
            required: true,
        }],
    }
}

/// A tap descriptor without configurable fields.
pub fn tap_descriptor() -> Descriptor {
    Descriptor {
        name: "tap-test".into(),
        image: "knot/tap-test:latest".into(),
        fields: vec![],
    }
}

/// The step of a pipeline setup which a scripted process stands in for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Step {
    Install,
    Discover,
    Configure,
}

impl Step {
    fn of(mode: &RunMode) -> Self {
        match mode {
            RunMode::Install => Self::Install,
            RunMode::Discover => Self::Discover,
            RunMode::Configure => Self::Configure,
        }
    }
}

/// A container runtime which runs shell scripts in place of containers.
///
/// Every script is run with the session work directory as its current directory.
#[derive(Default)]
pub struct ScriptRuntime {
    scripts: Mutex<HashMap<Step, String>>,
    spawned: Mutex<HashMap<Step, usize>>,
    total: AtomicUsize,
    torn_down: Mutex<Vec<Uuid>>,
}

impl ScriptRuntime {
    /// A runtime where every step succeeds, discovery emitting the fixture catalog.
    pub fn happy() -> Self {
        let runtime = Self::default();
        runtime.set(Step::Install, "echo pulling image; echo image up to date");
        runtime.set(Step::Discover, &format!("echo 'INFO discovering streams' >&2; echo '{}'", catalog_json()));
        runtime.set(Step::Configure, "test -f catalog.json && test -f target_config.json && echo configured");
        runtime
    }

    /// Set the script run for the given step.
    pub fn set(&self, step: Step, script: &str) {
        self.scripts.lock().unwrap().insert(step, script.into());
    }

    /// The number of processes built for the given step.
    pub fn spawned(&self, step: Step) -> usize {
        self.spawned.lock().unwrap().get(&step).copied().unwrap_or(0)
    }

    /// The total number of processes built.
    pub fn total_spawned(&self) -> usize {
        self.total.load(Ordering::SeqCst)
    }

    /// The IDs of the processes whose teardown was requested.
    pub fn torn_down(&self) -> Vec<Uuid> {
        self.torn_down.lock().unwrap().clone()
    }
}

impl ContainerRuntime for ScriptRuntime {
    fn command(&self, _process_id: Uuid, _kind: PluginKind, _descriptor: &Descriptor, mode: &RunMode, workdir: &Path) -> Command {
        let step = Step::of(mode);
        let script = self.scripts.lock().unwrap().get(&step).cloned().unwrap_or_else(|| "true".into());
        *self.spawned.lock().unwrap().entry(step).or_default() += 1;
        self.total.fetch_add(1, Ordering::SeqCst);
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(script).current_dir(workdir);
        cmd
    }

    fn teardown_command(&self, process_id: Uuid, _mode: &RunMode) -> Option<Command> {
        self.torn_down.lock().unwrap().push(process_id);
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg("true");
        Some(cmd)
    }
}
