//! Script task plugin: runs a task's script under an interpreter subprocess.

use std::collections::HashMap;
use std::process::Stdio;

use async_trait::async_trait;
use serde_json::Value;
use tokio::process::Command;

use crate::domain::errors::{SwarmError, SwarmResult};
use crate::domain::models::Task;

use super::{PluginContext, TaskPlugin};

/// Executes `script` tasks. The script body is written to a temp file with
/// the execution context injected as a `CONTEXT` prelude variable, and run
/// under the configured interpreter. The child is killed if the engine's
/// task timeout cancels this future.
pub struct ScriptPlugin {
    interpreter: String,
}

impl ScriptPlugin {
    pub fn new(interpreter: impl Into<String>) -> Self {
        Self {
            interpreter: interpreter.into(),
        }
    }
}

#[async_trait]
impl TaskPlugin for ScriptPlugin {
    async fn execute(
        &self,
        task: &Task,
        ctx: &PluginContext,
    ) -> SwarmResult<HashMap<String, Value>> {
        let script = task
            .script
            .as_deref()
            .ok_or_else(|| SwarmError::validation("script", "script task requires a script"))?;

        let context_json = serde_json::to_string(&ctx.context)?;
        let prelude = format!(
            "import json\nCONTEXT = json.loads({})\nWORKFLOW_ID = {}\n",
            serde_json::to_string(&context_json)?,
            serde_json::to_string(&ctx.workflow_id)?,
        );

        let mut file = tempfile::Builder::new()
            .prefix("swarmguard-task-")
            .suffix(".py")
            .tempfile()
            .map_err(|e| SwarmError::Internal(format!("script staging failed: {e}")))?;
        {
            use std::io::Write;
            file.write_all(prelude.as_bytes())
                .and_then(|()| file.write_all(script.as_bytes()))
                .map_err(|e| SwarmError::Internal(format!("script staging failed: {e}")))?;
        }

        let child = Command::new(&self.interpreter)
            .arg(file.path())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                SwarmError::TaskFailed(format!("failed to spawn {}: {e}", self.interpreter))
            })?;

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| SwarmError::TaskFailed(format!("script wait failed: {e}")))?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        let stderr = String::from_utf8_lossy(&output.stderr).into_owned();

        if !output.status.success() {
            return Err(SwarmError::TaskFailed(format!(
                "script exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }

        // A JSON object on stdout becomes the output map; otherwise the raw
        // streams are returned.
        match serde_json::from_str::<Value>(stdout.trim()) {
            Ok(Value::Object(map)) => Ok(map.into_iter().collect()),
            _ => {
                let mut out = HashMap::new();
                out.insert("output".to_string(), Value::String(stdout));
                out.insert("stderr".to_string(), Value::String(stderr));
                Ok(out)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::TaskKind;
    use serde_json::json;

    fn ctx() -> PluginContext {
        let mut context = crate::services::condition::SharedContext::new();
        let mut prior = HashMap::new();
        prior.insert("count".to_string(), json!(5));
        context.insert("prior".to_string(), prior);
        PluginContext {
            workflow_id: "wf-9".into(),
            workflow_name: "pipe".into(),
            context,
        }
    }

    fn script_task(body: &str) -> Task {
        let mut task = Task::new("s", TaskKind::Script);
        task.script = Some(body.to_string());
        task
    }

    #[tokio::test]
    async fn test_missing_script_is_validation_error() {
        let plugin = ScriptPlugin::new("python3");
        let err = plugin
            .execute(&Task::new("s", TaskKind::Script), &ctx())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "validation");
    }

    #[tokio::test]
    async fn test_json_stdout_becomes_output() {
        let plugin = ScriptPlugin::new("python3");
        let task = script_task("print(json.dumps({'doubled': CONTEXT['prior']['count'] * 2}))");

        match plugin.execute(&task, &ctx()).await {
            Ok(out) => assert_eq!(out.get("doubled"), Some(&json!(10))),
            // Environments without a python interpreter surface a spawn
            // failure, which is the correct error path.
            Err(e) => assert_eq!(e.kind(), "task_failed"),
        }
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_failure() {
        let plugin = ScriptPlugin::new("python3");
        let task = script_task("import sys; sys.exit(3)");

        let err = plugin.execute(&task, &ctx()).await.unwrap_err();
        assert_eq!(err.kind(), "task_failed");
    }
}
