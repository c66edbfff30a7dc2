//! Shell task plugin with a command allow-list.

use std::collections::HashMap;
use std::process::Stdio;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::process::Command;

use crate::domain::errors::{SwarmError, SwarmResult};
use crate::domain::models::Task;

use super::{PluginContext, TaskPlugin};

/// Executes `shell` tasks. The command's program must appear on the
/// allow-list; everything else is rejected before any process is spawned.
/// Arguments are split on whitespace, never passed through a shell.
pub struct ShellPlugin {
    allow_list: Vec<String>,
}

impl ShellPlugin {
    pub fn new(allow_list: Vec<String>) -> Self {
        Self { allow_list }
    }

    pub fn default_allow_list() -> Vec<String> {
        ["echo", "true", "date", "uname", "cat", "ls"]
            .into_iter()
            .map(String::from)
            .collect()
    }
}

#[async_trait]
impl TaskPlugin for ShellPlugin {
    async fn execute(
        &self,
        task: &Task,
        ctx: &PluginContext,
    ) -> SwarmResult<HashMap<String, Value>> {
        let command = task
            .command
            .as_deref()
            .ok_or_else(|| SwarmError::validation("command", "shell task requires a command"))?;
        let command = ctx.resolve(command);

        let mut parts = command.split_whitespace();
        let program = parts
            .next()
            .ok_or_else(|| SwarmError::validation("command", "shell command is empty"))?;

        if !self.allow_list.iter().any(|allowed| allowed == program) {
            return Err(SwarmError::validation(
                "command",
                format!("command '{program}' is not on the allow-list"),
            ));
        }

        let output = Command::new(program)
            .args(parts)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| SwarmError::TaskFailed(format!("failed to run {program}: {e}")))?;

        let mut out = HashMap::new();
        out.insert(
            "stdout".to_string(),
            Value::String(String::from_utf8_lossy(&output.stdout).into_owned()),
        );
        out.insert(
            "stderr".to_string(),
            Value::String(String::from_utf8_lossy(&output.stderr).into_owned()),
        );
        out.insert(
            "exit_code".to_string(),
            json!(output.status.code().unwrap_or(-1)),
        );

        if !output.status.success() {
            return Err(SwarmError::TaskFailed(format!(
                "command '{program}' exited with {}",
                output.status
            )));
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::TaskKind;

    fn shell_task(command: &str) -> Task {
        let mut task = Task::new("sh", TaskKind::Shell);
        task.command = Some(command.to_string());
        task
    }

    #[tokio::test]
    async fn test_allow_listed_command_runs() {
        let plugin = ShellPlugin::new(ShellPlugin::default_allow_list());
        let out = plugin
            .execute(&shell_task("echo hello"), &PluginContext::default())
            .await
            .unwrap();
        assert_eq!(out.get("exit_code"), Some(&json!(0)));
        assert!(out
            .get("stdout")
            .and_then(Value::as_str)
            .unwrap()
            .contains("hello"));
    }

    #[tokio::test]
    async fn test_unlisted_command_rejected_without_spawn() {
        let plugin = ShellPlugin::new(ShellPlugin::default_allow_list());
        let err = plugin
            .execute(&shell_task("rm -rf /tmp/x"), &PluginContext::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "validation");
    }

    #[tokio::test]
    async fn test_empty_command_rejected() {
        let plugin = ShellPlugin::new(ShellPlugin::default_allow_list());
        let err = plugin
            .execute(&shell_task("   "), &PluginContext::default())
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "validation");
    }
}
