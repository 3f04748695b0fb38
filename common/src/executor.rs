// Shell command execution for tasks declared in configuration

use crate::errors::TaskError;
use crate::task::Task;
use async_trait::async_trait;
use tracing::{debug, instrument};

/// A task that runs a shell command line and succeeds when the command
/// exits zero.
pub struct CommandTask {
    name: String,
    command: String,
}

impl CommandTask {
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
        }
    }

    pub fn command(&self) -> &str {
        &self.command
    }
}

#[async_trait]
impl Task for CommandTask {
    fn name(&self) -> &str {
        &self.name
    }

    #[instrument(skip(self), fields(task = %self.name, command = %self.command))]
    async fn execute(&self) -> Result<(), TaskError> {
        debug!("spawning command");
        let output = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .output()
            .await?;

        if output.status.success() {
            Ok(())
        } else {
            Err(TaskError::CommandFailed {
                command: self.command.clone(),
                code: output.status.code(),
                stderr: String::from_utf8_lossy(&output.stderr).trim_end().to_string(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_zero_exit_succeeds() {
        let task = CommandTask::new("noop", "true");
        assert_eq!(task.name(), "noop");
        assert!(task.execute().await.is_ok());
    }

    #[tokio::test]
    async fn test_nonzero_exit_reports_code_and_stderr() {
        let task = CommandTask::new("broken", "echo oh no >&2; exit 3");
        let err = task.execute().await.unwrap_err();
        match err {
            TaskError::CommandFailed {
                command,
                code,
                stderr,
            } => {
                assert_eq!(command, "echo oh no >&2; exit 3");
                assert_eq!(code, Some(3));
                assert_eq!(stderr, "oh no");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_shell_pipelines_are_supported() {
        let task = CommandTask::new("pipeline", "printf 'a\\nb\\n' | grep -q b");
        assert!(task.execute().await.is_ok());
    }
}
