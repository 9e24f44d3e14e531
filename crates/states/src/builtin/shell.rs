//! Shell script state.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tokio::time::timeout;

use pipewright_engine::context::{ExecutionContext, SweepingOutputScope};
use pipewright_engine::graph::StateDefinition;
use pipewright_engine::instance::{ExecutionStatus, FailureType};
use pipewright_engine::state::{ExecutionResponse, State};
use pipewright_engine::EngineResult;

use crate::error::StateError;

/// Shell script configuration, read from the state's properties.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShellScriptConfig {
    /// Script body; `${...}` expressions are rendered before running.
    pub script: String,

    /// Shell to use (default: "sh").
    #[serde(default = "default_shell")]
    pub shell: String,

    /// Working directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,

    /// Environment variables; values are rendered like the script.
    #[serde(default)]
    pub env: HashMap<String, String>,

    /// Timeout in seconds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_seconds: Option<u64>,

    /// Publish trimmed stdout as a sweeping output under this name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_name: Option<String>,

    /// Scope of the published output (default: PIPELINE).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output_scope: Option<SweepingOutputScope>,
}

fn default_shell() -> String {
    "sh".to_string()
}

impl ShellScriptConfig {
    pub fn from_definition(definition: &StateDefinition) -> Result<Self, StateError> {
        let config: Self = serde_json::from_value(serde_json::Value::Object(definition.properties.clone()))
            .map_err(|e| StateError::Configuration(format!("Invalid shell_script config for '{}': {}", definition.name, e)))?;
        if config.script.trim().is_empty() {
            return Err(StateError::Configuration(format!(
                "shell_script '{}' has an empty script",
                definition.name
            )));
        }
        Ok(config)
    }
}

/// Captured result of one script run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    pub duration_ms: u64,
}

impl ScriptOutput {
    pub fn is_success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Run `command` with `shell -c`, capturing stdout and stderr.
pub async fn run_script(
    command: &str,
    shell: &str,
    cwd: Option<&str>,
    env: &HashMap<String, String>,
    timeout_duration: Option<Duration>,
) -> Result<ScriptOutput, StateError> {
    let start = Instant::now();

    let mut cmd = Command::new(shell);
    cmd.arg("-c").arg(command);
    if let Some(dir) = cwd {
        cmd.current_dir(dir);
    }
    for (k, v) in env {
        cmd.env(k, v);
    }
    cmd.stdout(std::process::Stdio::piped());
    cmd.stderr(std::process::Stdio::piped());
    cmd.kill_on_drop(true);

    let mut child = cmd
        .spawn()
        .map_err(|e| StateError::Process(format!("Failed to spawn process: {}", e)))?;

    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    let stdout_handle = tokio::spawn(async move {
        let mut output = String::new();
        if let Some(stdout) = stdout {
            let mut reader = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = reader.next_line().await {
                output.push_str(&line);
                output.push('\n');
            }
        }
        output
    });
    let stderr_handle = tokio::spawn(async move {
        let mut output = String::new();
        if let Some(stderr) = stderr {
            let mut reader = BufReader::new(stderr).lines();
            while let Ok(Some(line)) = reader.next_line().await {
                output.push_str(&line);
                output.push('\n');
            }
        }
        output
    });

    let wait_result = match timeout_duration {
        Some(duration) => match timeout(duration, child.wait()).await {
            Ok(result) => result,
            Err(_) => {
                if let Err(e) = child.kill().await {
                    tracing::warn!(error = %e, "Failed to kill timed out script");
                }
                return Err(StateError::Timeout(duration.as_secs()));
            }
        },
        None => child.wait().await,
    };

    let status = wait_result.map_err(|e| StateError::Process(format!("Failed to wait for process: {}", e)))?;

    Ok(ScriptOutput {
        exit_code: status.code().unwrap_or(-1),
        stdout: stdout_handle.await.unwrap_or_default(),
        stderr: stderr_handle.await.unwrap_or_default(),
        duration_ms: start.elapsed().as_millis() as u64,
    })
}

/// Runs a rendered shell script on the engine host.
///
/// The script is rendered twice: secured for the audit log, plain for the
/// process. A non-zero exit fails the state with an application error.
pub struct ShellScriptState {
    config: ShellScriptConfig,
}

impl ShellScriptState {
    pub fn new(config: ShellScriptConfig) -> Self {
        Self { config }
    }

    pub fn from_definition(definition: &StateDefinition) -> Result<Self, StateError> {
        Ok(Self::new(ShellScriptConfig::from_definition(definition)?))
    }

    fn render_env(&self, context: &mut ExecutionContext) -> EngineResult<HashMap<String, String>> {
        let mut env = HashMap::with_capacity(self.config.env.len());
        for (k, v) in &self.config.env {
            env.insert(k.clone(), context.render_expression(v)?);
        }
        Ok(env)
    }
}

#[async_trait]
impl State for ShellScriptState {
    fn state_type(&self) -> &str {
        "shell_script"
    }

    async fn execute(&self, context: &mut ExecutionContext) -> EngineResult<ExecutionResponse> {
        let audit = context.render_expression_secured(&self.config.script)?;
        let script = context.render_expression(&self.config.script)?;
        let env = self.render_env(context)?;
        let timeout_duration = self.config.timeout_seconds.map(Duration::from_secs);

        tracing::info!(
            execution_uuid = %context.execution_uuid(),
            state = %context.state_name(),
            shell = %self.config.shell,
            cwd = ?self.config.cwd,
            timeout = ?timeout_duration,
            script = %audit,
            "Executing shell script"
        );

        let output = match run_script(&script, &self.config.shell, self.config.cwd.as_deref(), &env, timeout_duration).await {
            Ok(output) => output,
            Err(StateError::Timeout(secs)) => {
                return Ok(ExecutionResponse::with_status(ExecutionStatus::Failed)
                    .error_message(format!("Script timed out after {} seconds", secs))
                    .failure_type(FailureType::Timeout));
            }
            Err(e) => return Ok(ExecutionResponse::failed(e.to_string())),
        };

        let data = json!({
            "exitCode": output.exit_code,
            "stdout": output.stdout,
            "stderr": output.stderr,
            "durationMs": output.duration_ms,
        });

        if !output.is_success() {
            tracing::warn!(
                state = %context.state_name(),
                exit_code = output.exit_code,
                "Shell script failed"
            );
            return Ok(ExecutionResponse::failed(format!("Script exited with code {}", output.exit_code))
                .state_execution_data(data));
        }

        if let Some(name) = &self.config.output_name {
            let builder = context
                .prepare_sweeping_output_builder(self.config.output_scope)?
                .name(name.clone())
                .value(json!(output.stdout.trim()));
            let published = context.publish_sweeping_output(builder).await?;
            tracing::debug!(
                name = %published.name,
                scope = %published.scope,
                "Script output published"
            );
        }

        Ok(ExecutionResponse::success().state_execution_data(data))
    }
}
