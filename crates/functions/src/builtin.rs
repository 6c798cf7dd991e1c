//! Built-in functions (echo, fail, sleep) and external command functions.

use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use super::r#trait::{FunctionError, TargetFunction};

/// Returns its input unchanged.
pub struct EchoFunction;

#[async_trait]
impl TargetFunction for EchoFunction {
    fn name(&self) -> &str {
        "echo"
    }

    fn description(&self) -> &str {
        "Return the payload unchanged"
    }

    async fn call(&self, payload: Value) -> Result<Value, FunctionError> {
        Ok(payload)
    }
}

/// Always fails with `triggered failure`.
pub struct FailFunction;

#[async_trait]
impl TargetFunction for FailFunction {
    fn name(&self) -> &str {
        "fail"
    }

    fn description(&self) -> &str {
        "Fail with a fixed message"
    }

    async fn call(&self, _payload: Value) -> Result<Value, FunctionError> {
        Err(FunctionError::new("triggered failure"))
    }
}

/// Sleeps for `{"millis": n}` then echoes the payload.
pub struct SleepFunction;

#[async_trait]
impl TargetFunction for SleepFunction {
    fn name(&self) -> &str {
        "sleep"
    }

    fn description(&self) -> &str {
        "Sleep for payload.millis milliseconds, then return the payload"
    }

    async fn call(&self, payload: Value) -> Result<Value, FunctionError> {
        let millis = payload
            .get("millis")
            .and_then(Value::as_u64)
            .ok_or_else(|| FunctionError::new("payload.millis must be a non-negative integer"))?;
        tokio::time::sleep(Duration::from_millis(millis)).await;
        Ok(payload)
    }
}

/// Runs an external program with the payload on stdin.
///
/// A zero exit status returns stdout parsed as JSON (empty stdout is `null`).
/// Any other exit fails with the program's stderr.
pub struct CommandFunction {
    name: String,
    description: String,
    program: String,
    args: Vec<String>,
}

impl CommandFunction {
    /// Create a command-backed function.
    pub fn new(name: impl Into<String>, program: impl Into<String>, args: Vec<String>) -> Self {
        let program = program.into();
        Self {
            name: name.into(),
            description: format!("Run {}", program),
            program,
            args,
        }
    }
}

#[async_trait]
impl TargetFunction for CommandFunction {
    fn name(&self) -> &str {
        &self.name
    }

    fn description(&self) -> &str {
        &self.description
    }

    async fn call(&self, payload: Value) -> Result<Value, FunctionError> {
        let input = serde_json::to_vec(&payload)
            .map_err(|e| FunctionError::new(format!("Unable to encode payload: {}", e)))?;

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| FunctionError::new(format!("Unable to start {}: {}", self.program, e)))?;

        // Stdin is fed while stdout is drained.
        let stdin = child.stdin.take();
        let feed = async move {
            if let Some(mut stdin) = stdin {
                stdin.write_all(&input).await?;
            }
            Ok::<(), std::io::Error>(())
        };
        let (fed, output) = tokio::join!(feed, child.wait_with_output());

        let output =
            output.map_err(|e| FunctionError::new(format!("{} failed: {}", self.program, e)))?;
        if let Err(e) = fed {
            // A child may exit without reading its input.
            if e.kind() != std::io::ErrorKind::BrokenPipe {
                return Err(FunctionError::new(format!("Unable to write payload: {}", e)));
            }
        }

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(FunctionError::new(if stderr.is_empty() {
                format!("{} exited with {}", self.program, output.status)
            } else {
                stderr
            }));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        if stdout.trim().is_empty() {
            return Ok(Value::Null);
        }
        serde_json::from_str(stdout.trim())
            .map_err(|e| FunctionError::new(format!("{} returned invalid JSON: {}", self.program, e)))
    }
}
