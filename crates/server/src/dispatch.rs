#![forbid(unsafe_code)]

//! Fold-agent invocation.
//!
//! The agent is an opaque subprocess: it receives the prompt as its final
//! argument, communicates only by editing living docs, and is trusted to
//! terminate. Engram blocks on its exit; there is no in-process timeout.

use std::path::Path;
use std::process::Command;
use tracing::error;

use crate::error::ServerError;
use engram_core::Config;

/// Shell out to the configured fold agent with `prompt` appended as the final
/// argument. Non-zero exit or spawn failure is an `Agent` error; the caller
/// treats it like a validation failure (retryable).
pub fn invoke_agent(config: &Config, project_root: &Path, prompt: &str) -> Result<(), ServerError> {
    let argv = config.agent_argv();
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| ServerError::Agent("empty agent command".to_string()))?;

    let output = Command::new(program)
        .args(args)
        .arg(prompt)
        .current_dir(project_root)
        .output()
        .map_err(|err| {
            error!(%program, %err, "could not spawn fold agent");
            ServerError::Agent(format!("could not run {program}: {err}"))
        })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let stderr_head: String = stderr.chars().take(500).collect();
        error!(
            code = output.status.code().unwrap_or(-1),
            "fold agent exited non-zero"
        );
        return Err(ServerError::Agent(format!(
            "exited with {}: {}",
            output.status,
            stderr_head.trim()
        )));
    }
    Ok(())
}
