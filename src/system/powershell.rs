// PowerShell and route.exe invocation with timeouts

use serde::de::DeserializeOwned;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

use crate::error::{AppError, AppResult};

#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x08000000;

#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    /// stderr when present, otherwise stdout (route.exe reports errors on stdout)
    pub fn error_text(&self) -> &str {
        if self.stderr.is_empty() {
            &self.stdout
        } else {
            &self.stderr
        }
    }
}

/// Run a program to completion, killing it if it outlives `timeout`.
pub async fn run_command(program: &str, args: &[String], timeout: Duration) -> AppResult<CommandOutput> {
    let command_line = format!("{} {}", program, args.join(" "));
    tracing::debug!("Executing: {}", command_line);

    let mut command = Command::new(program);
    command.args(args).stdin(Stdio::null()).kill_on_drop(true);
    #[cfg(windows)]
    command.creation_flags(CREATE_NO_WINDOW);

    let output = match tokio::time::timeout(timeout, command.output()).await {
        Ok(result) => result
            .map_err(|e| AppError::CommandExecution(format!("{}: {}", program, e)))?,
        Err(_) => {
            tracing::error!("Command timed out after {:?}: {}", timeout, command_line);
            return Err(AppError::CommandTimeout {
                command: command_line,
                seconds: timeout.as_secs(),
            });
        }
    };

    let result = CommandOutput {
        success: output.status.success(),
        stdout: String::from_utf8_lossy(&output.stdout).trim().to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
    };

    if !result.success {
        tracing::error!("Command failed: {}", command_line);
        tracing::error!("Error output: {}", result.error_text());
    }

    Ok(result)
}

pub async fn run_powershell(command: &str, timeout: Duration) -> AppResult<CommandOutput> {
    let args = [
        "-NoProfile".to_string(),
        "-NonInteractive".to_string(),
        "-Command".to_string(),
        command.to_string(),
    ];
    run_command("powershell", &args, timeout).await
}

/// Run a PowerShell pipeline ending in `ConvertTo-Json` and decode its rows.
pub async fn run_powershell_json<T: DeserializeOwned>(
    command: &str,
    timeout: Duration,
) -> AppResult<Vec<T>> {
    let output = run_powershell(command, timeout).await?;
    if !output.success {
        return Err(AppError::CommandExecution(output.error_text().to_string()));
    }
    parse_json_rows(&output.stdout)
}

pub async fn run_route_cmd(args: &[String], timeout: Duration) -> AppResult<CommandOutput> {
    run_command("route", args, timeout).await
}

/// `ConvertTo-Json` emits a bare object for one row and nothing at all for zero rows.
pub fn parse_json_rows<T: DeserializeOwned>(stdout: &str) -> AppResult<Vec<T>> {
    let text = stdout.trim().trim_start_matches('\u{feff}');
    if text.is_empty() {
        return Ok(Vec::new());
    }

    let value: serde_json::Value = serde_json::from_str(text)
        .map_err(|e| AppError::OutputParse(format!("invalid JSON: {}", e)))?;

    let rows = match value {
        serde_json::Value::Null => Vec::new(),
        serde_json::Value::Array(items) => items,
        obj @ serde_json::Value::Object(_) => vec![obj],
        other => {
            return Err(AppError::OutputParse(format!(
                "expected object or array, got {}",
                other
            )));
        }
    };

    rows.into_iter()
        .map(|row| {
            serde_json::from_value(row)
                .map_err(|e| AppError::OutputParse(format!("unexpected row shape: {}", e)))
        })
        .collect()
}
