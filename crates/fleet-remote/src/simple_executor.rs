//! Stateless command execution used when `--no-tmux` is set: each command
//! runs in a fresh subshell with no retained working directory or
//! environment between invocations.

use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;

const EXEC_TIMEOUT: Duration = Duration::from_secs(120);

pub struct ExecResult {
    pub output: String,
    pub exit_code: i32,
}

pub async fn run(command: &str) -> ExecResult {
    let child = Command::new("sh")
        .arg("-c")
        .arg(command)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn();

    let mut child = match child {
        Ok(c) => c,
        Err(e) => {
            return ExecResult {
                output: format!("failed to spawn shell: {e}"),
                exit_code: -1,
            }
        }
    };

    match tokio::time::timeout(EXEC_TIMEOUT, child.wait_with_output()).await {
        Ok(Ok(output)) => {
            let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
            let stderr = String::from_utf8_lossy(&output.stderr);
            if !stderr.is_empty() {
                if !combined.is_empty() {
                    combined.push('\n');
                }
                combined.push_str(&stderr);
            }
            ExecResult {
                output: combined,
                exit_code: output.status.code().unwrap_or(-1),
            }
        }
        Ok(Err(e)) => ExecResult {
            output: format!("failed to collect output: {e}"),
            exit_code: -1,
        },
        Err(_) => ExecResult {
            output: format!("command timed out after {EXEC_TIMEOUT:?}"),
            exit_code: -1,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn run_captures_stdout_and_exit_code() {
        let result = run("echo hi").await;
        assert_eq!(result.output.trim(), "hi");
        assert_eq!(result.exit_code, 0);
    }

    #[tokio::test]
    async fn run_reports_nonzero_exit_code() {
        let result = run("exit 7").await;
        assert_eq!(result.exit_code, 7);
    }

    #[tokio::test]
    async fn run_merges_stderr_into_output() {
        let result = run("echo out; echo err 1>&2").await;
        assert!(result.output.contains("out"));
        assert!(result.output.contains("err"));
    }
}
