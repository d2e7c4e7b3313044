//! A persistent tmux pane per remote server process, used to preserve
//! working directory, environment, and shell history across commands.
//!
//! Commands are wrapped with unique markers so output can be reliably
//! extracted regardless of shell prompt format or embedded newlines. The
//! execution loop polls `capture-pane` with exponential backoff until the
//! end-marker (which embeds the exit code) appears, or a wall-clock budget
//! is exhausted.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use fleet_proto::FleetError;
use tokio::process::Command;
use tracing::{info, warn};
use uuid::Uuid;

const SESSION_NAME: &str = "fleet";
const POLL_INTERVAL_INITIAL: Duration = Duration::from_millis(150);
const POLL_INTERVAL_MAX: Duration = Duration::from_secs(1);
const POLL_TIMEOUT: Duration = Duration::from_secs(60);
const SCROLLBACK_LINES: &str = "-500";

pub struct TmuxSession {
    socket_path: PathBuf,
    running: bool,
}

/// Result of one command execution through the pane.
pub struct CaptureResult {
    pub output: String,
    pub exit_code: i32,
}

impl TmuxSession {
    pub fn new(socket_path: PathBuf) -> Self {
        Self {
            socket_path,
            running: false,
        }
    }

    fn tmux_command(&self, args: &[&str]) -> Command {
        let mut cmd = Command::new("tmux");
        cmd.arg("-S").arg(&self.socket_path);
        for arg in args {
            cmd.arg(arg);
        }
        cmd
    }

    async fn run(&self, args: &[&str]) -> std::io::Result<std::process::Output> {
        self.tmux_command(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
    }

    /// Creates the session on first use; idempotent. Cleans up a stale
    /// session bound to the same socket/name if one is still registered.
    pub async fn ensure_created(&mut self) -> Result<(), FleetError> {
        if self.running {
            return Ok(());
        }

        if let Some(parent) = self.socket_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| FleetError::resource(format!("failed to create {parent:?}: {e}")))?;
        }

        let has_session = self
            .run(&["has-session", "-t", SESSION_NAME])
            .await
            .map(|o| o.status.success())
            .unwrap_or(false);
        if has_session {
            let _ = self.run(&["kill-session", "-t", SESSION_NAME]).await;
            info!("cleaned up stale tmux session: {SESSION_NAME}");
        }

        let status = self
            .run(&["new-session", "-d", "-s", SESSION_NAME, "-n", "shell"])
            .await
            .map_err(|e| FleetError::resource(format!("failed to spawn tmux: {e}")))?;
        if !status.status.success() {
            return Err(FleetError::resource(format!(
                "tmux new-session failed: {}",
                String::from_utf8_lossy(&status.stderr)
            )));
        }
        self.running = true;
        info!(socket = ?self.socket_path, "created tmux session");

        if let Some(parent) = self.socket_path.parent() {
            if let Ok(pid_out) = self.run(&["display-message", "-p", "#{pid}"]).await {
                let pid = String::from_utf8_lossy(&pid_out.stdout).trim().to_string();
                if !pid.is_empty() {
                    let pid_path = parent.join("tmux.pid");
                    if let Err(e) = tokio::fs::write(&pid_path, &pid).await {
                        warn!("could not save tmux pid: {e}");
                    }
                }
            }
        }

        Ok(())
    }

    /// Sends `command` wrapped in markers, polls until the end marker
    /// appears or the timeout elapses.
    pub async fn send_and_capture(&self, command: &str) -> Result<CaptureResult, FleetError> {
        let marker_id = Uuid::new_v4().simple().to_string()[..12].to_string();
        let start_marker = format!("__FLEET_START_{marker_id}__");
        let end_marker = format!("__FLEET_END_{marker_id}__");

        let wrapped = format!(
            "echo {start_marker}; {command}; _fleet_ec=$?; echo; echo {end_marker}_${{_fleet_ec}}"
        );
        let escaped = wrapped.replace('\'', "'\\''");

        self.run(&["send-keys", "-t", SESSION_NAME, "-l", "--", &escaped])
            .await
            .map_err(|e| FleetError::operation(format!("tmux send-keys failed: {e}")))?;
        self.run(&["send-keys", "-t", SESSION_NAME, "Enter"])
            .await
            .map_err(|e| FleetError::operation(format!("tmux send-keys Enter failed: {e}")))?;

        let mut poll_interval = POLL_INTERVAL_INITIAL;
        let deadline = Instant::now() + POLL_TIMEOUT;
        let mut raw = String::new();

        loop {
            if Instant::now() >= deadline {
                warn!("capture timed out after {POLL_TIMEOUT:?} for marker {marker_id}");
                return Ok(CaptureResult {
                    output: extract_partial(&raw, &start_marker),
                    exit_code: -1,
                });
            }
            tokio::time::sleep(poll_interval).await;
            raw = self.capture_raw().await;
            if raw.contains(&end_marker) {
                break;
            }
            poll_interval = (poll_interval * 2).min(POLL_INTERVAL_MAX);
        }

        Ok(parse_markers(&raw, &start_marker, &end_marker))
    }

    async fn capture_raw(&self) -> String {
        match self
            .run(&["capture-pane", "-p", "-J", "-t", SESSION_NAME, "-S", SCROLLBACK_LINES])
            .await
        {
            Ok(out) if out.status.success() => String::from_utf8_lossy(&out.stdout).into_owned(),
            _ => String::new(),
        }
    }

    /// Best-effort graceful teardown: send `exit`+Enter, then force
    /// `kill-session` if the pane is still registered.
    pub async fn destroy(&mut self) {
        if !self.running {
            return;
        }
        let _ = tokio::time::timeout(
            Duration::from_secs(3),
            self.run(&["send-keys", "-t", SESSION_NAME, "exit", "Enter"]),
        )
        .await;
        tokio::time::sleep(Duration::from_millis(500)).await;

        let still_alive = self
            .run(&["has-session", "-t", SESSION_NAME])
            .await
            .map(|o| o.status.success())
            .unwrap_or(false);
        if still_alive {
            let _ = self.run(&["kill-session", "-t", SESSION_NAME]).await;
            info!("killed tmux session: {SESSION_NAME}");
        } else {
            info!("tmux session {SESSION_NAME} exited gracefully");
        }
        self.running = false;
    }
}

/// Extracts the exit code and output between `start_marker` and
/// `end_marker` in captured pane text, trimming leading/trailing blank
/// lines. Exposed for fixture-driven testing without a real tmux.
pub fn parse_markers(raw: &str, start_marker: &str, end_marker: &str) -> CaptureResult {
    let mut collecting = false;
    let mut output_lines: Vec<&str> = Vec::new();
    let mut exit_code = -1;

    for line in raw.split('\n') {
        if line.contains(start_marker) {
            collecting = true;
            continue;
        }
        if line.contains(end_marker) {
            let suffix = line.splitn(2, end_marker).nth(1).unwrap_or("");
            let digits = suffix.trim_start_matches('_');
            exit_code = digits.parse().unwrap_or(-1);
            break;
        }
        if collecting {
            output_lines.push(line);
        }
    }

    while output_lines.first().is_some_and(|l| l.trim().is_empty()) {
        output_lines.remove(0);
    }
    while output_lines.last().is_some_and(|l| l.trim().is_empty()) {
        output_lines.pop();
    }

    CaptureResult {
        output: output_lines.join("\n"),
        exit_code,
    }
}

/// Best-effort extraction when the end-marker never showed up (timeout).
pub fn extract_partial(raw: &str, start_marker: &str) -> String {
    match raw.find(start_marker) {
        None => {
            if raw.len() > 2000 {
                raw[raw.len() - 2000..].to_string()
            } else {
                raw.to_string()
            }
        }
        Some(idx) => {
            let after = &raw[idx + start_marker.len()..];
            after
                .trim()
                .split('\n')
                .take(200)
                .collect::<Vec<_>>()
                .join("\n")
        }
    }
}

#[allow(dead_code)]
pub fn socket_dir(socket_path: &Path) -> Option<&Path> {
    socket_path.parent()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_markers_extracts_output_and_exit_code() {
        let raw = "$ echo __FLEET_START_abc123456789__; echo hi; _fleet_ec=$?; echo; echo __FLEET_END_abc123456789___0\n__FLEET_START_abc123456789__\nhi\n\n__FLEET_END_abc123456789___0\n$ ";
        let result = parse_markers(raw, "__FLEET_START_abc123456789__", "__FLEET_END_abc123456789__");
        assert_eq!(result.output, "hi");
        assert_eq!(result.exit_code, 0);
    }

    #[test]
    fn parse_markers_handles_nonzero_exit_code() {
        let raw = "__FLEET_START_x__\nboom\n__FLEET_END_x___1\n";
        let result = parse_markers(raw, "__FLEET_START_x__", "__FLEET_END_x__");
        assert_eq!(result.output, "boom");
        assert_eq!(result.exit_code, 1);
    }

    #[test]
    fn parse_markers_trims_leading_and_trailing_blank_lines() {
        let raw = "__FLEET_START_x__\n\n\nline1\nline2\n\n__FLEET_END_x___0\n";
        let result = parse_markers(raw, "__FLEET_START_x__", "__FLEET_END_x__");
        assert_eq!(result.output, "line1\nline2");
    }

    #[test]
    fn parse_markers_no_trailing_newline_in_command_output_still_parses() {
        // The protocol inserts a blank `echo` before the end marker precisely
        // so this case always has the end marker on its own line.
        let raw = "__FLEET_START_x__\nno-newline-output\n\n__FLEET_END_x___0\n";
        let result = parse_markers(raw, "__FLEET_START_x__", "__FLEET_END_x__");
        assert_eq!(result.output, "no-newline-output");
        assert_eq!(result.exit_code, 0);
    }

    #[test]
    fn parse_markers_missing_end_marker_yields_negative_one_via_extract_partial() {
        let raw = "__FLEET_START_x__\npartial output only, no end marker\n";
        assert!(!raw.contains("__FLEET_END_x__"));
        let partial = extract_partial(raw, "__FLEET_START_x__");
        assert_eq!(partial, "partial output only, no end marker");
    }

    #[test]
    fn extract_partial_without_start_marker_falls_back_to_tail() {
        let raw = "a".repeat(3000);
        let partial = extract_partial(&raw, "__MISSING__");
        assert_eq!(partial.len(), 2000);
    }
}
