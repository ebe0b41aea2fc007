// JSON-RPC 2.0 over a subprocess's stdin/stdout, newline-delimited frames.
//
// The child is spawned lazily on first use and greeted with the standard
// capability handshake (an `initialize` request followed by the
// `notifications/initialized` notification) before any tool call. Calls are
// serialized per backend: the session mutex is held for the whole
// write-then-read exchange, so partial writes never interleave and responses
// are matched to the single in-flight request id. A child found dead is
// respawned transparently on the next call.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::{BackendError, BackendErrorKind};

const PROTOCOL_VERSION: &str = "2024-11-05";
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

pub struct StdioTransport {
    key: String,
    command: Vec<String>,
    env: HashMap<String, String>,
    cwd: Option<PathBuf>,
    session: Mutex<Option<StdioSession>>,
}

struct StdioSession {
    child: Child,
    stdin: ChildStdin,
    responses: mpsc::UnboundedReceiver<Value>,
    reader_task: JoinHandle<()>,
    stderr_task: Option<JoinHandle<()>>,
    next_id: u64,
}

impl StdioTransport {
    pub fn new(
        key: String,
        command: Vec<String>,
        env: HashMap<String, String>,
        cwd: Option<PathBuf>,
    ) -> Self {
        Self {
            key,
            command,
            env,
            cwd,
            session: Mutex::new(None),
        }
    }

    /// Eagerly spawn and handshake. Called from `start_all`; otherwise the
    /// first `call` does the same lazily.
    pub async fn start(&self) -> Result<(), BackendError> {
        let mut slot = self.session.lock().await;
        self.ensure_session(&mut slot, "initialize").await?;
        Ok(())
    }

    /// Send one JSON-RPC request and wait for its response. Holding the lock
    /// across the exchange serializes concurrent callers.
    pub async fn call(&self, method: &str, params: Value) -> Result<Value, BackendError> {
        let mut slot = self.session.lock().await;
        self.ensure_session(&mut slot, method).await?;
        let session = slot
            .as_mut()
            .ok_or_else(|| self.error(BackendErrorKind::Transport, method, "session not started"))?;

        match Self::exchange(&self.key, session, method, params).await {
            Ok(value) => Ok(value),
            Err(e) => {
                // The pipe state is unknown after an I/O failure; tear the
                // session down so a retry respawns from scratch.
                if e.kind == BackendErrorKind::Transport {
                    if let Some(dead) = slot.take() {
                        dead.dispose().await;
                    }
                }
                Err(e)
            }
        }
    }

    /// Drop the current session so the next call respawns. Used after a
    /// deadline expires with a response still owed.
    pub async fn reset(&self) {
        let mut slot = self.session.lock().await;
        if let Some(session) = slot.take() {
            session.dispose().await;
        }
    }

    /// Close stdin, give the child a bounded grace period, then kill it.
    pub async fn shutdown(&self) {
        let mut slot = self.session.lock().await;
        let Some(mut session) = slot.take() else {
            return;
        };
        drop(session.stdin);
        match tokio::time::timeout(SHUTDOWN_GRACE, session.child.wait()).await {
            Ok(Ok(status)) => debug!(backend = %self.key, %status, "Backend subprocess exited"),
            Ok(Err(e)) => warn!(backend = %self.key, "Failed to reap backend subprocess: {e}"),
            Err(_) => {
                warn!(backend = %self.key, "Backend subprocess ignored stdin close, killing");
                if let Err(e) = session.child.kill().await {
                    warn!(backend = %self.key, "Failed to kill backend subprocess: {e}");
                }
            }
        }
        session.reader_task.abort();
        if let Some(task) = session.stderr_task {
            task.abort();
        }
    }

    async fn ensure_session(
        &self,
        slot: &mut Option<StdioSession>,
        method: &str,
    ) -> Result<(), BackendError> {
        let respawn = match slot.as_mut() {
            None => true,
            Some(session) => match session.child.try_wait() {
                Ok(Some(status)) => {
                    warn!(backend = %self.key, %status, "Backend subprocess exited, respawning");
                    true
                }
                Ok(None) => false,
                Err(e) => {
                    warn!(backend = %self.key, "Failed to poll backend subprocess: {e}");
                    true
                }
            },
        };
        if respawn {
            if let Some(dead) = slot.take() {
                dead.dispose().await;
            }
            *slot = Some(self.spawn_session(method).await?);
        }
        Ok(())
    }

    async fn spawn_session(&self, method: &str) -> Result<StdioSession, BackendError> {
        let program = self.command.first().ok_or_else(|| {
            self.error(BackendErrorKind::Transport, method, "empty backend command")
        })?;

        let mut command = Command::new(program);
        command
            .args(&self.command[1..])
            .envs(&self.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &self.cwd {
            command.current_dir(cwd);
        }

        let mut child = command.spawn().map_err(|e| {
            self.error(
                BackendErrorKind::Transport,
                method,
                format!("failed to spawn '{program}': {e}"),
            )
        })?;

        let stdin = child.stdin.take().ok_or_else(|| {
            self.error(BackendErrorKind::Transport, method, "child stdin unavailable")
        })?;
        let stdout = child.stdout.take().ok_or_else(|| {
            self.error(BackendErrorKind::Transport, method, "child stdout unavailable")
        })?;

        let (tx, responses) = mpsc::unbounded_channel();
        let reader_key = self.key.clone();
        let reader_task = tokio::spawn(async move {
            let mut lines = BufReader::new(stdout).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<Value>(&line) {
                    Ok(frame) => {
                        if frame.get("id").is_some() {
                            if tx.send(frame).is_err() {
                                break;
                            }
                        } else {
                            debug!(backend = %reader_key, "Backend notification: {frame}");
                        }
                    }
                    Err(e) => {
                        warn!(backend = %reader_key, "Discarding unparseable backend frame: {e}")
                    }
                }
            }
        });

        let stderr_task = child.stderr.take().map(|stderr| {
            let stderr_key = self.key.clone();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    if !line.trim().is_empty() {
                        warn!(backend = %stderr_key, "stderr: {line}");
                    }
                }
            })
        });

        let mut session = StdioSession {
            child,
            stdin,
            responses,
            reader_task,
            stderr_task,
            next_id: 1,
        };

        // Capability handshake before the first tool call.
        Self::exchange(
            &self.key,
            &mut session,
            "initialize",
            json!({
                "protocolVersion": PROTOCOL_VERSION,
                "capabilities": {},
                "clientInfo": {
                    "name": "chaingate",
                    "version": env!("CARGO_PKG_VERSION"),
                },
            }),
        )
        .await
        .map_err(|e| {
            self.error(
                e.kind,
                method,
                format!("handshake failed: {}", e.message),
            )
        })?;
        Self::send_frame(
            &self.key,
            &mut session.stdin,
            &json!({
                "jsonrpc": "2.0",
                "method": "notifications/initialized",
            }),
            "notifications/initialized",
        )
        .await?;

        debug!(backend = %self.key, "Backend subprocess started and initialized");
        Ok(session)
    }

    async fn exchange(
        key: &str,
        session: &mut StdioSession,
        method: &str,
        params: Value,
    ) -> Result<Value, BackendError> {
        let id = session.next_id;
        session.next_id += 1;

        let request = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });
        Self::send_frame(key, &mut session.stdin, &request, method).await?;

        loop {
            let frame = session.responses.recv().await.ok_or_else(|| {
                BackendError::new(
                    BackendErrorKind::Transport,
                    key,
                    method,
                    "backend closed stdout before responding",
                )
            })?;
            let frame_id = frame.get("id").and_then(Value::as_u64);
            if frame_id != Some(id) {
                // Stale response from an earlier call that timed out.
                warn!(backend = %key, expected = id, got = ?frame_id, "Dropping mismatched response id");
                continue;
            }
            if let Some(error) = frame.get("error") {
                return Err(BackendError::new(
                    BackendErrorKind::Protocol,
                    key,
                    method,
                    error.to_string(),
                ));
            }
            return frame.get("result").cloned().ok_or_else(|| {
                BackendError::new(
                    BackendErrorKind::Protocol,
                    key,
                    method,
                    "response has neither result nor error",
                )
            });
        }
    }

    async fn send_frame(
        key: &str,
        stdin: &mut ChildStdin,
        frame: &Value,
        method: &str,
    ) -> Result<(), BackendError> {
        let mut line = serde_json::to_vec(frame).map_err(|e| {
            BackendError::new(BackendErrorKind::Protocol, key, method, e.to_string())
        })?;
        line.push(b'\n');
        stdin.write_all(&line).await.map_err(|e| {
            BackendError::new(
                BackendErrorKind::Transport,
                key,
                method,
                format!("write to backend failed: {e}"),
            )
        })?;
        stdin.flush().await.map_err(|e| {
            BackendError::new(
                BackendErrorKind::Transport,
                key,
                method,
                format!("flush to backend failed: {e}"),
            )
        })
    }

    fn error(
        &self,
        kind: BackendErrorKind,
        tool_name: &str,
        message: impl Into<String>,
    ) -> BackendError {
        BackendError::new(kind, &self.key, tool_name, message)
    }
}

impl StdioSession {
    async fn dispose(mut self) {
        self.reader_task.abort();
        if let Some(task) = self.stderr_task {
            task.abort();
        }
        if let Err(e) = self.child.kill().await {
            debug!("Failed to kill defunct backend subprocess: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    // A shell stand-in for a stdio backend: answers every request with a
    // fixed result, echoing the request id back.
    const ECHO_SERVER: &str = r#"#!/bin/sh
while IFS= read -r line; do
    id=$(printf '%s' "$line" | sed -n 's/.*"id":[[:space:]]*\([0-9][0-9]*\).*/\1/p')
    if [ -n "$id" ]; then
        printf '{"jsonrpc":"2.0","id":%s,"result":{"capabilities":{},"content":[{"type":"text","text":"{\"answer\":42}"}]}}\n' "$id"
    fi
done
"#;

    // Same, but the process dies after serving two requests (the handshake
    // plus one call).
    const FLAKY_SERVER: &str = r#"#!/bin/sh
served=0
while IFS= read -r line; do
    id=$(printf '%s' "$line" | sed -n 's/.*"id":[[:space:]]*\([0-9][0-9]*\).*/\1/p')
    if [ -n "$id" ]; then
        printf '{"jsonrpc":"2.0","id":%s,"result":{"ok":true}}\n' "$id"
        served=$((served + 1))
        [ "$served" -ge 2 ] && exit 0
    fi
done
"#;

    fn write_script(dir: &TempDir, name: &str, body: &str) -> PathBuf {
        let path = dir.path().join(name);
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(body.as_bytes()).unwrap();
        let mut perms = file.metadata().unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).unwrap();
        path
    }

    fn transport(script: &PathBuf) -> StdioTransport {
        StdioTransport::new(
            "test".to_string(),
            vec![script.display().to_string()],
            HashMap::new(),
            None,
        )
    }

    #[tokio::test]
    async fn handshakes_then_answers_calls() {
        let dir = TempDir::new().unwrap();
        let script = write_script(&dir, "echo_server.sh", ECHO_SERVER);
        let transport = transport(&script);

        let result = transport
            .call("tools/call", json!({"name": "ping", "arguments": {}}))
            .await
            .unwrap();
        assert!(result.get("content").is_some());

        transport.shutdown().await;
    }

    #[tokio::test]
    async fn respawns_after_child_exit() {
        let dir = TempDir::new().unwrap();
        let script = write_script(&dir, "flaky_server.sh", FLAKY_SERVER);
        let transport = transport(&script);

        // First call consumes the two responses the child will ever serve
        // (handshake + call), after which it exits.
        transport
            .call("tools/call", json!({"name": "ping", "arguments": {}}))
            .await
            .unwrap();
        // This call may race the exit either way: detected-dead (respawn,
        // success) or undetected (transport error, session torn down).
        let _ = transport
            .call("tools/call", json!({"name": "ping", "arguments": {}}))
            .await;

        // Give the child time to finish exiting so the next call observes a
        // dead session rather than racing it.
        tokio::time::sleep(Duration::from_millis(200)).await;

        // A later call always finds a healthy session again.
        let result = transport
            .call("tools/call", json!({"name": "ping", "arguments": {}}))
            .await
            .unwrap();
        assert_eq!(result.get("ok"), Some(&json!(true)));

        transport.shutdown().await;
    }

    #[tokio::test]
    async fn spawn_failure_is_transport_error() {
        let missing = PathBuf::from("/nonexistent/backend-binary");
        let transport = transport(&missing);
        let err = transport.call("tools/call", json!({})).await.unwrap_err();
        assert_eq!(err.kind, BackendErrorKind::Transport);
    }
}
