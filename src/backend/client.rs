// A single named backend: descriptor metadata plus the transport that
// carries its calls. Invocations get a per-client deadline and one retry on
// transient failure.

use std::time::Duration;

use serde_json::{json, Value};
use tracing::warn;

use crate::config::{BackendDescriptor, BackendProtocol};

use super::http::HttpTransport;
use super::stdio::StdioTransport;
use super::{BackendError, BackendErrorKind};

enum Transport {
    Stdio(StdioTransport),
    Http(HttpTransport),
}

pub struct BackendClient {
    key: String,
    protocol: BackendProtocol,
    timeout: Duration,
    transport: Transport,
}

impl BackendClient {
    pub fn new(
        descriptor: &BackendDescriptor,
        http_client: &reqwest::Client,
        timeout: Duration,
    ) -> Self {
        let transport = match descriptor.protocol {
            BackendProtocol::StdioRpc => Transport::Stdio(StdioTransport::new(
                descriptor.key.clone(),
                descriptor.command.clone(),
                descriptor.env.clone(),
                descriptor.cwd.clone(),
            )),
            BackendProtocol::HttpRpc => Transport::Http(HttpTransport::new(
                descriptor.key.clone(),
                descriptor.base_url.clone().unwrap_or_default(),
                http_client.clone(),
            )),
        };
        Self {
            key: descriptor.key.clone(),
            protocol: descriptor.protocol,
            timeout,
            transport,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn protocol(&self) -> BackendProtocol {
        self.protocol
    }

    /// Invoke a named tool. Timeouts and transport failures are retried
    /// exactly once; protocol errors are returned as-is.
    pub async fn invoke(&self, tool: &str, args: Value) -> Result<Value, BackendError> {
        match self.invoke_once(tool, args.clone()).await {
            Err(e) if e.is_transient() => {
                warn!(backend = %self.key, tool, "Retrying after transient failure: {e}");
                self.invoke_once(tool, args).await
            }
            other => other,
        }
    }

    async fn invoke_once(&self, tool: &str, args: Value) -> Result<Value, BackendError> {
        let call = async {
            match &self.transport {
                Transport::Stdio(stdio) => {
                    let result = stdio
                        .call("tools/call", json!({"name": tool, "arguments": args}))
                        .await?;
                    unwrap_tool_result(&self.key, tool, result)
                }
                Transport::Http(http) => http.call(tool, args).await,
            }
        };
        match tokio::time::timeout(self.timeout, call).await {
            Ok(result) => result,
            Err(_) => {
                // A late response for this id would otherwise confuse the
                // next exchange; start the stdio session over.
                if let Transport::Stdio(stdio) = &self.transport {
                    stdio.reset().await;
                }
                Err(BackendError::new(
                    BackendErrorKind::Timeout,
                    &self.key,
                    tool,
                    format!("no response within {:?}", self.timeout),
                ))
            }
        }
    }

    /// Eagerly start a stdio subprocess. No-op for HTTP backends.
    pub async fn start(&self) -> Result<(), BackendError> {
        match &self.transport {
            Transport::Stdio(stdio) => stdio.start().await,
            Transport::Http(_) => Ok(()),
        }
    }

    pub async fn shutdown(&self) {
        if let Transport::Stdio(stdio) = &self.transport {
            stdio.shutdown().await;
        }
    }
}

/// Unwrap the tool-call result envelope: `content: [{type: "text", text}]`
/// carrying JSON (or a bare string), with a `toolResult` fallback.
/// `isError: true` means the tool itself failed.
fn unwrap_tool_result(key: &str, tool: &str, result: Value) -> Result<Value, BackendError> {
    if result
        .get("isError")
        .and_then(Value::as_bool)
        .unwrap_or(false)
    {
        let message = first_text(&result).unwrap_or_else(|| result.to_string());
        return Err(BackendError::new(
            BackendErrorKind::Protocol,
            key,
            tool,
            message,
        ));
    }

    if let Some(text) = first_text(&result) {
        return Ok(serde_json::from_str(&text).unwrap_or(Value::String(text)));
    }
    if let Some(tool_result) = result.get("toolResult") {
        return Ok(tool_result.clone());
    }
    Ok(result)
}

fn first_text(result: &Value) -> Option<String> {
    result
        .get("content")?
        .as_array()?
        .iter()
        .find(|item| item.get("type").and_then(Value::as_str) == Some("text"))
        .and_then(|item| item.get("text"))
        .and_then(Value::as_str)
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackendKind;
    use std::collections::HashMap;
    use std::io::Write as _;
    use std::os::unix::fs::PermissionsExt;
    use std::path::Path;
    use tempfile::TempDir;

    // First incarnation answers the handshake and exits before the tool
    // call; later incarnations behave normally.
    const RECOVERING_SERVER: &str = r#"#!/bin/sh
if [ ! -f "$STATE_DIR/first_run" ]; then
    : > "$STATE_DIR/first_run"
    IFS= read -r line
    id=$(printf '%s' "$line" | sed -n 's/.*"id":[[:space:]]*\([0-9][0-9]*\).*/\1/p')
    [ -n "$id" ] && printf '{"jsonrpc":"2.0","id":%s,"result":{"capabilities":{}}}\n' "$id"
    exit 0
fi
while IFS= read -r line; do
    id=$(printf '%s' "$line" | sed -n 's/.*"id":[[:space:]]*\([0-9][0-9]*\).*/\1/p')
    [ -n "$id" ] && printf '{"jsonrpc":"2.0","id":%s,"result":{"content":[{"type":"text","text":"{\"healed\":true}"}]}}\n' "$id"
done
"#;

    // Answers the handshake, then fails every tool call with isError.
    // Writes the running request count to a file before each response.
    const FAULTY_TOOL_SERVER: &str = r#"#!/bin/sh
count=0
while IFS= read -r line; do
    id=$(printf '%s' "$line" | sed -n 's/.*"id":[[:space:]]*\([0-9][0-9]*\).*/\1/p')
    [ -z "$id" ] && continue
    count=$((count + 1))
    printf '%s\n' "$count" > "$STATE_DIR/requests"
    if [ "$count" -eq 1 ]; then
        printf '{"jsonrpc":"2.0","id":%s,"result":{"capabilities":{}}}\n' "$id"
    else
        printf '{"jsonrpc":"2.0","id":%s,"result":{"isError":true,"content":[{"type":"text","text":"tool exploded"}]}}\n' "$id"
    fi
done
"#;

    // Answers the handshake, then goes mute.
    const MUTE_SERVER: &str = r#"#!/bin/sh
IFS= read -r line
id=$(printf '%s' "$line" | sed -n 's/.*"id":[[:space:]]*\([0-9][0-9]*\).*/\1/p')
[ -n "$id" ] && printf '{"jsonrpc":"2.0","id":%s,"result":{"capabilities":{}}}\n' "$id"
while IFS= read -r line; do :; done
"#;

    fn write_script(dir: &TempDir, name: &str, body: &str) -> std::path::PathBuf {
        let path = dir.path().join(name);
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(body.as_bytes()).unwrap();
        let mut perms = file.metadata().unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&path, perms).unwrap();
        path
    }

    fn stdio_client(dir: &TempDir, script: &Path, timeout: Duration) -> BackendClient {
        let mut env = HashMap::new();
        env.insert("STATE_DIR".to_string(), dir.path().display().to_string());
        let descriptor = BackendDescriptor {
            key: "scripted".to_string(),
            kind: BackendKind::Evm,
            protocol: BackendProtocol::StdioRpc,
            command: vec![script.display().to_string()],
            base_url: None,
            network: None,
            env,
            cwd: None,
        };
        BackendClient::new(&descriptor, &reqwest::Client::new(), timeout)
    }

    #[tokio::test]
    async fn transient_failure_is_healed_by_the_single_retry() {
        let dir = TempDir::new().unwrap();
        let script = write_script(&dir, "recovering.sh", RECOVERING_SERVER);
        let client = stdio_client(&dir, &script, Duration::from_secs(5));

        // First attempt loses its child mid-call; the one retry respawns
        // and completes without a caller-visible error.
        let result = client.invoke("ping", json!({})).await.unwrap();
        assert_eq!(result["healed"], json!(true));

        client.shutdown().await;
    }

    #[tokio::test]
    async fn protocol_error_surfaces_without_a_second_attempt() {
        let dir = TempDir::new().unwrap();
        let script = write_script(&dir, "faulty.sh", FAULTY_TOOL_SERVER);
        let client = stdio_client(&dir, &script, Duration::from_secs(5));

        let err = client.invoke("ping", json!({})).await.unwrap_err();
        assert_eq!(err.kind, BackendErrorKind::Protocol);
        assert_eq!(err.message, "tool exploded");

        // Handshake plus exactly one tool call: no retry happened.
        let served = std::fs::read_to_string(dir.path().join("requests")).unwrap();
        assert_eq!(served.trim(), "2");

        client.shutdown().await;
    }

    #[tokio::test]
    async fn unanswered_call_maps_to_timeout() {
        let dir = TempDir::new().unwrap();
        let script = write_script(&dir, "mute.sh", MUTE_SERVER);
        let client = stdio_client(&dir, &script, Duration::from_millis(500));

        let err = client.invoke("ping", json!({})).await.unwrap_err();
        assert_eq!(err.kind, BackendErrorKind::Timeout);

        client.shutdown().await;
    }

    #[test]
    fn unwraps_json_text_content() {
        let result = json!({
            "content": [{"type": "text", "text": "{\"baseFeePerGas\": \"0x3b9aca00\"}"}]
        });
        let value = unwrap_tool_result("dex", "get_latest_block", result).unwrap();
        assert_eq!(value["baseFeePerGas"], "0x3b9aca00");
    }

    #[test]
    fn plain_text_content_stays_a_string() {
        let result = json!({"content": [{"type": "text", "text": "pong"}]});
        let value = unwrap_tool_result("dex", "ping", result).unwrap();
        assert_eq!(value, json!("pong"));
    }

    #[test]
    fn tool_result_fallback() {
        let result = json!({"toolResult": {"pairs": []}});
        let value = unwrap_tool_result("dex", "get_pairs_by_token", result).unwrap();
        assert_eq!(value, json!({"pairs": []}));
    }

    #[test]
    fn is_error_maps_to_protocol() {
        let result = json!({
            "isError": true,
            "content": [{"type": "text", "text": "unknown network"}]
        });
        let err = unwrap_tool_result("evm", "get_latest_block", result).unwrap_err();
        assert_eq!(err.kind, BackendErrorKind::Protocol);
        assert_eq!(err.message, "unknown network");
    }
}
