// JSON-RPC 2.0 over HTTP POST. One request per invoke; connection pooling is
// the client's job.

use std::sync::atomic::{AtomicU64, Ordering};

use serde_json::{json, Value};

use super::{BackendError, BackendErrorKind};

pub struct HttpTransport {
    key: String,
    base_url: String,
    client: reqwest::Client,
    next_id: AtomicU64,
}

impl HttpTransport {
    pub fn new(key: String, base_url: String, client: reqwest::Client) -> Self {
        Self {
            key,
            base_url,
            client,
            next_id: AtomicU64::new(1),
        }
    }

    pub async fn call(&self, method: &str, params: Value) -> Result<Value, BackendError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let request = json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": method,
            "params": params,
        });

        let response = self
            .client
            .post(&self.base_url)
            .json(&request)
            .send()
            .await
            .map_err(|e| self.transport_error(method, format!("request failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            return Err(self.transport_error(method, format!("HTTP status {status}")));
        }

        let body: Value = response
            .json()
            .await
            .map_err(|e| self.transport_error(method, format!("invalid JSON body: {e}")))?;

        if let Some(error) = body.get("error") {
            return Err(BackendError::new(
                BackendErrorKind::Protocol,
                &self.key,
                method,
                error.to_string(),
            ));
        }
        body.get("result").cloned().ok_or_else(|| {
            BackendError::new(
                BackendErrorKind::Protocol,
                &self.key,
                method,
                "response has neither result nor error",
            )
        })
    }

    fn transport_error(&self, method: &str, message: String) -> BackendError {
        BackendError::new(BackendErrorKind::Transport, &self.key, method, message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    // Minimal one-shot HTTP responder so the transport is exercised without
    // a real node.
    async fn serve_once(body: &'static str) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = vec![0u8; 4096];
            let _ = socket.read(&mut buf).await.unwrap();
            let response = format!(
                "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                body.len(),
                body
            );
            socket.write_all(response.as_bytes()).await.unwrap();
        });
        format!("http://{addr}")
    }

    #[tokio::test]
    async fn unwraps_result_member() {
        let url = serve_once(r#"{"jsonrpc":"2.0","id":1,"result":"0x3b9aca00"}"#).await;
        let transport = HttpTransport::new("node".to_string(), url, reqwest::Client::new());
        let result = transport.call("eth_gasPrice", json!([])).await.unwrap();
        assert_eq!(result, json!("0x3b9aca00"));
    }

    #[tokio::test]
    async fn error_member_is_protocol_error() {
        let url = serve_once(
            r#"{"jsonrpc":"2.0","id":1,"error":{"code":-32601,"message":"method not found"}}"#,
        )
        .await;
        let transport = HttpTransport::new("node".to_string(), url, reqwest::Client::new());
        let err = transport.call("eth_bogus", json!([])).await.unwrap_err();
        assert_eq!(err.kind, BackendErrorKind::Protocol);
    }

    #[tokio::test]
    async fn connection_refused_is_transport_error() {
        let transport = HttpTransport::new(
            "node".to_string(),
            "http://127.0.0.1:1".to_string(),
            reqwest::Client::new(),
        );
        let err = transport.call("eth_gasPrice", json!([])).await.unwrap_err();
        assert_eq!(err.kind, BackendErrorKind::Transport);
    }
}
