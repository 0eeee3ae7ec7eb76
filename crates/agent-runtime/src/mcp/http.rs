//! Streamable-HTTP transport
//!
//! Each JSON-RPC message is POSTed to the server URL. Replies arrive either as
//! a JSON body or as a short server-sent-event stream. The session id the
//! server hands out during `initialize` is echoed on every later request.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use agent_core::{AgentError, ProviderSession, Result, ServerId, ToolDescriptor, ToolResult};
use async_trait::async_trait;
use reqwest::header::{ACCEPT, CONTENT_TYPE, USER_AGENT};
use serde_json::{Value, json};
use tokio::sync::Mutex as AsyncMutex;
use tracing::debug;

use super::protocol::{self, Inbound};
use super::sse::EventDecoder;
use crate::auth::{self, HeaderProvider};

const SESSION_HEADER: &str = "Mcp-Session-Id";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const CALL_TIMEOUT: Duration = Duration::from_secs(60);

/// MCP server reached over HTTP
pub struct HttpSession {
    server: ServerId,
    url: String,
    client: reqwest::Client,
    headers: BTreeMap<String, String>,
    auth: Option<Arc<dyn HeaderProvider>>,
    session_id: AsyncMutex<Option<String>>,
    next_id: AtomicU64,
    connected: AtomicBool,
}

impl HttpSession {
    pub fn new(server: ServerId, url: impl Into<String>) -> Self {
        Self {
            server,
            url: url.into(),
            client: reqwest::Client::new(),
            headers: BTreeMap::new(),
            auth: None,
            session_id: AsyncMutex::new(None),
            next_id: AtomicU64::new(1),
            connected: AtomicBool::new(false),
        }
    }

    /// Static headers from the server configuration
    #[must_use]
    pub fn with_headers(mut self, headers: BTreeMap<String, String>) -> Self {
        self.headers = headers;
        self
    }

    /// Headers computed per request; they override static ones
    #[must_use]
    pub fn with_auth(mut self, auth: Arc<dyn HeaderProvider>) -> Self {
        self.auth = Some(auth);
        self
    }

    pub async fn session_id(&self) -> Option<String> {
        self.session_id.lock().await.clone()
    }

    async fn post(&self, body: &Value, timeout: Duration) -> Result<reqwest::Response> {
        let mut request = self
            .client
            .post(&self.url)
            .timeout(timeout)
            .header(CONTENT_TYPE, "application/json")
            .header(ACCEPT, "application/json, text/event-stream")
            .header(USER_AGENT, auth::user_agent());
        for (key, value) in &self.headers {
            request = request.header(key.as_str(), value.as_str());
        }
        if let Some(auth) = &self.auth {
            for (key, value) in auth.headers().await? {
                request = request.header(key, value);
            }
        }
        if let Some(id) = self.session_id.lock().await.as_deref() {
            request = request.header(SESSION_HEADER, id);
        }

        let response = request
            .json(body)
            .send()
            .await
            .map_err(|e| self.transport_error(e.to_string()))?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(AgentError::Auth(format!(
                "server '{}' rejected the request ({status})",
                self.server
            )));
        }
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(self.transport_error(format!("HTTP {status}: {text}")));
        }

        if let Some(id) = response
            .headers()
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
        {
            *self.session_id.lock().await = Some(id.to_string());
        }
        Ok(response)
    }

    async fn request(&self, method: &str, params: Value, timeout: Duration) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let response = self
            .post(&protocol::request(id, method, params), timeout)
            .await?;

        let is_stream = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|ct| ct.starts_with("text/event-stream"));
        let body = response
            .text()
            .await
            .map_err(|e| self.transport_error(e.to_string()))?;

        let messages = if is_stream {
            sse_messages(&body)
        } else {
            match serde_json::from_str::<Value>(&body)
                .map_err(|e| AgentError::Parse(format!("server '{}' sent invalid JSON: {e}", self.server)))?
            {
                Value::Array(batch) => batch,
                single => vec![single],
            }
        };

        for message in &messages {
            match protocol::classify(message) {
                Inbound::Response { id: got, outcome } if got == id => {
                    return outcome.map_err(|e| protocol::rpc_error(&self.server, e));
                }
                other => debug!(server = %self.server, message = ?other, "Skipping unrelated message"),
            }
        }
        Err(self.transport_error(format!("no response to '{method}'")))
    }

    async fn notify(&self, method: &str) -> Result<()> {
        self.post(&protocol::notification(method, json!({})), REQUEST_TIMEOUT)
            .await
            .map(drop)
    }

    fn ensure_connected(&self) -> Result<()> {
        if self.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(self.transport_error("not connected"))
        }
    }

    fn transport_error(&self, message: impl Into<String>) -> AgentError {
        AgentError::transport(self.server.as_str(), message)
    }
}

impl std::fmt::Debug for HttpSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpSession")
            .field("server", &self.server)
            .field("url", &self.url)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl ProviderSession for HttpSession {
    async fn connect(&self) -> Result<()> {
        if self.connected.load(Ordering::SeqCst) {
            return Ok(());
        }
        let result = self
            .request("initialize", protocol::initialize_params(), REQUEST_TIMEOUT)
            .await?;
        debug!(
            server = %self.server,
            protocol = result.get("protocolVersion").and_then(serde_json::Value::as_str).unwrap_or("unknown"),
            "MCP server initialized"
        );
        self.notify("notifications/initialized").await?;
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn list_tools(&self) -> Result<Vec<ToolDescriptor>> {
        self.ensure_connected()?;
        let mut tools = Vec::new();
        let mut pager = protocol::Pager::default();
        let mut cursor: Option<String> = None;
        loop {
            let params = cursor.map_or_else(|| json!({}), |c| json!({ "cursor": c }));
            let result = self.request("tools/list", params, REQUEST_TIMEOUT).await?;
            let (page, next) = protocol::parse_tools(&self.server, &result)?;
            tools.extend(page);
            match pager.advance(&self.server, next)? {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }
        Ok(tools)
    }

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<ToolResult> {
        self.ensure_connected()?;
        let result = self
            .request("tools/call", protocol::call_params(name, arguments), CALL_TIMEOUT)
            .await?;
        Ok(protocol::parse_call_result(result))
    }

    async fn close(&self) -> Result<()> {
        if !self.connected.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        // Ending the server-side session is a courtesy; failures are ignored
        let session_id = self.session_id.lock().await.take();
        if let Some(id) = session_id {
            let sent = self
                .client
                .delete(&self.url)
                .timeout(REQUEST_TIMEOUT)
                .header(SESSION_HEADER, id)
                .send()
                .await;
            if let Err(e) = sent {
                debug!(server = %self.server, error = %e, "Session teardown failed");
            }
        }
        Ok(())
    }
}

/// JSON payloads of every `data:` event in an SSE body
pub fn sse_messages(body: &str) -> Vec<Value> {
    let mut decoder = EventDecoder::default();
    let mut events = decoder.push(body.as_bytes());
    events.extend(decoder.finish());
    events
        .into_iter()
        .filter_map(|event| serde_json::from_str(&event.data).ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::BearerTokenAuth;
    use std::sync::Mutex;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};

    #[test]
    fn test_sse_messages() {
        let body = "event: message\r\ndata: {\"jsonrpc\":\"2.0\",\"id\":1,\r\ndata: \"result\":{}}\r\n\r\n: keep-alive\n\nevent: message\ndata: not json\n\n";
        let messages = sse_messages(body);
        assert_eq!(messages, vec![json!({"jsonrpc": "2.0", "id": 1, "result": {}})]);
    }

    /// Minimal HTTP/1.1 responder standing in for an MCP server
    async fn fake_server() -> (String, Arc<Mutex<Vec<String>>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/mcp", listener.local_addr().unwrap());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let log = seen.clone();
        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                tokio::spawn(respond(socket, log.clone()));
            }
        });
        (url, seen)
    }

    async fn respond(mut socket: TcpStream, seen: Arc<Mutex<Vec<String>>>) {
        let mut buf = Vec::new();
        let mut chunk = [0_u8; 4096];
        let head_end = loop {
            let n = socket.read(&mut chunk).await.unwrap();
            if n == 0 {
                return;
            }
            buf.extend_from_slice(&chunk[..n]);
            if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                break pos + 4;
            }
        };
        let head = String::from_utf8_lossy(&buf[..head_end]).to_lowercase();
        let length: usize = head
            .lines()
            .find_map(|l| l.strip_prefix("content-length:"))
            .map_or(0, |v| v.trim().parse().unwrap());
        while buf.len() < head_end + length {
            let n = socket.read(&mut chunk).await.unwrap();
            buf.extend_from_slice(&chunk[..n]);
        }
        seen.lock().unwrap().push(head.clone());

        let (status, content_type, extra, body) = if head.starts_with("delete") {
            ("200 OK", "text/plain", "", String::new())
        } else {
            let request: Value = serde_json::from_slice(&buf[head_end..]).unwrap();
            let id = request.get("id").cloned().unwrap_or(Value::Null);
            match request["method"].as_str().unwrap() {
                "initialize" => (
                    "200 OK",
                    "application/json",
                    "Mcp-Session-Id: sess-1\r\n",
                    json!({"jsonrpc": "2.0", "id": id, "result": {"protocolVersion": "2024-11-05"}}).to_string(),
                ),
                "tools/list" => (
                    "200 OK",
                    "text/event-stream",
                    "",
                    format!(
                        "event: message\ndata: {}\n\n",
                        json!({"jsonrpc": "2.0", "id": id, "result": {"tools": [{"name": "search"}]}})
                    ),
                ),
                "tools/call" => (
                    "200 OK",
                    "application/json",
                    "",
                    json!({"jsonrpc": "2.0", "id": id, "result": {"content": [{"type": "text", "text": "found 3"}]}})
                        .to_string(),
                ),
                _ => ("202 Accepted", "text/plain", "", String::new()),
            }
        };
        let reply = format!(
            "HTTP/1.1 {status}\r\nContent-Type: {content_type}\r\nContent-Length: {}\r\n{extra}Connection: close\r\n\r\n{body}",
            body.len()
        );
        socket.write_all(reply.as_bytes()).await.unwrap();
    }

    #[tokio::test]
    async fn test_session_round_trip() {
        let (url, seen) = fake_server().await;
        let session = HttpSession::new(ServerId::new("search"), url)
            .with_headers(BTreeMap::from([("X-Team".to_string(), "infra".to_string())]))
            .with_auth(Arc::new(BearerTokenAuth::new("tok-1")));

        session.connect().await.unwrap();
        assert_eq!(session.session_id().await.as_deref(), Some("sess-1"));

        let tools = session.list_tools().await.unwrap();
        assert_eq!(tools[0].name, "search");

        let result = session.call_tool("search", json!({"q": "rust"})).await.unwrap();
        assert_eq!(result.render(), "found 3");

        session.close().await.unwrap();
        session.close().await.unwrap();

        let heads = seen.lock().unwrap().clone();
        assert_eq!(heads.len(), 5);
        assert!(!heads[0].contains("mcp-session-id"));
        for head in &heads[1..] {
            assert!(head.contains("mcp-session-id: sess-1"), "{head}");
        }
        assert!(heads[0].contains("authorization: bearer tok-1"));
        assert!(heads[0].contains("x-team: infra"));
        assert!(heads[0].contains("accept: application/json, text/event-stream"));
        assert!(heads[4].starts_with("delete"));
    }

    #[tokio::test]
    async fn test_calls_before_connect_fail() {
        let session = HttpSession::new(ServerId::new("search"), "http://127.0.0.1:9/mcp");
        assert!(matches!(
            session.call_tool("search", Value::Null).await,
            Err(AgentError::Transport { .. })
        ));
    }

    #[tokio::test]
    async fn test_unreachable_server_is_transport_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/mcp", listener.local_addr().unwrap());
        drop(listener);
        let err = HttpSession::new(ServerId::new("gone"), url).connect().await.unwrap_err();
        assert!(err.is_fatal_transport());
    }
}
