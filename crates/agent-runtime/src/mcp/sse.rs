//! Legacy HTTP+SSE transport
//!
//! The client holds a `GET` event stream open for the whole session. The
//! server's first `endpoint` event names the URL that JSON-RPC messages are
//! POSTed to; responses and server requests come back as `message` events on
//! the stream, routed to waiting requests by id.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use agent_core::{AgentError, ProviderSession, Result, ServerId, ToolDescriptor, ToolResult};
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::header::{ACCEPT, CONTENT_TYPE, USER_AGENT};
use reqwest::{RequestBuilder, Url};
use serde_json::{Value, json};
use tokio::sync::{Mutex as AsyncMutex, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::protocol::{self, Inbound};
use crate::auth::{self, HeaderProvider};

type Reply = std::result::Result<Value, (i64, String)>;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const CALL_TIMEOUT: Duration = Duration::from_secs(60);

/// Longest unterminated line kept while waiting for its newline
const MAX_LINE_BYTES: usize = 16 * 1024 * 1024;

/// MCP server reached over a server-sent-event stream
pub struct SseSession {
    inner: Arc<Inner>,
}

struct Inner {
    server: ServerId,
    url: String,
    client: reqwest::Client,
    headers: BTreeMap<String, String>,
    auth: Option<Arc<dyn HeaderProvider>>,
    request_timeout: Duration,
    call_timeout: Duration,
    endpoint: AsyncMutex<Option<String>>,
    reader: Mutex<Option<JoinHandle<()>>>,
    pending: AsyncMutex<HashMap<u64, oneshot::Sender<Reply>>>,
    next_id: AtomicU64,
    closed: AtomicBool,
}

impl SseSession {
    pub fn new(server: ServerId, url: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(Inner {
                server,
                url: url.into(),
                client: reqwest::Client::new(),
                headers: BTreeMap::new(),
                auth: None,
                request_timeout: REQUEST_TIMEOUT,
                call_timeout: CALL_TIMEOUT,
                endpoint: AsyncMutex::new(None),
                reader: Mutex::new(None),
                pending: AsyncMutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                closed: AtomicBool::new(false),
            }),
        }
    }

    /// Static headers sent on the stream and on every POST
    #[must_use]
    pub fn with_headers(mut self, headers: BTreeMap<String, String>) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.headers = headers;
        }
        self
    }

    /// Headers computed per request; they override static ones
    #[must_use]
    pub fn with_auth(mut self, auth: Arc<dyn HeaderProvider>) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.auth = Some(auth);
        }
        self
    }

    /// Override the handshake/listing and tool-call deadlines
    #[must_use]
    pub fn with_timeouts(mut self, request: Duration, call: Duration) -> Self {
        if let Some(inner) = Arc::get_mut(&mut self.inner) {
            inner.request_timeout = request;
            inner.call_timeout = call;
        }
        self
    }

    /// The POST endpoint the server announced, once connected
    pub async fn endpoint(&self) -> Option<String> {
        self.inner.endpoint.lock().await.clone()
    }
}

impl std::fmt::Debug for SseSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SseSession")
            .field("server", &self.inner.server)
            .field("url", &self.inner.url)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl ProviderSession for SseSession {
    async fn connect(&self) -> Result<()> {
        if self.inner.endpoint.lock().await.is_some() {
            return Ok(());
        }
        self.inner.open_stream().await?;
        if let Err(e) = self.inner.handshake().await {
            self.inner.shutdown().await;
            return Err(e);
        }
        Ok(())
    }

    async fn list_tools(&self) -> Result<Vec<ToolDescriptor>> {
        let mut tools = Vec::new();
        let mut pager = protocol::Pager::default();
        let mut cursor: Option<String> = None;
        loop {
            let params = cursor.map_or_else(|| json!({}), |c| json!({ "cursor": c }));
            let result = self
                .inner
                .request("tools/list", params, self.inner.request_timeout)
                .await?;
            let (page, next) = protocol::parse_tools(&self.inner.server, &result)?;
            tools.extend(page);
            match pager.advance(&self.inner.server, next)? {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }
        Ok(tools)
    }

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<ToolResult> {
        let result = self
            .inner
            .request(
                "tools/call",
                protocol::call_params(name, arguments),
                self.inner.call_timeout,
            )
            .await?;
        Ok(protocol::parse_call_result(result))
    }

    async fn close(&self) -> Result<()> {
        self.inner.shutdown().await;
        Ok(())
    }
}

impl Inner {
    async fn prepare(&self, mut request: RequestBuilder) -> Result<RequestBuilder> {
        request = request.header(USER_AGENT, auth::user_agent());
        for (key, value) in &self.headers {
            request = request.header(key.as_str(), value.as_str());
        }
        if let Some(auth) = &self.auth {
            for (key, value) in auth.headers().await? {
                request = request.header(key, value);
            }
        }
        Ok(request)
    }

    fn check_status(&self, status: reqwest::StatusCode) -> Result<()> {
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(AgentError::Auth(format!(
                "server '{}' rejected the request ({status})",
                self.server
            )));
        }
        if !status.is_success() {
            return Err(self.transport_error(format!("HTTP {status}")));
        }
        Ok(())
    }

    /// Open the event stream and wait for the `endpoint` announcement
    async fn open_stream(self: &Arc<Self>) -> Result<()> {
        let base = Url::parse(&self.url).map_err(|e| self.transport_error(format!("bad url: {e}")))?;
        let request = self
            .prepare(self.client.get(base.clone()).header(ACCEPT, "text/event-stream"))
            .await?;
        let response = request
            .send()
            .await
            .map_err(|e| self.transport_error(e.to_string()))?;
        self.check_status(response.status())?;

        self.closed.store(false, Ordering::SeqCst);
        let (endpoint_tx, endpoint_rx) = oneshot::channel();
        let reader = tokio::spawn(reader_loop(
            Arc::downgrade(self),
            self.server.clone(),
            base,
            response,
            endpoint_tx,
        ));
        if let Ok(mut slot) = self.reader.lock() {
            *slot = Some(reader);
        }

        let endpoint = match tokio::time::timeout(self.request_timeout, endpoint_rx).await {
            Ok(Ok(endpoint)) => endpoint,
            Ok(Err(_)) => {
                self.shutdown().await;
                return Err(self.transport_error("event stream ended before announcing an endpoint"));
            }
            Err(_) => {
                self.shutdown().await;
                return Err(AgentError::Rpc {
                    server: self.server.to_string(),
                    code: protocol::REQUEST_TIMEOUT,
                    message: "no endpoint event before the deadline".into(),
                });
            }
        };
        debug!(server = %self.server, endpoint = %endpoint, "SSE endpoint announced");
        *self.endpoint.lock().await = Some(endpoint);
        Ok(())
    }

    async fn handshake(&self) -> Result<()> {
        let result = self
            .request("initialize", protocol::initialize_params(), self.request_timeout)
            .await?;
        debug!(
            server = %self.server,
            protocol = result.get("protocolVersion").and_then(serde_json::Value::as_str).unwrap_or("unknown"),
            "MCP server initialized"
        );
        self.post(&protocol::notification("notifications/initialized", json!({})))
            .await
    }

    async fn request(&self, method: &str, params: Value, deadline: Duration) -> Result<Value> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        if self.closed.load(Ordering::SeqCst) {
            self.pending.lock().await.remove(&id);
            return Err(self.transport_error("event stream is closed"));
        }
        if let Err(e) = self.post(&protocol::request(id, method, params)).await {
            self.pending.lock().await.remove(&id);
            return Err(e);
        }

        match tokio::time::timeout(deadline, rx).await {
            Ok(Ok(Ok(result))) => Ok(result),
            Ok(Ok(Err(error))) => Err(protocol::rpc_error(&self.server, error)),
            Ok(Err(_)) => Err(self.transport_error("event stream is closed")),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                Err(AgentError::Rpc {
                    server: self.server.to_string(),
                    code: protocol::REQUEST_TIMEOUT,
                    message: format!("'{method}' timed out after {}s", deadline.as_secs_f32()),
                })
            }
        }
    }

    /// Send one message; its reply, if any, arrives on the stream
    async fn post(&self, message: &Value) -> Result<()> {
        let endpoint = self
            .endpoint
            .lock()
            .await
            .clone()
            .ok_or_else(|| self.transport_error("not connected"))?;
        let request = self
            .prepare(
                self.client
                    .post(endpoint)
                    .timeout(self.request_timeout)
                    .header(CONTENT_TYPE, "application/json"),
            )
            .await?;
        let response = request
            .json(message)
            .send()
            .await
            .map_err(|e| self.transport_error(e.to_string()))?;
        self.check_status(response.status())
    }

    async fn handle(&self, message: &Value) {
        match protocol::classify(message) {
            Inbound::Response { id, outcome } => {
                let waiter = self.pending.lock().await.remove(&id);
                match waiter {
                    Some(tx) => {
                        let _ = tx.send(outcome);
                    }
                    None => debug!(server = %self.server, id, "Response for unknown request"),
                }
            }
            Inbound::Request { id, method } => {
                let reply = if method == "ping" {
                    protocol::response(id, json!({}))
                } else {
                    warn!(server = %self.server, method = %method, "Server sent unsupported request");
                    protocol::error_response(
                        id,
                        protocol::METHOD_NOT_FOUND,
                        format!("client does not implement method '{method}'"),
                    )
                };
                if let Err(e) = self.post(&reply).await {
                    warn!(server = %self.server, error = %e, "Failed to answer server request");
                }
            }
            Inbound::Notification { method } => {
                debug!(server = %self.server, method = %method, "Server notification");
            }
            Inbound::Ignored => debug!(server = %self.server, "Ignoring unroutable message"),
        }
    }

    /// Fail every waiter; their receivers see the channel close
    async fn fail_pending(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.pending.lock().await.clear();
    }

    /// Drop the stream and forget the endpoint; safe to repeat
    async fn shutdown(&self) {
        let reader = self.reader.lock().ok().and_then(|mut slot| slot.take());
        if let Some(reader) = reader {
            reader.abort();
        }
        self.endpoint.lock().await.take();
        self.fail_pending().await;
    }

    fn transport_error(&self, message: impl Into<String>) -> AgentError {
        AgentError::transport(self.server.as_str(), message)
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Ok(slot) = self.reader.get_mut() {
            if let Some(reader) = slot.take() {
                reader.abort();
            }
        }
    }
}

/// Holds only a weak reference so a dropped session stops reading
async fn reader_loop(
    inner: Weak<Inner>,
    server: ServerId,
    base: Url,
    response: reqwest::Response,
    endpoint_tx: oneshot::Sender<String>,
) {
    let mut endpoint_tx = Some(endpoint_tx);
    let mut chunks = response.bytes_stream();
    let mut decoder = EventDecoder::default();
    while let Some(chunk) = chunks.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(e) => {
                warn!(server = %server, error = %e, "Failed reading the event stream");
                break;
            }
        };
        for event in decoder.push(&chunk) {
            match event.name.as_str() {
                "endpoint" => match base.join(event.data.trim()) {
                    Ok(url) => {
                        if let Some(tx) = endpoint_tx.take() {
                            let _ = tx.send(url.to_string());
                        }
                    }
                    Err(e) => warn!(server = %server, error = %e, "Unusable endpoint event"),
                },
                "message" => {
                    let Ok(message) = serde_json::from_str::<Value>(&event.data) else {
                        debug!(server = %server, data = %event.data, "Skipping non-JSON event");
                        continue;
                    };
                    let Some(inner) = inner.upgrade() else {
                        return;
                    };
                    inner.handle(&message).await;
                }
                other => debug!(server = %server, event = other, "Ignoring event"),
            }
        }
        if decoder.buffered() > MAX_LINE_BYTES {
            warn!(server = %server, "Event stream line too long; dropping the stream");
            break;
        }
    }

    debug!(server = %server, "Event stream ended");
    if let Some(inner) = inner.upgrade() {
        inner.fail_pending().await;
    }
}

/// One dispatched server-sent event
#[derive(Debug, PartialEq, Eq)]
pub(crate) struct Event {
    pub name: String,
    pub data: String,
}

/// Incremental `text/event-stream` parser
#[derive(Debug, Default)]
pub(crate) struct EventDecoder {
    buf: Vec<u8>,
    name: Option<String>,
    data: Vec<String>,
}

impl EventDecoder {
    /// Feed bytes; returns every event completed by them
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Event> {
        self.buf.extend_from_slice(chunk);
        let mut events = Vec::new();
        while let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.buf.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&line);
            if let Some(event) = self.line(line.trim_end_matches(['\n', '\r'])) {
                events.push(event);
            }
        }
        events
    }

    /// The event still open at end of input, if any
    pub fn finish(&mut self) -> Option<Event> {
        let rest = std::mem::take(&mut self.buf);
        let rest = String::from_utf8_lossy(&rest).into_owned();
        let rest = rest.trim_end_matches('\r');
        if !rest.is_empty() {
            self.line(rest);
        }
        self.line("")
    }

    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    fn line(&mut self, line: &str) -> Option<Event> {
        if line.is_empty() {
            let name = self.name.take().unwrap_or_else(|| "message".into());
            if self.data.is_empty() {
                return None;
            }
            let data = std::mem::take(&mut self.data).join("\n");
            return Some(Event { name, data });
        }
        if line.starts_with(':') {
            return None;
        }
        let (field, value) = line
            .split_once(':')
            .map_or((line, ""), |(field, value)| (field, value.strip_prefix(' ').unwrap_or(value)));
        match field {
            "event" => self.name = Some(value.to_string()),
            "data" => self.data.push(value.to_string()),
            _ => {}
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::BearerTokenAuth;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};
    use tokio::sync::mpsc;

    #[test]
    fn test_decoder_across_chunks() {
        let mut decoder = EventDecoder::default();
        assert!(decoder.push(b"event: endpoint\r\nda").is_empty());
        let events = decoder.push(b"ta: /messages?session_id=1\r\n\r\n: keep-alive\n\ndata: {\"a\":\ndata: 1}\n");
        assert_eq!(
            events,
            vec![Event {
                name: "endpoint".into(),
                data: "/messages?session_id=1".into()
            }]
        );
        assert_eq!(
            decoder.finish(),
            Some(Event {
                name: "message".into(),
                data: "{\"a\":\n1}".into()
            })
        );
        assert_eq!(decoder.finish(), None);
    }

    async fn read_request(socket: &mut TcpStream) -> Option<(String, Vec<u8>)> {
        let mut buf = Vec::new();
        let mut chunk = [0_u8; 4096];
        let head_end = loop {
            let n = socket.read(&mut chunk).await.ok()?;
            if n == 0 {
                return None;
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
            let n = socket.read(&mut chunk).await.ok()?;
            buf.extend_from_slice(&chunk[..n]);
        }
        Some((head, buf[head_end..].to_vec()))
    }

    /// Legacy SSE server: one event stream, replies pushed onto it
    async fn fake_server() -> (String, Arc<Mutex<Vec<(String, Value)>>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/sse", listener.local_addr().unwrap());
        let seen = Arc::new(Mutex::new(Vec::new()));
        let (events_tx, events_rx) = mpsc::unbounded_channel::<Value>();
        let events_rx = Arc::new(AsyncMutex::new(Some(events_rx)));
        let log = seen.clone();
        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                let log = log.clone();
                let events_tx = events_tx.clone();
                let events_rx = events_rx.clone();
                tokio::spawn(async move {
                    let Some((head, body)) = read_request(&mut socket).await else {
                        return;
                    };
                    if head.starts_with("get") {
                        log.lock().unwrap().push((head, Value::Null));
                        let Some(mut rx) = events_rx.lock().await.take() else {
                            return;
                        };
                        let opening = "HTTP/1.1 200 OK\r\nContent-Type: text/event-stream\r\nCache-Control: no-cache\r\n\r\nevent: endpoint\ndata: /messages?session_id=abc\n\n";
                        if socket.write_all(opening.as_bytes()).await.is_err() {
                            return;
                        }
                        while let Some(message) = rx.recv().await {
                            let event = format!("event: message\ndata: {message}\n\n");
                            if socket.write_all(event.as_bytes()).await.is_err() {
                                return;
                            }
                        }
                        return;
                    }

                    let message: Value = serde_json::from_slice(&body).unwrap();
                    log.lock().unwrap().push((head, message.clone()));
                    let accepted = "HTTP/1.1 202 Accepted\r\nContent-Length: 0\r\nConnection: close\r\n\r\n";
                    socket.write_all(accepted.as_bytes()).await.unwrap();

                    let id = message.get("id").cloned().unwrap_or(Value::Null);
                    let reply = match message.get("method").and_then(Value::as_str) {
                        Some("initialize") => {
                            let _ = events_tx.send(json!({"jsonrpc": "2.0", "id": "srv-1", "method": "ping"}));
                            json!({"jsonrpc": "2.0", "id": id, "result": {"protocolVersion": "2024-11-05"}})
                        }
                        Some("tools/list") => {
                            json!({"jsonrpc": "2.0", "id": id, "result": {"tools": [{"name": "search"}]}})
                        }
                        Some("tools/call") => json!({
                            "jsonrpc": "2.0",
                            "id": id,
                            "result": {"content": [{"type": "text", "text": "found 3"}]}
                        }),
                        _ => return,
                    };
                    let _ = events_tx.send(reply);
                });
            }
        });
        (url, seen)
    }

    #[tokio::test]
    async fn test_session_round_trip() {
        let (url, seen) = fake_server().await;
        let session = SseSession::new(ServerId::new("legacy"), &url)
            .with_headers(BTreeMap::from([("X-Team".to_string(), "infra".to_string())]))
            .with_auth(Arc::new(BearerTokenAuth::new("tok-1")));

        session.connect().await.unwrap();
        let endpoint = session.endpoint().await.unwrap();
        assert_eq!(endpoint, url.replace("/sse", "/messages?session_id=abc"));

        let tools = session.list_tools().await.unwrap();
        assert_eq!(tools[0].name, "search");
        let result = session.call_tool("search", json!({"q": "rust"})).await.unwrap();
        assert_eq!(result.render(), "found 3");

        session.close().await.unwrap();
        session.close().await.unwrap();
        assert!(session.endpoint().await.is_none());
        assert!(matches!(
            session.call_tool("search", Value::Null).await,
            Err(AgentError::Transport { .. })
        ));

        let log = seen.lock().unwrap().clone();
        assert!(log[0].0.starts_with("get /sse "));
        assert!(log[0].0.contains("accept: text/event-stream"));
        for (head, _) in &log {
            assert!(head.contains("authorization: bearer tok-1"), "{head}");
            assert!(head.contains("x-team: infra"), "{head}");
        }
        for (head, _) in &log[1..] {
            assert!(head.starts_with("post /messages?session_id=abc "), "{head}");
        }
        let methods: Vec<&str> = log[1..]
            .iter()
            .filter_map(|(_, m)| m.get("method").and_then(Value::as_str))
            .collect();
        assert_eq!(
            methods,
            vec!["initialize", "notifications/initialized", "tools/list", "tools/call"]
        );
        assert!(
            log.iter()
                .any(|(_, m)| m.get("id") == Some(&json!("srv-1")) && m.get("result") == Some(&json!({}))),
            "ping was not answered"
        );
    }

    #[tokio::test]
    async fn test_stream_without_endpoint_fails_connect() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/sse", listener.local_addr().unwrap());
        tokio::spawn(async move {
            if let Ok((mut socket, _)) = listener.accept().await {
                let _ = read_request(&mut socket).await;
                let reply = "HTTP/1.1 200 OK\r\nContent-Type: text/event-stream\r\nConnection: close\r\n\r\nevent: message\ndata: {}\n\n";
                let _ = socket.write_all(reply.as_bytes()).await;
            }
        });

        let session = SseSession::new(ServerId::new("legacy"), url)
            .with_timeouts(Duration::from_secs(5), Duration::from_secs(5));
        let err = session.connect().await.unwrap_err();
        assert!(err.is_fatal_transport(), "unexpected error: {err:?}");
        assert!(session.endpoint().await.is_none());
    }

    #[tokio::test]
    async fn test_rejected_stream_is_auth_error() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/sse", listener.local_addr().unwrap());
        tokio::spawn(async move {
            if let Ok((mut socket, _)) = listener.accept().await {
                let _ = read_request(&mut socket).await;
                let reply = "HTTP/1.1 401 Unauthorized\r\nContent-Length: 0\r\nConnection: close\r\n\r\n";
                let _ = socket.write_all(reply.as_bytes()).await;
            }
        });
        let err = SseSession::new(ServerId::new("legacy"), url).connect().await.unwrap_err();
        assert!(matches!(err, AgentError::Auth(_)), "unexpected error: {err:?}");
    }
}
