//! native transport: async `reqwest` on a small tokio runtime owned by the
//! transport.
//!
//! requests are polled from bevy's task pools with the runtime entered, so the
//! connection lives exactly as long as the future or body stream polling it.
//! dropping the body stream closes the socket even while the server is quiet.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bevy::prelude::*;
use futures_lite::{Stream, StreamExt};
use reqwest::{Client, Response};
use tokio::runtime::{Builder, Handle, Runtime};

use super::{
    ByteChunks, ChatReply, ChatRequestBody, ChatTransport, DispatchError, Endpoints, SessionInfo,
};

const RUNTIME_THREADS: usize = 2;

#[derive(Clone)]
pub struct ReqwestTransport {
    client: Client,
    endpoints: Endpoints,
    rt: Arc<Runtime>,
}

impl ReqwestTransport {
    pub fn new(base_url: impl Into<String>) -> Result<Self, DispatchError> {
        info!(target: "bevy_rag_chat", "initializing tokio runtime for http (native)");
        let rt = Builder::new_multi_thread()
            .worker_threads(RUNTIME_THREADS)
            .thread_name("bevy_rag_chat-http")
            .enable_all()
            .build()
            .map_err(DispatchError::connection)?;
        let client = Client::builder()
            .build()
            .map_err(DispatchError::connection)?;
        Ok(Self {
            client,
            endpoints: Endpoints::new(base_url),
            rt: Arc::new(rt),
        })
    }

    pub fn endpoints(&self) -> &Endpoints {
        &self.endpoints
    }

    fn entered<T>(&self, inner: T) -> InRuntime<Pin<Box<T>>> {
        InRuntime {
            handle: self.rt.handle().clone(),
            inner: Box::pin(inner),
        }
    }

    async fn post_json(&self, url: String, text: &str) -> Result<Response, DispatchError> {
        let res = self
            .client
            .post(url)
            .json(&ChatRequestBody { message: text })
            .send()
            .await
            .map_err(DispatchError::connection)?;
        ensure_success(res).await
    }
}

/// polls `inner` with the tokio runtime entered, so reqwest finds its reactor
/// when driven from bevy's executor.
struct InRuntime<T> {
    handle: Handle,
    inner: T,
}

impl<F: Future + Unpin> Future for InRuntime<F> {
    type Output = F::Output;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let _guard = this.handle.enter();
        Pin::new(&mut this.inner).poll(cx)
    }
}

impl<S: Stream + Unpin> Stream for InRuntime<S> {
    type Item = S::Item;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        let _guard = this.handle.enter();
        Pin::new(&mut this.inner).poll_next(cx)
    }
}

/// pass 2xx through; turn anything else into an http failure.
///
/// the status text is the canonical reason for the code. reqwest does not
/// expose the reason phrase the server actually sent, so a non-standard phrase
/// is lost from the `HTTP <status> <statusText>` fallback.
async fn ensure_success(res: Response) -> Result<Response, DispatchError> {
    let status = res.status();
    if status.is_success() {
        return Ok(res);
    }
    let status_text = status.canonical_reason().unwrap_or_default();
    let body = res.bytes().await.map(|b| b.to_vec()).unwrap_or_default();
    warn!(target: "bevy_rag_chat", "http {} from backend", status.as_u16());
    Err(DispatchError::http(status.as_u16(), status_text, &body))
}

async fn read_json<T: serde::de::DeserializeOwned>(res: Response) -> Result<T, DispatchError> {
    let bytes = res.bytes().await.map_err(DispatchError::connection)?;
    serde_json::from_slice(&bytes)
        .map_err(|e| DispatchError::connection(format!("invalid response body: {e}")))
}

#[async_trait::async_trait]
impl ChatTransport for ReqwestTransport {
    async fn send_message(&self, text: &str) -> Result<ChatReply, DispatchError> {
        let url = self.endpoints.message();
        debug!(target: "bevy_rag_chat", "POST {url} (len={})", text.len());
        self.entered(async { read_json(self.post_json(url, text).await?).await })
            .await
    }

    async fn send_message_stream(&self, text: &str) -> Result<ByteChunks, DispatchError> {
        let url = self.endpoints.message_stream();
        debug!(target: "bevy_rag_chat", "POST {url} (stream, len={})", text.len());
        let res = self.entered(self.post_json(url, text)).await?;
        let body = res
            .bytes_stream()
            .map(|chunk| chunk.map(|b| b.to_vec()).map_err(DispatchError::connection));
        Ok(self.entered(body).boxed())
    }

    async fn create_session(&self) -> Result<SessionInfo, DispatchError> {
        let url = self.endpoints.sessions();
        self.entered(async {
            let res = self
                .client
                .post(url)
                .send()
                .await
                .map_err(DispatchError::connection)?;
            read_json(ensure_success(res).await?).await
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::ChatEventStream;
    use crate::dispatch::ErrorKind;
    use pretty_assertions::assert_eq;
    use std::io::{ErrorKind as IoErrorKind, Read, Write};
    use std::net::{TcpListener, TcpStream};
    use std::thread;
    use std::time::Duration;

    /// read one request off `conn` (headers plus content-length body).
    fn read_request(conn: &mut TcpStream) -> String {
        let mut raw = Vec::new();
        let mut buf = [0u8; 1024];
        loop {
            let n = conn.read(&mut buf).unwrap();
            raw.extend_from_slice(&buf[..n]);
            let text = String::from_utf8_lossy(&raw).to_string();
            if let Some(end) = text.find("\r\n\r\n") {
                let len = text[..end]
                    .lines()
                    .find_map(|l| {
                        let (k, v) = l.split_once(':')?;
                        k.eq_ignore_ascii_case("content-length")
                            .then(|| v.trim().parse::<usize>().ok())
                            .flatten()
                    })
                    .unwrap_or(0);
                if raw.len() >= end + 4 + len {
                    return text;
                }
            }
            if n == 0 {
                return text;
            }
        }
    }

    /// serve exactly one connection: reply with `head`, then each body part
    /// with a pause between, then close.
    fn serve_once(head: String, parts: Vec<&'static str>) -> (String, thread::JoinHandle<String>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let base = format!("http://{}/api", listener.local_addr().unwrap());
        let handle = thread::spawn(move || {
            let (mut conn, _) = listener.accept().unwrap();
            let request = read_request(&mut conn);
            conn.write_all(head.as_bytes()).unwrap();
            for part in parts {
                conn.write_all(part.as_bytes()).unwrap();
                conn.flush().unwrap();
                thread::sleep(Duration::from_millis(5));
            }
            request
        });
        (base, handle)
    }

    fn json_head(status: &str, body: &str) -> String {
        format!(
            "HTTP/1.1 {status}\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n",
            body.len()
        )
    }

    #[test]
    fn whole_response_round_trip() {
        let body = r#"{"response":"hi there","sources":[]}"#;
        let (base, server) = serve_once(json_head("200 OK", body), vec![body]);
        let transport = ReqwestTransport::new(base).unwrap();

        let reply = pollster::block_on(transport.send_message("hello")).unwrap();
        assert_eq!(reply.response, "hi there");
        assert!(reply.sources.is_empty());

        let request = server.join().unwrap();
        assert!(request.starts_with("POST /api/chat/message HTTP/1.1"));
        assert!(request.to_ascii_lowercase().contains("content-type: application/json"));
        assert!(request.ends_with(r#"{"message":"hello"}"#));
    }

    #[test]
    fn http_500_reads_error_envelope() {
        let body = r#"{"error":"overloaded"}"#;
        let (base, _server) = serve_once(json_head("500 Internal Server Error", body), vec![body]);
        let transport = ReqwestTransport::new(base).unwrap();
        let err = pollster::block_on(transport.send_message("hello")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Http);
        assert_eq!(err.status(), Some(500));
        assert_eq!(err.to_string(), "overloaded");
    }

    #[test]
    fn refused_connection_is_connection_error() {
        let addr = TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap();
        // listener dropped: nothing accepts on addr any more
        let transport = ReqwestTransport::new(format!("http://{addr}/api")).unwrap();
        let err = pollster::block_on(transport.send_message("hello")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Connection);
        assert!(err.to_string().starts_with("Network error:"));
    }

    #[test]
    fn streamed_body_decodes_across_writes() {
        let head = "HTTP/1.1 200 OK\r\ncontent-type: text/event-stream\r\nconnection: close\r\n\r\n";
        let (base, _server) = serve_once(
            head.to_string(),
            vec!["data: {\"content\":\"A\"}\ndata: {\"con", "tent\":\"B\"}\n", "data: {\"done\":true}\n"],
        );
        let transport = ReqwestTransport::new(base).unwrap();
        let events = pollster::block_on(async {
            let chunks = transport.send_message_stream("hello").await?;
            let mut stream = ChatEventStream::new(chunks);
            let mut out = Vec::new();
            while let Some(ev) = stream.next().await {
                out.push(ev?);
            }
            Ok::<_, DispatchError>(out)
        })
        .unwrap();
        let contents: Vec<_> = events.iter().map(|e| e.content.clone()).collect();
        assert_eq!(contents, vec![Some("A".to_string()), Some("B".to_string()), None]);
        assert!(events.last().unwrap().done);
    }

    #[test]
    fn stream_status_failure_is_reported_before_body() {
        let head = "HTTP/1.1 503 Service Unavailable\r\ncontent-length: 0\r\nconnection: close\r\n\r\n";
        let (base, _server) = serve_once(head.to_string(), vec![]);
        let transport = ReqwestTransport::new(base).unwrap();
        let result = pollster::block_on(transport.send_message_stream("hello"));
        let Err(err) = result else {
            panic!("expected status failure");
        };
        assert_eq!(err.to_string(), "HTTP 503 Service Unavailable");
    }

    #[test]
    fn dropping_the_stream_closes_a_quiet_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let base = format!("http://{}/api", listener.local_addr().unwrap());
        // one event, then silence; reports whether the client hung up
        let server = thread::spawn(move || {
            let (mut conn, _) = listener.accept().unwrap();
            read_request(&mut conn);
            conn.write_all(
                b"HTTP/1.1 200 OK\r\ncontent-type: text/event-stream\r\n\r\ndata: {\"content\":\"A\"}\n",
            )
            .unwrap();
            conn.flush().unwrap();
            conn.set_read_timeout(Some(Duration::from_secs(3))).unwrap();
            let mut buf = [0u8; 64];
            match conn.read(&mut buf) {
                Ok(n) => n == 0,
                Err(e) => !matches!(e.kind(), IoErrorKind::WouldBlock | IoErrorKind::TimedOut),
            }
        });

        let transport = ReqwestTransport::new(base).unwrap();
        let first = pollster::block_on(async {
            let chunks = transport.send_message_stream("hello").await?;
            let mut stream = ChatEventStream::new(chunks);
            let first = stream.next().await;
            drop(stream);
            Ok::<_, DispatchError>(first)
        })
        .unwrap();
        assert_eq!(first.unwrap().unwrap().content.as_deref(), Some("A"));
        assert!(server.join().unwrap(), "connection outlived the dropped stream");
    }

    #[test]
    fn create_session_returns_opaque_id() {
        let body = r#"{"id":"abc-123"}"#;
        let (base, server) = serve_once(json_head("200 OK", body), vec![body]);
        let transport = ReqwestTransport::new(base).unwrap();
        let info = pollster::block_on(transport.create_session()).unwrap();
        assert_eq!(info.id, "abc-123");
        assert!(server.join().unwrap().starts_with("POST /api/sessions"));
    }
}
