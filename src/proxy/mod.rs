//! Proxy frontend
//!
//! Owns the listen socket and dispatches each accepted connection: CONNECT
//! requests stay on the raw socket and become tunnels, everything else is
//! served as HTTP/1 with a bounded retry loop against discovered instances.

pub mod transfer;

pub use transfer::TransferPair;

use std::sync::Arc;
use std::time::Duration;

use http_body_util::{BodyExt, Full};
use hyper::body::{Bytes, Incoming};
use hyper::header::{self, HeaderMap, HeaderValue};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request, Response, StatusCode, Uri};
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use crate::discovery::Selector;
use crate::error::{ProxyError, Result};

/// Sent verbatim once a tunnel's backend leg is connected
const TUNNEL_ESTABLISHED: &[u8] = b"HTTP/1.0 200 Connection Established\r\n\r\n";

const CONNECT_PREFIX: &[u8] = b"CONNECT ";
const MAX_HEAD_SIZE: usize = 8192;

type HttpClient = Client<HttpConnector, Full<Bytes>>;

/// Listening forward proxy
pub struct ProxyFrontend {
    listener: TcpListener,
    handler: ConnHandler,
    shutdown: CancellationToken,
}

#[derive(Clone)]
struct ConnHandler {
    selector: Arc<Selector>,
    transport: HttpClient,
    retry_times: u32,
}

impl ProxyFrontend {
    /// Bind the listen socket and build the upstream transport
    pub async fn bind(
        listen_addr: &str,
        retry_times: u32,
        selector: Arc<Selector>,
        shutdown: CancellationToken,
    ) -> Result<Self> {
        let listener = TcpListener::bind(listen_addr).await?;

        let mut connector = HttpConnector::new();
        connector.set_connect_timeout(Some(Duration::from_secs(5)));
        // Keep-alives stay off so every retry attempt gets a fresh upstream
        // connection and cannot observe poisoned state.
        let transport = Client::builder(TokioExecutor::new())
            .pool_max_idle_per_host(0)
            .build(connector);

        Ok(Self {
            listener,
            handler: ConnHandler {
                selector,
                transport,
                retry_times,
            },
            shutdown,
        })
    }

    /// Bound address (useful when listening on port 0)
    pub fn local_addr(&self) -> Result<std::net::SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accept loop; returns after the shutdown token fires
    pub async fn run(self) -> Result<()> {
        if let Ok(addr) = self.listener.local_addr() {
            tracing::info!(%addr, "proxy listening");
        }
        loop {
            let (stream, peer) = tokio::select! {
                _ = self.shutdown.cancelled() => {
                    tracing::info!("proxy accept loop stopped");
                    return Ok(());
                }
                accepted = self.listener.accept() => match accepted {
                    Ok(pair) => pair,
                    Err(err) => {
                        tracing::warn!(error = %err, "accept failed");
                        continue;
                    }
                },
            };
            let handler = self.handler.clone();
            tokio::spawn(async move {
                if let Err(err) = handler.serve(stream).await {
                    tracing::debug!(peer = %peer, error = %err, "connection ended with error");
                }
            });
        }
    }
}

impl ConnHandler {
    /// Dispatch one accepted connection by sniffing the request line
    async fn serve(self, stream: TcpStream) -> Result<()> {
        let mut probe = [0u8; CONNECT_PREFIX.len()];
        let is_connect = loop {
            let n = stream.peek(&mut probe).await?;
            if n == 0 {
                // Client went away before sending anything.
                return Ok(());
            }
            if probe[..n] != CONNECT_PREFIX[..n] {
                break false;
            }
            if n == CONNECT_PREFIX.len() {
                break true;
            }
            // A strict prefix of "CONNECT " so far; wait for the rest.
            tokio::time::sleep(Duration::from_millis(10)).await;
        };

        if is_connect {
            self.handle_connect(stream).await
        } else {
            let handler = self.clone();
            http1::Builder::new()
                .serve_connection(
                    TokioIo::new(stream),
                    service_fn(move |req| {
                        let handler = handler.clone();
                        async move { handler.handle_http(req).await }
                    }),
                )
                .await?;
            Ok(())
        }
    }

    /// Plain-HTTP path: buffer the body, then retry selection + forwarding.
    /// Returning `Err` makes hyper drop the connection without a response;
    /// when the client itself disconnects, hyper drops this future and the
    /// in-flight attempt is abandoned with it.
    async fn handle_http(&self, req: Request<Incoming>) -> Result<Response<Full<Bytes>>> {
        let (parts, body) = req.into_parts();
        // Buffered once so it can be replayed byte-identical on every attempt.
        let body_bytes = body.collect().await?.to_bytes();

        let authority = request_authority(&parts)
            .ok_or_else(|| ProxyError::BadRequest("request has no destination host".to_string()))?;
        let service_name = host_of(&authority).to_string();
        let path_and_query = parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .unwrap_or_else(|| "/".to_string());

        for attempt in 1..=self.retry_times {
            let selected = match self.selector.select(&service_name).await {
                Ok(instance) => Some(instance),
                Err(err) => {
                    tracing::debug!(service = %service_name, error = %err, "selection failed, falling back to DNS");
                    None
                }
            };
            let target = selected
                .as_ref()
                .map(|i| i.authority())
                .unwrap_or_else(|| authority.clone());

            match self
                .attempt_http(&parts, &path_and_query, &target, &authority, body_bytes.clone())
                .await
            {
                Ok(response) => {
                    if let Some(instance) = &selected {
                        self.selector.mark_success(&instance.service_name, &instance.id);
                    }
                    return Ok(response);
                }
                Err(err) => {
                    if let Some(instance) = &selected {
                        self.selector.mark_fail(&instance.service_name, &instance.id);
                    }
                    tracing::debug!(attempt, target = %target, error = %err, "forward attempt failed");
                }
            }
        }

        // Every attempt failed: bare 500, no body, no custom headers.
        let mut response = Response::new(Full::new(Bytes::new()));
        *response.status_mut() = StatusCode::INTERNAL_SERVER_ERROR;
        Ok(response)
    }

    /// One forwarding attempt: rewrite the destination to the chosen target,
    /// keep the original Host, read the full answer
    async fn attempt_http(
        &self,
        parts: &hyper::http::request::Parts,
        path_and_query: &str,
        target: &str,
        authority: &str,
        body: Bytes,
    ) -> Result<Response<Full<Bytes>>> {
        let uri: Uri = format!("http://{}{}", target, path_and_query)
            .parse()
            .map_err(|_| ProxyError::BadRequest(format!("bad forward target: {}", target)))?;

        let mut outbound = Request::builder()
            .method(parts.method.clone())
            .uri(uri)
            .body(Full::new(body))
            .map_err(|e| ProxyError::BadRequest(e.to_string()))?;
        for (name, value) in parts.headers.iter() {
            if is_hop_by_hop(name.as_str()) || *name == header::HOST {
                continue;
            }
            outbound.headers_mut().append(name.clone(), value.clone());
        }
        // The client-supplied authority travels upstream even though the
        // connection goes to the discovered instance.
        if let Ok(host) = HeaderValue::from_str(authority) {
            outbound.headers_mut().insert(header::HOST, host);
        }

        let upstream = self.transport.request(outbound).await?;
        let (mut head, body) = upstream.into_parts();
        let body = body.collect().await?.to_bytes();

        strip_connection_headers(&mut head.headers);
        Ok(Response::from_parts(head, Full::new(body)))
    }

    /// CONNECT path: the whole exchange happens on the raw socket
    async fn handle_connect(&self, mut client: TcpStream) -> Result<()> {
        let (head, leftover) = read_request_head(&mut client).await?;
        let target = parse_connect_target(&head)?;
        let service_name = host_of(&target).to_string();

        let mut server = None;
        for attempt in 1..=self.retry_times {
            let selected = match self.selector.select(&service_name).await {
                Ok(instance) => Some(instance),
                Err(err) => {
                    tracing::debug!(service = %service_name, error = %err, "selection failed, falling back to DNS");
                    None
                }
            };
            let addr = selected
                .as_ref()
                .map(|i| i.authority())
                .unwrap_or_else(|| target.clone());

            let dialed = tokio::select! {
                conn = TcpStream::connect(addr.clone()) => conn,
                _ = client_gone(&client) => {
                    tracing::debug!(target = %target, "client left before the tunnel was up");
                    return Ok(());
                }
            };
            match dialed {
                Ok(conn) => {
                    if let Some(instance) = &selected {
                        self.selector.mark_success(&instance.service_name, &instance.id);
                    }
                    server = Some(conn);
                    break;
                }
                Err(err) => {
                    if let Some(instance) = &selected {
                        self.selector.mark_fail(&instance.service_name, &instance.id);
                    }
                    tracing::debug!(attempt, target = %addr, error = %err, "tunnel dial failed");
                }
            }
        }
        let mut server = match server {
            Some(conn) => conn,
            // All dials failed: close without writing anything back.
            None => return Ok(()),
        };

        client.write_all(TUNNEL_ESTABLISHED).await?;
        if !leftover.is_empty() {
            // Bytes the client optimistically sent right after its head.
            server.write_all(&leftover).await?;
        }

        match TransferPair::new(client, server).run().await {
            Ok(()) => tracing::debug!(target = %target, "tunnel closed"),
            Err(err) => tracing::debug!(target = %target, error = %err, "tunnel torn down"),
        }
        Ok(())
    }
}

/// Resolves when the client closes while we are still dialing the backend
async fn client_gone(stream: &TcpStream) {
    let mut probe = [0u8; 1];
    loop {
        match stream.peek(&mut probe).await {
            Ok(0) | Err(_) => return,
            // Early tunnel bytes; the dial decides what happens next.
            Ok(_) => tokio::time::sleep(Duration::from_millis(50)).await,
        }
    }
}

/// Read up to and including the blank line ending the request head; any
/// surplus already read is returned separately
async fn read_request_head(stream: &mut TcpStream) -> Result<(Vec<u8>, Vec<u8>)> {
    let mut head = Vec::with_capacity(512);
    let mut buf = [0u8; 1024];
    loop {
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            return Err(ProxyError::BadRequest(
                "connection closed before request head".to_string(),
            ));
        }
        head.extend_from_slice(&buf[..n]);
        if let Some(end) = find_head_end(&head) {
            let leftover = head.split_off(end);
            return Ok((head, leftover));
        }
        if head.len() > MAX_HEAD_SIZE {
            return Err(ProxyError::BadRequest("request head too large".to_string()));
        }
    }
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4)
}

/// Extract `host:port` from a CONNECT request line
fn parse_connect_target(head: &[u8]) -> Result<String> {
    let line_end = head
        .windows(2)
        .position(|w| w == b"\r\n")
        .unwrap_or(head.len());
    let line = std::str::from_utf8(&head[..line_end])
        .map_err(|_| ProxyError::BadRequest("request line is not valid UTF-8".to_string()))?;

    let mut fields = line.split_whitespace();
    match (fields.next(), fields.next()) {
        (Some("CONNECT"), Some(target)) if target.contains(':') => Ok(target.to_string()),
        _ => Err(ProxyError::BadRequest(format!(
            "not a CONNECT request: {}",
            line
        ))),
    }
}

/// Destination authority of an inbound request: absolute-form URI first,
/// Host header as the fallback
fn request_authority(parts: &hyper::http::request::Parts) -> Option<String> {
    parts
        .uri
        .authority()
        .map(|a| a.as_str().to_string())
        .or_else(|| {
            parts
                .headers
                .get(header::HOST)
                .and_then(|v| v.to_str().ok())
                .map(|s| s.to_string())
        })
}

/// Host portion of an authority, used as the catalog service name
fn host_of(authority: &str) -> &str {
    if let Some(rest) = authority.strip_prefix('[') {
        if let Some(end) = rest.find(']') {
            return &rest[..end];
        }
    }
    match authority.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() && port.chars().all(|c| c.is_ascii_digit()) => host,
        _ => authority,
    }
}

fn is_hop_by_hop(name: &str) -> bool {
    matches!(
        name.to_ascii_lowercase().as_str(),
        "connection"
            | "proxy-connection"
            | "keep-alive"
            | "te"
            | "trailer"
            | "transfer-encoding"
            | "upgrade"
            | "proxy-authorization"
            | "proxy-authenticate"
    )
}

/// Drop connection-management headers from an upstream response; the body is
/// re-framed with a plain content length on the way back out
fn strip_connection_headers(headers: &mut HeaderMap) {
    for name in [
        "connection",
        "proxy-connection",
        "keep-alive",
        "transfer-encoding",
        "trailer",
        "upgrade",
    ] {
        headers.remove(name);
    }
}
