//! End-to-end proxy scenarios over real sockets

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use discovery_proxy::discovery::{
    CatalogConfig, InstanceSource, RawInstance, Selector, ServiceCatalog,
};
use discovery_proxy::proxy::ProxyFrontend;

const TUNNEL_ESTABLISHED: &[u8] = b"HTTP/1.0 200 Connection Established\r\n\r\n";

/// Registry stub answering from a fixed service map
struct MapSource(HashMap<String, Vec<RawInstance>>);

#[async_trait]
impl InstanceSource for MapSource {
    async fn fetch_healthy(
        &self,
        service: &str,
        _group: &str,
    ) -> discovery_proxy::Result<Vec<RawInstance>> {
        Ok(self.0.get(service).cloned().unwrap_or_default())
    }
}

fn instance(id: &str, port: u16) -> RawInstance {
    RawInstance {
        id: id.to_string(),
        ip: "127.0.0.1".to_string(),
        port,
        weight: 1.0,
        cluster: "main".to_string(),
    }
}

async fn start_proxy(
    services: HashMap<String, Vec<RawInstance>>,
) -> (std::net::SocketAddr, CancellationToken) {
    let catalog = Arc::new(ServiceCatalog::new(
        Arc::new(MapSource(services)),
        "g",
        CatalogConfig::default(),
    ));
    let selector = Arc::new(Selector::new(catalog));
    let token = CancellationToken::new();
    let frontend = ProxyFrontend::bind("127.0.0.1:0", 3, selector, token.child_token())
        .await
        .unwrap();
    let addr = frontend.local_addr().unwrap();
    tokio::spawn(frontend.run());
    (addr, token)
}

async fn read_until_close(stream: &mut TcpStream) -> Vec<u8> {
    let mut bytes = Vec::new();
    stream.read_to_end(&mut bytes).await.unwrap();
    bytes
}

#[tokio::test]
async fn http_request_is_rewritten_to_the_discovered_instance() {
    // Backend answering one canned response per connection.
    let backend = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let backend_port = backend.local_addr().unwrap().port();
    let seen_request = Arc::new(tokio::sync::Mutex::new(Vec::new()));
    let seen = seen_request.clone();
    tokio::spawn(async move {
        let (mut conn, _) = backend.accept().await.unwrap();
        let mut buf = vec![0u8; 4096];
        let mut collected: Vec<u8> = Vec::new();
        loop {
            let n = conn.read(&mut buf).await.unwrap();
            collected.extend_from_slice(&buf[..n]);
            let head_end = collected.windows(4).position(|w| w == b"\r\n\r\n").map(|p| p + 4);
            // Head plus the 6 body bytes announced by the client.
            if matches!(head_end, Some(end) if collected.len() >= end + 6) {
                break;
            }
        }
        *seen.lock().await = collected;
        conn.write_all(
            b"HTTP/1.1 200 OK\r\n\
              Content-Type: text/plain\r\n\
              Set-Cookie: a=1\r\n\
              Set-Cookie: b=2\r\n\
              Content-Length: 18\r\n\r\n\
              hello-from-backend",
        )
        .await
        .unwrap();
    });

    let services = HashMap::from([(
        "backend-svc".to_string(),
        vec![instance("b1", backend_port)],
    )]);
    let (proxy_addr, _token) = start_proxy(services).await;

    let mut client = TcpStream::connect(proxy_addr).await.unwrap();
    client
        .write_all(
            b"POST http://backend-svc/path?x=1 HTTP/1.1\r\n\
              Host: backend-svc\r\n\
              Content-Length: 6\r\n\
              X-Probe: 1\r\n\
              Connection: close\r\n\r\n\
              abc123",
        )
        .await
        .unwrap();

    let response = String::from_utf8(read_until_close(&mut client).await).unwrap();
    assert!(response.starts_with("HTTP/1.1 200"), "got: {response}");
    let lower = response.to_lowercase();
    let cookie_a = lower.find("set-cookie: a=1").expect("first cookie");
    let cookie_b = lower.find("set-cookie: b=2").expect("second cookie");
    assert!(cookie_a < cookie_b, "multi-value header order lost");
    assert!(response.ends_with("hello-from-backend"));

    // The backend saw an origin-form request with the original Host and the
    // buffered body forwarded byte for byte.
    let request = seen_request.lock().await.clone();
    let head = String::from_utf8_lossy(&request).to_lowercase();
    assert!(head.starts_with("post /path?x=1 http/1.1"), "got: {head}");
    assert!(head.contains("host: backend-svc"));
    assert!(head.contains("x-probe: 1"));
    assert!(request.ends_with(b"abc123"));
}

#[tokio::test]
async fn client_disconnect_abandons_the_attempt() {
    // Backend that accepts but never answers, counting attempts.
    let backend = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let backend_port = backend.local_addr().unwrap().port();
    let attempts = Arc::new(AtomicUsize::new(0));
    let counter = attempts.clone();
    tokio::spawn(async move {
        loop {
            let (conn, _) = match backend.accept().await {
                Ok(pair) => pair,
                Err(_) => return,
            };
            counter.fetch_add(1, Ordering::SeqCst);
            tokio::spawn(async move {
                // Hold the connection open without responding.
                tokio::time::sleep(std::time::Duration::from_secs(30)).await;
                drop(conn);
            });
        }
    });

    let services = HashMap::from([("slow".to_string(), vec![instance("s1", backend_port)])]);
    let (proxy_addr, _token) = start_proxy(services).await;

    let mut client = TcpStream::connect(proxy_addr).await.unwrap();
    client
        .write_all(b"GET http://slow/ HTTP/1.1\r\nHost: slow\r\n\r\n")
        .await
        .unwrap();

    // Give the first attempt time to start, then walk away.
    tokio::time::sleep(std::time::Duration::from_millis(300)).await;
    assert_eq!(attempts.load(Ordering::SeqCst), 1);
    drop(client);

    // The abandoned request must not burn further attempts.
    tokio::time::sleep(std::time::Duration::from_secs(1)).await;
    assert_eq!(attempts.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn exhausted_retries_surface_a_bare_500() {
    // Backend that accepts and slams the connection shut, counting attempts.
    let backend = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let backend_port = backend.local_addr().unwrap().port();
    let attempts = Arc::new(AtomicUsize::new(0));
    let counter = attempts.clone();
    tokio::spawn(async move {
        loop {
            let (conn, _) = match backend.accept().await {
                Ok(pair) => pair,
                Err(_) => return,
            };
            counter.fetch_add(1, Ordering::SeqCst);
            drop(conn);
        }
    });

    let services = HashMap::from([("flaky".to_string(), vec![instance("f1", backend_port)])]);
    let (proxy_addr, _token) = start_proxy(services).await;

    let mut client = TcpStream::connect(proxy_addr).await.unwrap();
    client
        .write_all(
            b"GET http://flaky/ HTTP/1.1\r\n\
              Host: flaky\r\n\
              Connection: close\r\n\r\n",
        )
        .await
        .unwrap();

    let response = String::from_utf8(read_until_close(&mut client).await).unwrap();
    assert!(response.starts_with("HTTP/1.1 500"), "got: {response}");
    // Bare status: nothing after the header block.
    let body_start = response.find("\r\n\r\n").expect("header block end") + 4;
    assert_eq!(&response[body_start..], "");

    assert_eq!(attempts.load(Ordering::SeqCst), 3);
}

async fn spawn_echo_backend() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    tokio::spawn(async move {
        loop {
            let (mut conn, _) = match listener.accept().await {
                Ok(pair) => pair,
                Err(_) => return,
            };
            tokio::spawn(async move {
                let mut buf = [0u8; 1024];
                loop {
                    match conn.read(&mut buf).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => {
                            if conn.write_all(&buf[..n]).await.is_err() {
                                return;
                            }
                        }
                    }
                }
            });
        }
    });
    port
}

#[tokio::test]
async fn connect_tunnel_reaches_the_discovered_instance() {
    let echo_port = spawn_echo_backend().await;

    // The CONNECT names port 443; discovery rewrites to the real backend.
    let services = HashMap::from([("tunnelsvc".to_string(), vec![instance("t1", echo_port)])]);
    let (proxy_addr, _token) = start_proxy(services).await;

    let mut client = TcpStream::connect(proxy_addr).await.unwrap();
    client
        .write_all(b"CONNECT tunnelsvc:443 HTTP/1.1\r\nHost: tunnelsvc:443\r\n\r\n")
        .await
        .unwrap();

    let mut sentinel = vec![0u8; TUNNEL_ESTABLISHED.len()];
    client.read_exact(&mut sentinel).await.unwrap();
    assert_eq!(sentinel, TUNNEL_ESTABLISHED);

    client.write_all(b"ping-through-tunnel").await.unwrap();
    let mut reply = vec![0u8; b"ping-through-tunnel".len()];
    client.read_exact(&mut reply).await.unwrap();
    assert_eq!(&reply, b"ping-through-tunnel");

    client.shutdown().await.unwrap();
    let mut rest = Vec::new();
    client.read_to_end(&mut rest).await.unwrap();
    assert!(rest.is_empty());
}

#[tokio::test]
async fn connect_falls_back_to_dns_when_discovery_misses() {
    let echo_port = spawn_echo_backend().await;

    // No services registered at all: the raw target is dialed directly.
    let (proxy_addr, _token) = start_proxy(HashMap::new()).await;

    let head = format!("CONNECT 127.0.0.1:{echo_port} HTTP/1.1\r\nHost: 127.0.0.1:{echo_port}\r\n\r\n");
    let mut client = TcpStream::connect(proxy_addr).await.unwrap();
    client.write_all(head.as_bytes()).await.unwrap();

    let mut sentinel = vec![0u8; TUNNEL_ESTABLISHED.len()];
    client.read_exact(&mut sentinel).await.unwrap();
    assert_eq!(sentinel, TUNNEL_ESTABLISHED);

    client.write_all(b"echo").await.unwrap();
    let mut reply = [0u8; 4];
    client.read_exact(&mut reply).await.unwrap();
    assert_eq!(&reply, b"echo");
}
