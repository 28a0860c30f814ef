//! Established CONNECT tunnels
//!
//! Splices bytes between the proxy client and the backend instance. EOF on
//! one direction is propagated as a half-close so trailing bytes on the other
//! direction still flow; a tunnel stuck half-closed is killed after an idle
//! bound.

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

use crate::error::{ProxyError, Result};

const COPY_BUF_SIZE: usize = 4096;
const SUPERVISE_TICK: Duration = Duration::from_millis(50);
const HALF_CLOSE_IDLE_LIMIT: Duration = Duration::from_secs(3);

#[derive(Debug, Clone, Copy)]
enum Side {
    Client,
    Server,
}

#[derive(Default)]
struct Flags {
    client_eof: bool,
    server_eof: bool,
    error: Option<io::Error>,
}

struct Shared {
    flags: Mutex<Flags>,
    started: Instant,
    last_active_ms: AtomicU64,
}

impl Shared {
    fn locked(&self) -> MutexGuard<'_, Flags> {
        self.flags.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn touch(&self) {
        self.last_active_ms
            .store(self.started.elapsed().as_millis() as u64, Ordering::Relaxed);
    }

    fn idle(&self) -> Duration {
        let now = self.started.elapsed().as_millis() as u64;
        Duration::from_millis(now.saturating_sub(self.last_active_ms.load(Ordering::Relaxed)))
    }

    fn fail(&self, err: io::Error) {
        let mut flags = self.locked();
        if flags.error.is_none() {
            flags.error = Some(err);
        }
    }
}

/// A client/server socket pair forming one tunnel
pub struct TransferPair {
    client: TcpStream,
    server: TcpStream,
}

impl TransferPair {
    pub fn new(client: TcpStream, server: TcpStream) -> Self {
        Self { client, server }
    }

    /// Run both forwarding directions to completion. Returns once the tunnel
    /// is fully resolved; both sockets are closed by then.
    pub async fn run(self) -> Result<()> {
        let shared = Arc::new(Shared {
            flags: Mutex::new(Flags::default()),
            started: Instant::now(),
            last_active_ms: AtomicU64::new(0),
        });
        shared.touch();

        let (client_read, client_write) = self.client.into_split();
        let (server_read, server_write) = self.server.into_split();

        let client_to_server = tokio::spawn(forward(
            client_read,
            server_write,
            Side::Client,
            shared.clone(),
        ));
        let server_to_client = tokio::spawn(forward(
            server_read,
            client_write,
            Side::Server,
            shared.clone(),
        ));

        let result = supervise(&shared).await;

        // Aborting drops the split halves, which closes whatever is still
        // open on both sockets.
        client_to_server.abort();
        server_to_client.abort();
        let _ = client_to_server.await;
        let _ = server_to_client.await;

        result
    }
}

async fn forward(mut from: OwnedReadHalf, mut to: OwnedWriteHalf, side: Side, shared: Arc<Shared>) {
    let mut buf = [0u8; COPY_BUF_SIZE];
    loop {
        match from.read(&mut buf).await {
            // Peer sent FIN: propagate as a half-close and let the other
            // direction keep draining.
            Ok(0) => {
                {
                    let mut flags = shared.locked();
                    match side {
                        Side::Client => flags.client_eof = true,
                        Side::Server => flags.server_eof = true,
                    }
                }
                let _ = to.shutdown().await;
                return;
            }
            Ok(n) => {
                if let Err(err) = to.write_all(&buf[..n]).await {
                    shared.fail(err);
                    return;
                }
                shared.touch();
            }
            Err(err) => {
                shared.fail(err);
                return;
            }
        }
    }
}

async fn supervise(shared: &Shared) -> Result<()> {
    loop {
        {
            let mut flags = shared.locked();
            if let Some(err) = flags.error.take() {
                return Err(ProxyError::Io(err));
            }
            if flags.client_eof && flags.server_eof {
                return Ok(());
            }
            if flags.client_eof != flags.server_eof && shared.idle() >= HALF_CLOSE_IDLE_LIMIT {
                return Err(ProxyError::HalfCloseIdle);
            }
        }
        tokio::time::sleep(SUPERVISE_TICK).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;
    use tokio_test::assert_ok;

    async fn tcp_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (outer, inner) = tokio::join!(TcpStream::connect(addr), async {
            listener.accept().await.map(|(s, _)| s)
        });
        (outer.unwrap(), inner.unwrap())
    }

    #[tokio::test]
    async fn relays_bytes_and_propagates_half_close() {
        let (mut client, client_inner) = tcp_pair().await;
        let (mut server, server_inner) = tcp_pair().await;

        let tunnel = tokio::spawn(TransferPair::new(client_inner, server_inner).run());

        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        server.write_all(b"pong").await.unwrap();
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");

        // Server finishes; its FIN must surface on the client side while the
        // client->server direction stays usable.
        server.shutdown().await.unwrap();
        assert_eq!(client.read(&mut buf).await.unwrap(), 0);

        client.write_all(b"tail").await.unwrap();
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"tail");

        client.shutdown().await.unwrap();
        assert_ok!(tunnel.await.unwrap());
    }

    #[tokio::test]
    async fn kills_a_tunnel_stuck_half_closed() {
        let (mut client, client_inner) = tcp_pair().await;
        let (mut server, server_inner) = tcp_pair().await;

        let tunnel = tokio::spawn(TransferPair::new(client_inner, server_inner).run());

        // Server sends a burst and finishes; the client neither answers nor
        // closes.
        server.write_all(&[7u8; 1024]).await.unwrap();
        server.shutdown().await.unwrap();

        let mut received = vec![0u8; 1024];
        client.read_exact(&mut received).await.unwrap();

        let begin = Instant::now();
        let result = tunnel.await.unwrap();
        assert!(matches!(result, Err(ProxyError::HalfCloseIdle)));
        let waited = begin.elapsed();
        assert!(waited >= Duration::from_millis(2500), "killed too early: {waited:?}");
        assert!(waited < Duration::from_secs(6), "killed too late: {waited:?}");

        // Both sockets are gone once run() returns.
        let mut buf = [0u8; 1];
        assert_eq!(client.read(&mut buf).await.unwrap_or(0), 0);
    }
}
