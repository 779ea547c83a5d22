use std::future::Future;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::net::TcpListener;
#[cfg(unix)]
use tokio::net::UnixListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use super::{BoxedTransport, Peer};
use crate::types::{SessionId, SessionRole, VtpError};
use crate::whitelist::Whitelist;

enum Listener {
    Tcp(TcpListener),
    #[cfg(unix)]
    Unix(UnixListener, String),
}

/// Accepts connections and hands each one to a protocol handler on its own
/// task.
pub struct VtpServer {
    listener: Listener,
    role: SessionRole,
    whitelist: Arc<Whitelist>,
    next_session_id: Arc<AtomicU64>,
}

impl VtpServer {
    /// Bind a TCP listener.
    pub async fn bind(addr: &str, role: SessionRole) -> Result<Self, VtpError> {
        let listener = TcpListener::bind(addr).await?;
        info!(%role, addr, "listening");
        Ok(Self::from_listener(Listener::Tcp(listener), role))
    }

    /// Bind a Unix-domain listener. The whitelist does not apply to it.
    #[cfg(unix)]
    pub fn bind_unix(path: &str, role: SessionRole) -> Result<Self, VtpError> {
        let listener = UnixListener::bind(path)?;
        info!(%role, path, "listening on unix socket");
        Ok(Self::from_listener(
            Listener::Unix(listener, path.to_string()),
            role,
        ))
    }

    fn from_listener(listener: Listener, role: SessionRole) -> Self {
        Self {
            listener,
            role,
            whitelist: Arc::new(Whitelist::default()),
            next_session_id: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Only admit TCP peers inside `whitelist`.
    pub fn with_whitelist(mut self, whitelist: Whitelist) -> Self {
        self.whitelist = Arc::new(whitelist);
        self
    }

    /// Address of a TCP listener.
    pub fn local_addr(&self) -> Result<SocketAddr, VtpError> {
        match &self.listener {
            Listener::Tcp(l) => Ok(l.local_addr()?),
            #[cfg(unix)]
            Listener::Unix(_, path) => Err(VtpError::config(format!(
                "{path} is a unix socket and has no IP address"
            ))),
        }
    }

    async fn accept(&self) -> std::io::Result<(BoxedTransport, Peer)> {
        match &self.listener {
            Listener::Tcp(l) => {
                let (socket, addr) = l.accept().await?;
                let _ = socket.set_nodelay(true);
                let io: BoxedTransport = Box::new(socket);
                Ok((io, Peer::Tcp(addr)))
            }
            #[cfg(unix)]
            Listener::Unix(l, path) => {
                let (socket, _) = l.accept().await?;
                let io: BoxedTransport = Box::new(socket);
                Ok((io, Peer::Unix(path.clone())))
            }
        }
    }

    fn admits(&self, peer: &Peer) -> bool {
        match peer {
            Peer::Tcp(addr) => self.whitelist.allows(addr.ip()),
            Peer::Unix(_) => true,
        }
    }

    /// Accept connections until `shutdown` is cancelled.
    ///
    /// Each admitted connection runs `handler` on a new task, inside a span
    /// carrying the session id, peer and role.
    pub async fn run<F, Fut>(self, shutdown: CancellationToken, handler: F) -> Result<(), VtpError>
    where
        F: Fn(SessionId, Peer, BoxedTransport) -> Fut + Send + Sync + Clone + 'static,
        Fut: Future<Output = Result<(), VtpError>> + Send + 'static,
    {
        loop {
            let accepted = tokio::select! {
                _ = shutdown.cancelled() => break,
                accepted = self.accept() => accepted,
            };

            let (io, peer) = match accepted {
                Ok(conn) => conn,
                Err(e) => {
                    error!(role = %self.role, error = %e, "failed to accept connection");
                    continue;
                }
            };

            if !self.admits(&peer) {
                warn!(role = %self.role, %peer, "connection refused: not in whitelist");
                continue;
            }

            let session_id = self.next_session_id.fetch_add(1, Ordering::Relaxed);
            let span = info_span!("connection", session = session_id, %peer, role = %self.role);
            let handler = handler.clone();
            tokio::spawn(
                async move {
                    info!("connection opened");
                    match handler(session_id, peer, io).await {
                        Ok(()) => info!("connection closed"),
                        Err(e) => debug!(error = %e, "connection ended with error"),
                    }
                }
                .instrument(span),
            );
        }

        info!(role = %self.role, "listener stopped");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use tokio::io::AsyncReadExt;
    use tokio::net::TcpStream;

    use super::*;

    #[tokio::test]
    async fn refused_peers_never_reach_the_handler() {
        let server = VtpServer::bind("127.0.0.1:0", SessionRole::Receiver)
            .await
            .unwrap()
            .with_whitelist(Whitelist::parse(&["10.0.0.0/8"]).unwrap());
        let addr = server.local_addr().unwrap();
        let calls = Arc::new(AtomicUsize::new(0));
        let shutdown = CancellationToken::new();

        let counted = Arc::clone(&calls);
        let task = tokio::spawn(server.run(shutdown.clone(), move |_, _, _| {
            let counted = Arc::clone(&counted);
            async move {
                counted.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
        }));

        let mut client = TcpStream::connect(addr).await.unwrap();
        let mut buf = [0u8; 1];
        assert_eq!(client.read(&mut buf).await.unwrap(), 0);
        assert_eq!(calls.load(Ordering::SeqCst), 0);

        shutdown.cancel();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn admitted_peers_get_distinct_sessions() {
        let server = VtpServer::bind("127.0.0.1:0", SessionRole::Receiver)
            .await
            .unwrap();
        let addr = server.local_addr().unwrap();
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();

        let task = tokio::spawn(server.run(shutdown.clone(), move |id, peer, _io| {
            let tx = tx.clone();
            async move {
                let _ = tx.send((id, peer));
                Ok(())
            }
        }));

        let _a = TcpStream::connect(addr).await.unwrap();
        let _b = TcpStream::connect(addr).await.unwrap();
        let (first, peer) = rx.recv().await.unwrap();
        let (second, _) = rx.recv().await.unwrap();
        assert_ne!(first, second);
        assert!(matches!(peer, Peer::Tcp(a) if a.ip().is_loopback()));

        shutdown.cancel();
        task.await.unwrap().unwrap();
    }
}
