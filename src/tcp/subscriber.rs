//! Persistent outbound subscription to an upstream broker.
//!
//! A subscriber answers its upstream's `iamalive` and `authenticate`
//! messages and acknowledges every event it is sent. Events which fail
//! validation are acknowledged too (a `nak` would get us dropped from the
//! upstream's distribution list) but are otherwise ignored.

use std::future::Future;
use std::io;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::task::JoinSet;
use tokio::time::{sleep, Instant};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};

use super::Transport;
use crate::backoff::{BackoffConfig, ReconnectPolicy};
use crate::codec::VtpFrameCodec;
use crate::document::Event;
use crate::messages::{classify, Inbound, TransportMessage, TransportRole};
use crate::pipeline::{HandlerChain, ValidatorChain};
use crate::types::{SessionRole, VtpError, DEFAULT_MAX_FRAME_LEN};

/// Silence from upstream for this long means it has forgotten us.
pub const DEFAULT_ALIVE_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Clone)]
pub struct SubscriberConfig {
    pub local_ivo: String,
    /// XPath filters sent to the upstream when it asks us to authenticate.
    pub filters: Vec<String>,
    pub timeout: Duration,
    pub max_frame_len: usize,
}

impl SubscriberConfig {
    pub fn new(local_ivo: impl Into<String>) -> Self {
        Self {
            local_ivo: local_ivo.into(),
            filters: Vec::new(),
            timeout: DEFAULT_ALIVE_TIMEOUT,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }
}

/// Subscriber protocol handler.
#[derive(Clone)]
pub struct Subscriber {
    config: Arc<SubscriberConfig>,
    validators: ValidatorChain,
    handlers: HandlerChain,
}

type Conn<T> = Framed<T, VtpFrameCodec>;

impl Subscriber {
    pub fn new(config: SubscriberConfig, validators: ValidatorChain, handlers: HandlerChain) -> Self {
        Self {
            config: Arc::new(config),
            validators,
            handlers,
        }
    }

    pub fn config(&self) -> &SubscriberConfig {
        &self.config
    }

    /// Run one connection until it closes, times out or `shutdown` fires.
    ///
    /// On timeout, handlers still running for events from this connection
    /// are aborted. Otherwise they are left to finish.
    pub async fn session<T: Transport>(&self, io: T, shutdown: &CancellationToken) -> Result<(), VtpError> {
        let mut conn = Framed::new(io, VtpFrameCodec::new(self.config.max_frame_len));
        let mut tasks = JoinSet::new();
        let timeout = self.config.timeout;
        let deadline = sleep(timeout);
        tokio::pin!(deadline);

        let result = loop {
            tokio::select! {
                _ = shutdown.cancelled() => break Ok(()),
                _ = &mut deadline => {
                    info!(timeout = ?timeout, "no iamalive received; disconnecting");
                    tasks.abort_all();
                    break Err(VtpError::Timeout(timeout));
                }
                Some(_) = tasks.join_next(), if !tasks.is_empty() => {}
                frame = conn.next() => match frame {
                    None => break Ok(()),
                    Some(Err(e)) => break Err(e),
                    Some(Ok(payload)) => {
                        if let Some(inbound) = Self::parse(payload) {
                            deadline.as_mut().reset(Instant::now() + timeout);
                            if let Err(e) = self.respond(&mut conn, &mut tasks, inbound).await {
                                break Err(e);
                            }
                        }
                    }
                },
            }
        };

        tasks.detach_all();
        let _ = conn.close().await;
        result
    }

    fn parse(payload: Bytes) -> Option<Inbound> {
        match classify(payload) {
            Ok(inbound) => Some(inbound),
            Err(e) => {
                warn!(error = %e, "unparsable message received");
                None
            }
        }
    }

    async fn respond<T: Transport>(
        &self,
        conn: &mut Conn<T>,
        tasks: &mut JoinSet<()>,
        inbound: Inbound,
    ) -> Result<(), VtpError> {
        let local = &self.config.local_ivo;
        match inbound {
            Inbound::Transport(msg) if msg.role == TransportRole::IAmAlive => {
                debug!(origin = %msg.origin, "iamalive received");
                conn.send(TransportMessage::iamalive_response(local, &msg.origin).to_bytes()?)
                    .await?;
            }
            Inbound::Transport(msg) if msg.role == TransportRole::Authenticate => {
                debug!(origin = %msg.origin, "authenticate received");
                let reply = TransportMessage::authenticate_response(local, &msg.origin, &self.config.filters);
                conn.send(reply.to_bytes()?).await?;
            }
            Inbound::Transport(msg) => {
                warn!(role = %msg.role, "incomprehensible data received");
            }
            Inbound::Event(event) => {
                info!(ivorn = event.ivorn(), role = %event.role(), "event received");
                self.process(conn, tasks, event).await?;
            }
            Inbound::Incomprehensible(role) => {
                warn!("incomprehensible data received (role={role:?})");
            }
        }
        Ok(())
    }

    async fn process<T: Transport>(
        &self,
        conn: &mut Conn<T>,
        tasks: &mut JoinSet<()>,
        event: Event,
    ) -> Result<(), VtpError> {
        let verdict = self.validators.validate(&event).await;
        conn.send(TransportMessage::ack(&self.config.local_ivo, event.ivorn()).to_bytes()?)
            .await?;
        match verdict {
            Ok(()) => {
                self.handlers.dispatch_in(tasks, event);
            }
            Err(reason) => {
                info!(ivorn = event.ivorn(), %reason, "event failed validation; dropped");
            }
        }
        Ok(())
    }

    /// Keep a subscription to `remote` alive until `shutdown` fires,
    /// reconnecting with exponential backoff.
    pub async fn run(self, remote: String, backoff: BackoffConfig, shutdown: CancellationToken) {
        let target = remote.clone();
        self.run_with(remote, move || TcpStream::connect(target.clone()), backoff, shutdown)
            .await
    }

    /// As [`run`](Self::run), opening each connection with `connect`.
    pub async fn run_with<C, F, T>(
        self,
        remote: String,
        mut connect: C,
        backoff: BackoffConfig,
        shutdown: CancellationToken,
    ) where
        C: FnMut() -> F,
        F: Future<Output = io::Result<T>>,
        T: Transport,
    {
        let mut policy = ReconnectPolicy::new(backoff);
        loop {
            if shutdown.is_cancelled() {
                break;
            }

            let connected = tokio::select! {
                _ = shutdown.cancelled() => break,
                connected = connect() => connected,
            };

            // Only time spent connected counts towards resetting the backoff.
            let mut uptime = Duration::ZERO;
            let lost = match connected {
                Ok(stream) => {
                    let connected_at = Instant::now();
                    let span = info_span!("connection", peer = %remote, role = %SessionRole::Subscriber);
                    async {
                        info!("connected to upstream");
                        match self.session(stream, &shutdown).await {
                            Ok(()) => info!("connection closed"),
                            Err(e) => info!(error = %e, "connection lost"),
                        }
                    }
                    .instrument(span)
                    .await;
                    uptime = connected_at.elapsed();
                    "lost"
                }
                Err(e) => {
                    debug!(%remote, error = %e, "connect failed");
                    "failed"
                }
            };

            if shutdown.is_cancelled() {
                break;
            }
            let delay = policy.next_delay(uptime);
            info!(%remote, retry_in = ?delay, "connection {lost}; will retry");
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = sleep(delay) => {}
            }
        }
        info!(%remote, "subscriber stopped");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use tokio::io::{duplex, DuplexStream};
    use tokio::net::TcpListener;
    use tokio::sync::mpsc;

    use super::*;
    use crate::document::test_support::*;
    use crate::pipeline::test_support::{Fixed, Forward};
    use crate::pipeline::Handler;
    use crate::types::HandlerError;

    type Upstream = Framed<DuplexStream, VtpFrameCodec>;

    fn config() -> SubscriberConfig {
        SubscriberConfig {
            filters: vec!["//Param[@name='snr']".into()],
            ..SubscriberConfig::new("ivo://comet.subscriber/test")
        }
    }

    fn start(
        subscriber: Subscriber,
    ) -> (Upstream, CancellationToken, tokio::task::JoinHandle<Result<(), VtpError>>) {
        let (ours, theirs) = duplex(64 * 1024);
        let shutdown = CancellationToken::new();
        let token = shutdown.clone();
        let task = tokio::spawn(async move { subscriber.session(ours, &token).await });
        (Framed::new(theirs, VtpFrameCodec::default()), shutdown, task)
    }

    async fn reply(upstream: &mut Upstream) -> TransportMessage {
        let frame = upstream.next().await.unwrap().unwrap();
        match classify(frame).unwrap() {
            Inbound::Transport(msg) => msg,
            other => panic!("expected a transport message, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn answers_iamalive_and_authenticate() {
        let subscriber = Subscriber::new(config(), ValidatorChain::new(), HandlerChain::new());
        let (mut upstream, _shutdown, _task) = start(subscriber);

        upstream
            .send(TransportMessage::iamalive(DUMMY_SERVICE_IVOID).to_bytes().unwrap())
            .await
            .unwrap();
        let msg = reply(&mut upstream).await;
        assert_eq!(msg.role, TransportRole::IAmAlive);
        assert_eq!(msg.origin, DUMMY_SERVICE_IVOID);
        assert_eq!(msg.response.as_deref(), Some("ivo://comet.subscriber/test"));

        upstream
            .send(TransportMessage::authenticate(DUMMY_SERVICE_IVOID).to_bytes().unwrap())
            .await
            .unwrap();
        let msg = reply(&mut upstream).await;
        assert_eq!(msg.role, TransportRole::Authenticate);
        assert_eq!(msg.filters, vec!["//Param[@name='snr']".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn valid_events_are_acked_and_handled() {
        let (forward, mut seen) = Forward::new();
        let subscriber = Subscriber::new(
            config(),
            ValidatorChain::new().with(Fixed::pass("ok")),
            HandlerChain::new().with(forward),
        );
        let (mut upstream, _shutdown, _task) = start(subscriber);

        upstream.send(dummy_voevent()).await.unwrap();
        let ack = reply(&mut upstream).await;
        assert_eq!(ack.role, TransportRole::Ack);
        assert_eq!(ack.origin, DUMMY_EVENT_IVOID);
        assert_eq!(seen.recv().await.unwrap(), DUMMY_EVENT_IVOID);
    }

    #[tokio::test(start_paused = true)]
    async fn invalid_events_are_acked_but_not_handled() {
        let (forward, mut seen) = Forward::new();
        let subscriber = Subscriber::new(
            config(),
            ValidatorChain::new().with(Fixed::fail("no")),
            HandlerChain::new().with(forward),
        );
        let (mut upstream, shutdown, task) = start(subscriber);

        upstream.send(dummy_voevent()).await.unwrap();
        assert_eq!(reply(&mut upstream).await.role, TransportRole::Ack);

        shutdown.cancel();
        task.await.unwrap().unwrap();
        assert!(seen.recv().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn unparsable_frames_get_no_reply() {
        let subscriber = Subscriber::new(config(), ValidatorChain::new(), HandlerChain::new());
        let (mut upstream, shutdown, task) = start(subscriber);
        upstream.send(Bytes::from_static(b"garbage")).await.unwrap();
        upstream
            .send(TransportMessage::iamalive(DUMMY_SERVICE_IVOID).to_bytes().unwrap())
            .await
            .unwrap();
        // The first reply is to the iamalive; the garbage was skipped.
        assert_eq!(reply(&mut upstream).await.role, TransportRole::IAmAlive);
        shutdown.cancel();
        task.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn silence_times_out() {
        let subscriber = Subscriber::new(config(), ValidatorChain::new(), HandlerChain::new());
        let (mut upstream, _shutdown, task) = start(subscriber);
        assert!(upstream.next().await.is_none());
        assert!(matches!(task.await.unwrap(), Err(VtpError::Timeout(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn traffic_resets_the_timer() {
        let subscriber = Subscriber::new(config(), ValidatorChain::new(), HandlerChain::new());
        let (mut upstream, _shutdown, task) = start(subscriber);
        for _ in 0..3 {
            sleep(Duration::from_secs(100)).await;
            upstream
                .send(TransportMessage::iamalive(DUMMY_SERVICE_IVOID).to_bytes().unwrap())
                .await
                .unwrap();
            reply(&mut upstream).await;
        }
        assert!(!task.is_finished());
    }

    struct Stuck {
        started: mpsc::UnboundedSender<()>,
        finished: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Handler for Stuck {
        fn name(&self) -> &str {
            "stuck"
        }

        async fn handle(&self, _event: &Event) -> Result<(), HandlerError> {
            let _ = self.started.send(());
            sleep(Duration::from_secs(1000)).await;
            self.finished.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn timeout_aborts_running_handlers() {
        let (started, mut started_rx) = mpsc::unbounded_channel();
        let finished = Arc::new(AtomicUsize::new(0));
        let subscriber = Subscriber::new(
            config(),
            ValidatorChain::new(),
            HandlerChain::new().with(Stuck {
                started,
                finished: Arc::clone(&finished),
            }),
        );
        let (mut upstream, _shutdown, task) = start(subscriber);
        upstream.send(dummy_voevent()).await.unwrap();
        reply(&mut upstream).await;
        started_rx.recv().await.unwrap();

        assert!(matches!(task.await.unwrap(), Err(VtpError::Timeout(_))));
        sleep(Duration::from_secs(2000)).await;
        assert_eq!(finished.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn slow_failed_connects_keep_backing_off() {
        let backoff = BackoffConfig {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            jitter: 0.0,
            reset_after: Duration::from_secs(5),
        };
        let (attempts_tx, mut attempts) = mpsc::unbounded_channel();
        // Each attempt hangs for longer than `reset_after` before failing.
        let connect = move || {
            let _ = attempts_tx.send(Instant::now());
            async {
                sleep(Duration::from_secs(10)).await;
                Err::<DuplexStream, _>(io::Error::new(io::ErrorKind::TimedOut, "unreachable"))
            }
        };
        let shutdown = CancellationToken::new();
        let subscriber = Subscriber::new(config(), ValidatorChain::new(), HandlerChain::new());
        let task = tokio::spawn(subscriber.run_with("upstream".into(), connect, backoff, shutdown.clone()));

        let mut starts = Vec::new();
        for _ in 0..4 {
            starts.push(attempts.recv().await.unwrap());
        }
        let gaps: Vec<Duration> = starts.windows(2).map(|w| w[1] - w[0]).collect();
        // 10 s hanging plus a delay of 1, 2 and then 4 seconds.
        assert!(gaps[0] >= Duration::from_secs(11), "{gaps:?}");
        assert!(gaps[0] < gaps[1] && gaps[1] < gaps[2], "{gaps:?}");

        shutdown.cancel();
        task.await.unwrap();
    }

    #[tokio::test]
    async fn reconnects_after_upstream_closes() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let remote = listener.local_addr().unwrap().to_string();
        let backoff = BackoffConfig {
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(50),
            ..BackoffConfig::default()
        };
        let shutdown = CancellationToken::new();
        let subscriber = Subscriber::new(config(), ValidatorChain::new(), HandlerChain::new());
        let task = tokio::spawn(subscriber.run(remote, backoff, shutdown.clone()));

        // First connection is dropped straight away; the subscriber comes back.
        let (first, _) = listener.accept().await.unwrap();
        drop(first);
        let (second, _) = listener.accept().await.unwrap();

        let mut upstream = Framed::new(second, VtpFrameCodec::default());
        upstream
            .send(TransportMessage::iamalive(DUMMY_SERVICE_IVOID).to_bytes().unwrap())
            .await
            .unwrap();
        let frame = upstream.next().await.unwrap().unwrap();
        assert!(matches!(classify(frame).unwrap(), Inbound::Transport(m) if m.role == TransportRole::IAmAlive));

        shutdown.cancel();
        task.await.unwrap();
    }
}
