//! Fan-out of events to connected subscribers.
//!
//! [`BroadcastHub`] keeps a registry of live subscriber sessions. Each
//! session runs on its own task and owns its liveness counters and filters;
//! the hub only ever talks to it through a bounded queue, so one slow
//! subscriber never holds up the others or the task relaying the event.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use futures::future::join_all;
use futures::{SinkExt, StreamExt};
use parking_lot::RwLock;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::task::JoinHandle;
use tokio::time::{interval, interval_at, timeout, Instant, MissedTickBehavior};
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::Transport;
use crate::codec::VtpFrameCodec;
use crate::document::{Event, XmlDocument};
use crate::filter::{FilterCompiler, Predicate, XPathCompiler};
use crate::messages::{classify, Inbound, TransportMessage, TransportRole};
use crate::pipeline::WorkerPool;
use crate::types::{SessionId, VtpError, DEFAULT_MAX_FRAME_LEN};
use crate::voevent::broker_test_event;

pub const DEFAULT_ALIVE_INTERVAL: Duration = Duration::from_secs(60);
pub const DEFAULT_TEST_INTERVAL: Duration = Duration::from_secs(3600);
/// Drop a subscriber which has missed this many `iamalive`s.
pub const MAX_ALIVE_COUNT: u32 = 1;
/// Drop a subscriber with this many events unacknowledged.
pub const MAX_OUTSTANDING_ACK: u32 = 10;
pub const DEFAULT_QUEUE_DEPTH: usize = 128;

#[derive(Debug, Clone)]
pub struct BroadcastConfig {
    pub local_ivo: String,
    pub alive_interval: Duration,
    /// Zero disables test events.
    pub test_interval: Duration,
    pub max_alive_count: u32,
    pub max_outstanding_ack: u32,
    /// Commands buffered per subscriber before deliveries are dropped.
    pub queue_depth: usize,
    pub max_frame_len: usize,
}

impl BroadcastConfig {
    pub fn new(local_ivo: impl Into<String>) -> Self {
        Self {
            local_ivo: local_ivo.into(),
            alive_interval: DEFAULT_ALIVE_INTERVAL,
            test_interval: DEFAULT_TEST_INTERVAL,
            max_alive_count: MAX_ALIVE_COUNT,
            max_outstanding_ack: MAX_OUTSTANDING_ACK,
            queue_depth: DEFAULT_QUEUE_DEPTH,
            max_frame_len: DEFAULT_MAX_FRAME_LEN,
        }
    }
}

#[derive(Debug)]
enum Command {
    Alive,
    Event(Event),
}

struct SessionHandle {
    peer: String,
    tx: mpsc::Sender<Command>,
}

struct HubInner {
    config: BroadcastConfig,
    pool: WorkerPool,
    compiler: Arc<dyn FilterCompiler>,
    sessions: RwLock<HashMap<SessionId, SessionHandle>>,
}

/// Registry of subscriber sessions. Cheap to clone.
#[derive(Clone)]
pub struct BroadcastHub {
    inner: Arc<HubInner>,
}

impl BroadcastHub {
    pub fn new(config: BroadcastConfig, pool: WorkerPool) -> Self {
        Self::with_compiler(config, pool, Arc::new(XPathCompiler))
    }

    pub fn with_compiler(
        config: BroadcastConfig,
        pool: WorkerPool,
        compiler: Arc<dyn FilterCompiler>,
    ) -> Self {
        Self {
            inner: Arc::new(HubInner {
                config,
                pool,
                compiler,
                sessions: RwLock::new(HashMap::new()),
            }),
        }
    }

    pub fn config(&self) -> &BroadcastConfig {
        &self.inner.config
    }

    pub fn subscriber_count(&self) -> usize {
        self.inner.sessions.read().len()
    }

    fn broadcast(&self, make: impl Fn() -> Command) -> usize {
        let sessions = self.inner.sessions.read();
        let mut queued = 0;
        for (id, session) in sessions.iter() {
            match session.tx.try_send(make()) {
                Ok(()) => queued += 1,
                Err(TrySendError::Full(_)) => {
                    warn!(session = id, peer = %session.peer, "subscriber queue full; delivery dropped")
                }
                Err(TrySendError::Closed(_)) => {
                    debug!(session = id, peer = %session.peer, "subscriber already gone")
                }
            }
        }
        queued
    }

    /// Offer `event` to every subscriber. Returns how many accepted it for
    /// filtering and delivery.
    pub fn send_event(&self, event: &Event) -> usize {
        self.broadcast(|| Command::Event(event.clone()))
    }

    /// Run the liveness check on every subscriber.
    pub fn send_iamalive(&self) -> usize {
        self.broadcast(|| Command::Alive)
    }

    /// Offer a freshly built test event to every subscriber.
    pub fn send_test_event(&self) -> Result<usize, VtpError> {
        let event = broker_test_event(&self.inner.config.local_ivo)?;
        Ok(self.send_event(&event))
    }

    /// Run a subscriber session until either side closes it.
    pub async fn serve<T: Transport>(
        &self,
        id: SessionId,
        peer: impl fmt::Display,
        io: T,
    ) -> Result<(), VtpError> {
        let (tx, rx) = mpsc::channel(self.inner.config.queue_depth.max(1));
        let peer = peer.to_string();
        let subscribers = {
            let mut sessions = self.inner.sessions.write();
            sessions.insert(id, SessionHandle { peer: peer.clone(), tx });
            sessions.len()
        };
        info!(%peer, subscribers, "new subscriber");

        let conn = Framed::new(io, VtpFrameCodec::new(self.inner.config.max_frame_len));
        let session = Session {
            conn,
            hub: Arc::clone(&self.inner),
            missed_alive: 0,
            outstanding_ack: 0,
            filters: Vec::new(),
        };
        let result = session.run(rx).await;

        self.inner.sessions.write().remove(&id);
        info!(%peer, "subscriber disconnected");
        result
    }

    /// Start the periodic `iamalive` and test-event loops.
    pub fn spawn_loops(&self, shutdown: CancellationToken) -> JoinHandle<()> {
        let hub = self.clone();
        tokio::spawn(async move {
            let config = &hub.inner.config;
            let mut alive = interval_at(Instant::now() + config.alive_interval, config.alive_interval);
            alive.set_missed_tick_behavior(MissedTickBehavior::Delay);

            let test_enabled = !config.test_interval.is_zero();
            let mut test = interval(if test_enabled {
                config.test_interval
            } else {
                config.alive_interval
            });
            test.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = alive.tick() => {
                        let queued = hub.send_iamalive();
                        debug!(subscribers = queued, "broadcast iamalive");
                    }
                    _ = test.tick(), if test_enabled => match hub.send_test_event() {
                        Ok(queued) => debug!(subscribers = queued, "broadcast test event"),
                        Err(e) => warn!(error = %e, "cannot build test event"),
                    },
                }
            }
        })
    }
}

struct Session<T> {
    conn: Framed<T, VtpFrameCodec>,
    hub: Arc<HubInner>,
    missed_alive: u32,
    outstanding_ack: u32,
    filters: Vec<Arc<dyn Predicate>>,
}

impl<T: Transport> Session<T> {
    async fn run(mut self, mut rx: mpsc::Receiver<Command>) -> Result<(), VtpError> {
        let local = self.hub.config.local_ivo.clone();
        self.write(TransportMessage::authenticate(&local).to_bytes()?)
            .await?;

        loop {
            tokio::select! {
                command = rx.recv() => match command {
                    None => return Ok(()),
                    Some(Command::Alive) => {
                        if !self.keepalive(&local).await? {
                            return Ok(());
                        }
                    }
                    Some(Command::Event(event)) => self.forward(event).await?,
                },
                frame = self.conn.next() => match frame {
                    None => return Ok(()),
                    Some(Err(e)) => return Err(e),
                    Some(Ok(payload)) => {
                        if !self.receive(payload) {
                            return Ok(());
                        }
                    }
                },
            }
        }
    }

    /// Returns `false` if the subscriber should be dropped.
    async fn keepalive(&mut self, local: &str) -> Result<bool, VtpError> {
        let config = &self.hub.config;
        if self.missed_alive >= config.max_alive_count {
            info!("peer appears to be dead; dropping connection");
            return Ok(false);
        }
        if self.outstanding_ack >= config.max_outstanding_ack {
            info!(outstanding = self.outstanding_ack, "peer is not acknowledging events; dropping connection");
            return Ok(false);
        }
        self.write(TransportMessage::iamalive(local).to_bytes()?)
            .await?;
        self.missed_alive += 1;
        Ok(true)
    }

    /// Returns `false` if the subscriber should be dropped.
    fn receive(&mut self, payload: Bytes) -> bool {
        match classify(payload) {
            Ok(Inbound::Transport(msg)) => match msg.role {
                TransportRole::IAmAlive => {
                    debug!("iamalive received");
                    self.missed_alive = self.missed_alive.saturating_sub(1);
                }
                TransportRole::Ack => {
                    debug!(ivorn = %msg.origin, "ack received");
                    self.outstanding_ack = self.outstanding_ack.saturating_sub(1);
                }
                TransportRole::Nak => {
                    info!(ivorn = %msg.origin, reason = ?msg.result, "nak received; terminating");
                    return false;
                }
                TransportRole::Authenticate => {
                    debug!("authentication received");
                    self.install_filters(&msg.filters);
                }
            },
            Ok(Inbound::Event(event)) => {
                warn!(ivorn = event.ivorn(), "incomprehensible data received (role={})", event.role())
            }
            Ok(Inbound::Incomprehensible(role)) => {
                warn!("incomprehensible data received (role={role:?})")
            }
            Err(e) => warn!(error = %e, "unparsable message received"),
        }
        true
    }

    fn install_filters(&mut self, expressions: &[String]) {
        self.filters = expressions
            .iter()
            .filter_map(|expr| match self.hub.compiler.compile(expr) {
                Ok(filter) => {
                    info!(filter = %expr, "installing filter");
                    Some(filter)
                }
                Err(e) => {
                    info!(filter = %expr, error = %e, "filter is not valid; ignoring");
                    None
                }
            })
            .collect();
    }

    /// A peer that stops reading is given one liveness interval to drain.
    async fn write(&mut self, payload: Bytes) -> Result<(), VtpError> {
        let limit = self.hub.config.alive_interval;
        match timeout(limit, self.conn.send(payload)).await {
            Ok(sent) => sent,
            Err(_) => {
                info!("peer is not reading; dropping connection");
                Err(VtpError::Timeout(limit))
            }
        }
    }

    async fn forward(&mut self, event: Event) -> Result<(), VtpError> {
        let filters = self.filters.clone();
        let pool = self.hub.pool.clone();
        if !wants(filters, pool, event.document().clone()).await {
            info!(ivorn = event.ivorn(), "event rejected by filter");
            return Ok(());
        }
        info!(ivorn = event.ivorn(), "event matches filter criteria; forwarding");
        self.write(event.raw_bytes().clone()).await?;
        self.outstanding_ack += 1;
        Ok(())
    }
}

/// True if any filter matches, or there are none. Takes everything by
/// value so the session is not borrowed while the checks run.
async fn wants(filters: Vec<Arc<dyn Predicate>>, pool: WorkerPool, doc: XmlDocument) -> bool {
    if filters.is_empty() {
        return true;
    }
    let checks = filters.into_iter().map(|filter| {
        let doc = doc.clone();
        pool.run(move || filter.matches(&doc))
    });
    join_all(checks)
        .await
        .into_iter()
        .any(|verdict| matches!(verdict, Ok(Ok(true))))
}

#[cfg(test)]
mod tests {
    use tokio::io::{duplex, DuplexStream};

    use super::*;
    use crate::document::test_support::*;
    use crate::types::EventRole;

    type Client = Framed<DuplexStream, VtpFrameCodec>;

    fn hub() -> BroadcastHub {
        BroadcastHub::new(BroadcastConfig::new(DUMMY_SERVICE_IVOID), WorkerPool::new(2))
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    async fn connect(hub: &BroadcastHub, id: SessionId) -> (Client, JoinHandle<Result<(), VtpError>>) {
        let (ours, theirs) = duplex(64 * 1024);
        let hub = hub.clone();
        let task = tokio::spawn(async move { hub.serve(id, "test-peer", ours).await });
        let mut client = Framed::new(theirs, VtpFrameCodec::default());
        let hello = next_inbound(&mut client).await.unwrap();
        assert!(matches!(hello, Inbound::Transport(ref m) if m.role == TransportRole::Authenticate));
        (client, task)
    }

    async fn next_inbound(client: &mut Client) -> Option<Inbound> {
        let frame = client.next().await?.ok()?;
        classify(frame).ok()
    }

    async fn send(client: &mut Client, msg: TransportMessage) {
        client.send(msg.to_bytes().unwrap()).await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn sessions_register_and_deregister() {
        let hub = hub();
        let (client, task) = connect(&hub, 1).await;
        assert_eq!(hub.subscriber_count(), 1);
        drop(client);
        task.await.unwrap().unwrap();
        assert_eq!(hub.subscriber_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn unfiltered_subscriber_gets_everything() {
        let hub = hub();
        let (mut client, _task) = connect(&hub, 1).await;
        assert_eq!(hub.send_event(&dummy_event()), 1);
        let frame = client.next().await.unwrap().unwrap();
        assert_eq!(frame, dummy_voevent());
    }

    #[tokio::test(start_paused = true)]
    async fn answered_iamalive_keeps_session() {
        let hub = hub();
        let (mut client, task) = connect(&hub, 1).await;

        for _ in 0..3 {
            hub.send_iamalive();
            match next_inbound(&mut client).await.unwrap() {
                Inbound::Transport(msg) => {
                    assert_eq!(msg.role, TransportRole::IAmAlive);
                    assert_eq!(msg.origin, DUMMY_SERVICE_IVOID);
                    send(&mut client, TransportMessage::iamalive_response("ivo://sub/x", &msg.origin)).await;
                }
                other => panic!("expected iamalive, got {other:?}"),
            }
            settle().await;
        }
        assert!(!task.is_finished());
    }

    #[tokio::test(start_paused = true)]
    async fn missed_iamalive_drops_session() {
        let hub = hub();
        let (mut client, task) = connect(&hub, 1).await;

        hub.send_iamalive();
        assert!(next_inbound(&mut client).await.is_some());
        hub.send_iamalive();
        assert!(client.next().await.is_none());
        task.await.unwrap().unwrap();
        assert_eq!(hub.subscriber_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn unacknowledged_events_drop_session() {
        let hub = hub();
        let (mut client, task) = connect(&hub, 1).await;

        for _ in 0..MAX_OUTSTANDING_ACK {
            hub.send_event(&dummy_event());
            assert!(client.next().await.is_some());
        }
        hub.send_iamalive();
        assert!(client.next().await.is_none());
        task.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn acks_are_credited() {
        let hub = hub();
        let (mut client, task) = connect(&hub, 1).await;

        for _ in 0..MAX_OUTSTANDING_ACK {
            hub.send_event(&dummy_event());
            assert!(client.next().await.is_some());
            send(&mut client, TransportMessage::ack("ivo://sub/x", DUMMY_EVENT_IVOID)).await;
        }
        settle().await;
        hub.send_iamalive();
        assert!(next_inbound(&mut client).await.is_some());
        assert!(!task.is_finished());
    }

    #[tokio::test(start_paused = true)]
    async fn nak_drops_session() {
        let hub = hub();
        let (mut client, task) = connect(&hub, 1).await;
        send(&mut client, TransportMessage::nak("ivo://sub/x", DUMMY_EVENT_IVOID, Some("no"))).await;
        assert!(client.next().await.is_none());
        task.await.unwrap().unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn filters_select_events() {
        let hub = hub();
        let (mut client, _task) = connect(&hub, 1).await;
        let filters = vec!["/*[@role='observation']".to_string(), "[[broken".to_string()];
        send(
            &mut client,
            TransportMessage::authenticate_response("ivo://sub/x", DUMMY_SERVICE_IVOID, &filters),
        )
        .await;
        settle().await;

        hub.send_event(&dummy_event());
        let observation = Event::parse(voevent_with("ivo://comet.broker/test#obs", "observation")).unwrap();
        hub.send_event(&observation);

        match next_inbound(&mut client).await.unwrap() {
            Inbound::Event(event) => {
                assert_eq!(event.role(), EventRole::Observation);
                assert_eq!(event.ivorn(), "ivo://comet.broker/test#obs");
            }
            other => panic!("expected the observation, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn runaway_filter_is_ignored() {
        let hub = hub();
        let (mut client, task) = connect(&hub, 1).await;
        let nested = format!("{}1{}", "(".repeat(5_000), ")".repeat(5_000));
        send(
            &mut client,
            TransportMessage::authenticate_response("ivo://sub/x", DUMMY_SERVICE_IVOID, &[nested]),
        )
        .await;
        settle().await;
        assert!(!task.is_finished());

        // No filter survived, so everything is delivered.
        hub.send_event(&dummy_event());
        assert_eq!(client.next().await.unwrap().unwrap(), dummy_voevent());
    }

    #[tokio::test(start_paused = true)]
    async fn garbage_is_ignored() {
        let hub = hub();
        let (mut client, task) = connect(&hub, 1).await;
        client.send(Bytes::from_static(b"not xml at all")).await.unwrap();
        client.send(Bytes::from_static(b"<xml/>")).await.unwrap();
        settle().await;
        assert!(!task.is_finished());
        assert_eq!(hub.subscriber_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn full_queue_drops_deliveries() {
        let config = BroadcastConfig {
            queue_depth: 1,
            ..BroadcastConfig::new(DUMMY_SERVICE_IVOID)
        };
        let hub = BroadcastHub::new(config, WorkerPool::new(1));

        // Too small to take even the authenticate message, so the session
        // stalls writing and stops draining its queue.
        let (ours, _theirs) = duplex(16);
        let serving = hub.clone();
        tokio::spawn(async move { serving.serve(7, "slow-peer", ours).await });
        settle().await;
        assert_eq!(hub.subscriber_count(), 1);

        assert_eq!(hub.send_event(&dummy_event()), 1);
        assert_eq!(hub.send_event(&dummy_event()), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn peer_that_never_reads_is_dropped() {
        let hub = hub();
        let (ours, _theirs) = duplex(16);
        let serving = hub.clone();
        let task = tokio::spawn(async move { serving.serve(3, "deaf-peer", ours).await });
        let shutdown = CancellationToken::new();
        let _loops = hub.spawn_loops(shutdown.clone());
        settle().await;
        assert_eq!(hub.subscriber_count(), 1);

        tokio::time::sleep(DEFAULT_ALIVE_INTERVAL * 3).await;
        assert!(matches!(task.await.unwrap(), Err(VtpError::Timeout(_))));
        assert_eq!(hub.subscriber_count(), 0);
        shutdown.cancel();
    }

    #[tokio::test(start_paused = true)]
    async fn loops_send_test_events() {
        let config = BroadcastConfig {
            test_interval: Duration::from_secs(5),
            ..BroadcastConfig::new(DUMMY_SERVICE_IVOID)
        };
        let hub = BroadcastHub::new(config, WorkerPool::new(1));
        let (mut client, _task) = connect(&hub, 1).await;
        let shutdown = CancellationToken::new();
        let loops = hub.spawn_loops(shutdown.clone());

        match next_inbound(&mut client).await.unwrap() {
            Inbound::Event(event) => {
                assert_eq!(event.role(), EventRole::Test);
                assert!(event.ivorn().starts_with(DUMMY_SERVICE_IVOID));
            }
            other => panic!("expected a test event, got {other:?}"),
        }

        shutdown.cancel();
        loops.await.unwrap();
    }
}
