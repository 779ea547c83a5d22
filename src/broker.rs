//! Service wiring: one broker process built from a [`BrokerConfig`].

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::config::BrokerConfig;
use crate::event_db::EventDb;
use crate::handler::{EventPrinter, EventRelay, EventWriter, SpawnCommand};
use crate::pipeline::{Handler, HandlerChain, ValidatorChain, WorkerPool};
use crate::tcp::broadcaster::{BroadcastConfig, BroadcastHub};
use crate::tcp::receiver::{Receiver, ReceiverConfig};
use crate::tcp::server::VtpServer;
use crate::tcp::subscriber::{Subscriber, SubscriberConfig};
use crate::types::{SessionRole, VtpError};
use crate::validator::{
    CheckIvoid, CheckPreviouslySeen, CheckSchema, CheckSignature, SchemaValidator,
    SignatureVerifier, VoEventStructure,
};

pub struct Broker {
    config: BrokerConfig,
    db: Arc<EventDb>,
    pool: WorkerPool,
    schema: Arc<dyn SchemaValidator>,
    verifier: Option<Arc<dyn SignatureVerifier>>,
    handlers: Vec<Arc<dyn Handler>>,
}

impl Broker {
    /// Validate `config` and open the event store.
    pub fn from_config(config: BrokerConfig) -> Result<Self, VtpError> {
        config.validate()?;
        let db = Arc::new(EventDb::new(&config.event_db.path)?);
        let pool = config.workers.map_or_else(WorkerPool::default, WorkerPool::new);
        info!(
            local_ivo = %config.local_ivo,
            store = %db.root().display(),
            workers = pool.size(),
            "broker configured"
        );
        Ok(Self {
            config,
            db,
            pool,
            schema: Arc::new(VoEventStructure),
            verifier: None,
            handlers: Vec::new(),
        })
    }

    /// Replace the built-in structural schema check.
    pub fn with_schema(mut self, schema: Arc<dyn SchemaValidator>) -> Self {
        self.schema = schema;
        self
    }

    /// Also reject submissions whose signature does not verify.
    pub fn with_signature_verifier(mut self, verifier: Arc<dyn SignatureVerifier>) -> Self {
        self.verifier = Some(verifier);
        self
    }

    /// Run `handler` on every accepted event, after the configured ones.
    pub fn with_handler(mut self, handler: Arc<dyn Handler>) -> Self {
        self.handlers.push(handler);
        self
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub fn event_db(&self) -> &Arc<EventDb> {
        &self.db
    }

    fn base_handlers(&self) -> HandlerChain {
        let config = &self.config.handlers;
        let mut chain = HandlerChain::new();
        if config.print_events {
            chain.push(Arc::new(EventPrinter));
        }
        if let Some(dir) = &config.save_events {
            chain.push(Arc::new(EventWriter::new(dir.clone())));
        }
        for command in &config.commands {
            chain.push(Arc::new(SpawnCommand::new(
                command.command.clone(),
                command.args.clone(),
            )));
        }
        for handler in &self.handlers {
            chain.push(Arc::clone(handler));
        }
        chain
    }

    fn receiver_validators(&self) -> ValidatorChain {
        let mut chain = ValidatorChain::new()
            .with(CheckPreviouslySeen::new(Arc::clone(&self.db), self.pool.clone()))
            .with(CheckSchema::new(Arc::clone(&self.schema), self.pool.clone()))
            .with(CheckIvoid);
        if let Some(verifier) = &self.verifier {
            chain.push(Arc::new(CheckSignature::new(
                Arc::clone(verifier),
                self.pool.clone(),
            )));
        }
        chain
    }

    fn subscriber_validators(&self) -> ValidatorChain {
        ValidatorChain::new().with(CheckPreviouslySeen::new(
            Arc::clone(&self.db),
            self.pool.clone(),
        ))
    }

    /// Bind every configured service and start it.
    ///
    /// Everything stops when `shutdown` is cancelled, or when any service
    /// fails.
    pub async fn start(self, shutdown: CancellationToken) -> Result<RunningBroker, VtpError> {
        let shutdown = shutdown.child_token();
        match self.launch(&shutdown).await {
            Ok(running) => Ok(running),
            Err(e) => {
                shutdown.cancel();
                Err(e)
            }
        }
    }

    async fn launch(&self, shutdown: &CancellationToken) -> Result<RunningBroker, VtpError> {
        let mut services = JoinSet::new();
        let mut handlers = self.base_handlers();
        let mut running = RunningBroker {
            receiver_addr: None,
            broadcaster_addr: None,
            hub: None,
            services: JoinSet::new(),
            shutdown: shutdown.clone(),
        };

        if let Some(section) = &self.config.broadcaster {
            let config = BroadcastConfig {
                alive_interval: section.alive_interval,
                test_interval: section.test_interval,
                max_alive_count: section.max_alive_count,
                max_outstanding_ack: section.max_outstanding_ack,
                queue_depth: section.queue_depth,
                max_frame_len: self.config.max_frame_len,
                ..BroadcastConfig::new(self.config.local_ivo.clone())
            };
            let hub = BroadcastHub::new(config, self.pool.clone());
            let server = VtpServer::bind(&section.listen, SessionRole::Broadcaster)
                .await?
                .with_whitelist(section.whitelist.clone());
            running.broadcaster_addr = Some(server.local_addr()?);

            let serving = hub.clone();
            services.spawn(server.run(shutdown.clone(), move |id, peer, io| {
                let hub = serving.clone();
                async move { hub.serve(id, peer, io).await }
            }));
            let loops = hub.spawn_loops(shutdown.clone());
            services.spawn(async move {
                let _ = loops.await;
                Ok(())
            });

            handlers.push(Arc::new(EventRelay::new(hub.clone())));
            running.hub = Some(hub);
        }

        if let Some(section) = &self.config.receiver {
            let config = ReceiverConfig {
                timeout: section.timeout,
                archive: section.archive,
                max_frame_len: self.config.max_frame_len,
                ..ReceiverConfig::new(self.config.local_ivo.clone())
            };
            let receiver = Receiver::new(config, self.receiver_validators(), handlers.clone());

            let server = VtpServer::bind(&section.listen, SessionRole::Receiver)
                .await?
                .with_whitelist(section.whitelist.clone());
            running.receiver_addr = Some(server.local_addr()?);
            let serving = receiver.clone();
            services.spawn(server.run(shutdown.clone(), move |_, _, io| {
                let receiver = serving.clone();
                async move { receiver.serve(io).await }
            }));

            if let Some(path) = &section.unix_socket {
                bind_unix_receiver(&mut services, path, receiver, shutdown.clone())?;
            }
        }

        for remote in &self.config.remotes {
            let config = SubscriberConfig {
                filters: self.config.filters.clone(),
                timeout: self.config.subscriber.timeout,
                max_frame_len: self.config.max_frame_len,
                ..SubscriberConfig::new(self.config.local_ivo.clone())
            };
            let subscriber = Subscriber::new(config, self.subscriber_validators(), handlers.clone());
            let remote = remote.clone();
            let backoff = self.config.subscriber.backoff.clone();
            let token = shutdown.clone();
            services.spawn(async move {
                subscriber.run(remote, backoff, token).await;
                Ok(())
            });
        }

        let prune = Arc::clone(&self.db).spawn_prune_loop(
            self.pool.clone(),
            self.config.event_db.prune_interval,
            self.config.event_db.max_age,
            shutdown.clone(),
        );
        services.spawn(async move {
            let _ = prune.await;
            Ok(())
        });

        info!(
            receiver = ?running.receiver_addr,
            broadcaster = ?running.broadcaster_addr,
            remotes = self.config.remotes.len(),
            handlers = ?handlers.names(),
            "broker started"
        );
        running.services = services;
        Ok(running)
    }

    /// Start the broker and wait for it to stop.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), VtpError> {
        self.start(shutdown).await?.wait().await
    }
}

#[cfg(unix)]
fn bind_unix_receiver(
    services: &mut JoinSet<Result<(), VtpError>>,
    path: &std::path::Path,
    receiver: Receiver,
    shutdown: CancellationToken,
) -> Result<(), VtpError> {
    let server = VtpServer::bind_unix(&path.to_string_lossy(), SessionRole::Receiver)?;
    services.spawn(server.run(shutdown, move |_, _, io| {
        let receiver = receiver.clone();
        async move { receiver.serve(io).await }
    }));
    Ok(())
}

#[cfg(not(unix))]
fn bind_unix_receiver(
    _services: &mut JoinSet<Result<(), VtpError>>,
    path: &std::path::Path,
    _receiver: Receiver,
    _shutdown: CancellationToken,
) -> Result<(), VtpError> {
    Err(VtpError::config(format!(
        "unix sockets are not supported on this platform ({})",
        path.display()
    )))
}

/// Handle on a started broker.
pub struct RunningBroker {
    receiver_addr: Option<SocketAddr>,
    broadcaster_addr: Option<SocketAddr>,
    hub: Option<BroadcastHub>,
    services: JoinSet<Result<(), VtpError>>,
    shutdown: CancellationToken,
}

impl RunningBroker {
    pub fn receiver_addr(&self) -> Option<SocketAddr> {
        self.receiver_addr
    }

    pub fn broadcaster_addr(&self) -> Option<SocketAddr> {
        self.broadcaster_addr
    }

    /// Connected subscribers, if the broadcaster is running.
    pub fn subscriber_count(&self) -> usize {
        self.hub.as_ref().map_or(0, BroadcastHub::subscriber_count)
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Wait for every service to finish. The first service error, if any,
    /// is returned after the rest have been stopped.
    pub async fn wait(mut self) -> Result<(), VtpError> {
        let mut failure = None;
        while let Some(joined) = self.services.join_next().await {
            match joined {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    error!(error = %e, "service failed; stopping broker");
                    self.shutdown.cancel();
                    failure.get_or_insert(e);
                }
                Err(e) => {
                    warn!(error = %e, "service task did not complete");
                    self.shutdown.cancel();
                }
            }
        }
        info!("broker stopped");
        failure.map_or(Ok(()), Err)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use futures::{SinkExt, StreamExt};
    use tokio::net::TcpStream;
    use tokio_util::codec::Framed;

    use super::*;
    use crate::codec::VtpFrameCodec;
    use crate::config::{BroadcasterSection, ReceiverSection};
    use crate::document::test_support::*;
    use crate::messages::{classify, Inbound, TransportMessage, TransportRole};
    use crate::pipeline::test_support::Forward;
    use crate::tcp::sender::Sender;

    fn local_config(dir: &std::path::Path) -> BrokerConfig {
        let mut config = BrokerConfig {
            local_ivo: DUMMY_SERVICE_IVOID.into(),
            receiver: Some(ReceiverSection {
                listen: "127.0.0.1:0".into(),
                ..ReceiverSection::default()
            }),
            broadcaster: Some(BroadcasterSection {
                listen: "127.0.0.1:0".into(),
                test_interval: Duration::ZERO,
                ..BroadcasterSection::default()
            }),
            workers: Some(2),
            ..BrokerConfig::default()
        };
        config.event_db.path = dir.join("db");
        config
    }

    async fn wait_for_subscribers(running: &RunningBroker, n: usize) {
        for _ in 0..200 {
            if running.subscriber_count() == n {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("subscriber count never reached {n}");
    }

    #[test]
    fn refuses_to_start_without_services() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = BrokerConfig::default();
        config.event_db.path = dir.path().to_path_buf();
        assert!(matches!(Broker::from_config(config), Err(VtpError::Config(_))));
    }

    #[test]
    fn unusable_store_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("not-a-dir");
        std::fs::write(&file, b"x").unwrap();
        let mut config = local_config(dir.path());
        config.event_db.path = file;
        assert!(matches!(Broker::from_config(config), Err(VtpError::Store(_))));
    }

    #[tokio::test]
    async fn submissions_are_relayed_to_subscribers() {
        let dir = tempfile::tempdir().unwrap();
        let (forward, mut handled) = Forward::new();
        let broker = Broker::from_config(local_config(dir.path()))
            .unwrap()
            .with_handler(Arc::new(forward));
        let shutdown = CancellationToken::new();
        let running = broker.start(shutdown.clone()).await.unwrap();

        let stream = TcpStream::connect(running.broadcaster_addr().unwrap()).await.unwrap();
        let mut subscriber = Framed::new(stream, VtpFrameCodec::default());
        match classify(subscriber.next().await.unwrap().unwrap()).unwrap() {
            Inbound::Transport(msg) => assert_eq!(msg.role, TransportRole::Authenticate),
            other => panic!("expected authenticate, got {other:?}"),
        }
        wait_for_subscribers(&running, 1).await;

        let author = TcpStream::connect(running.receiver_addr().unwrap()).await.unwrap();
        let report = Sender::default().send_event(author, &dummy_event()).await.unwrap();
        assert!(report.is_success());

        match classify(subscriber.next().await.unwrap().unwrap()).unwrap() {
            Inbound::Event(event) => assert_eq!(event.ivorn(), DUMMY_EVENT_IVOID),
            other => panic!("expected event, got {other:?}"),
        }
        subscriber
            .send(TransportMessage::ack(DUMMY_SERVICE_IVOID, DUMMY_EVENT_IVOID).to_bytes().unwrap())
            .await
            .unwrap();
        assert_eq!(handled.recv().await.unwrap(), DUMMY_EVENT_IVOID);

        // Same bytes again: already seen.
        let author = TcpStream::connect(running.receiver_addr().unwrap()).await.unwrap();
        let report = Sender::default().send_event(author, &dummy_event()).await.unwrap();
        assert_eq!(report.naked, 1);

        shutdown.cancel();
        running.wait().await.unwrap();
    }

    #[tokio::test]
    async fn bind_failure_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let taken = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let mut config = local_config(dir.path());
        if let Some(receiver) = config.receiver.as_mut() {
            receiver.listen = taken.local_addr().unwrap().to_string();
        }
        let broker = Broker::from_config(config).unwrap();
        assert!(matches!(
            broker.start(CancellationToken::new()).await,
            Err(VtpError::Io(_))
        ));
    }
}
