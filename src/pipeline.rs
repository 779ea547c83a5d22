//! Validator and handler chains.
//!
//! Every incoming event goes through a [`ValidatorChain`] before the peer is
//! answered, then through a [`HandlerChain`] for its side effects. Both chains
//! are built once at startup and only read afterwards.

use std::sync::Arc;

use async_trait::async_trait;
use futures::future::join_all;
use tokio::sync::Semaphore;
use tokio::task::{AbortHandle, JoinHandle, JoinSet};
use tracing::{debug, warn};

use crate::document::Event;
use crate::types::{HandlerError, ValidationError, VtpError};

/// Decides whether an event is acceptable.
#[async_trait]
pub trait Validator: Send + Sync {
    fn name(&self) -> &str;

    async fn validate(&self, event: &Event) -> Result<(), ValidationError>;
}

/// Acts on an accepted event.
#[async_trait]
pub trait Handler: Send + Sync {
    fn name(&self) -> &str;

    async fn handle(&self, event: &Event) -> Result<(), HandlerError>;
}

/// Ordered validators, run concurrently.
#[derive(Clone, Default)]
pub struct ValidatorChain {
    validators: Vec<Arc<dyn Validator>>,
}

impl ValidatorChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, validator: impl Validator + 'static) -> Self {
        self.validators.push(Arc::new(validator));
        self
    }

    pub fn push(&mut self, validator: Arc<dyn Validator>) {
        self.validators.push(validator);
    }

    pub fn len(&self) -> usize {
        self.validators.len()
    }

    pub fn is_empty(&self) -> bool {
        self.validators.is_empty()
    }

    pub fn names(&self) -> Vec<&str> {
        self.validators.iter().map(|v| v.name()).collect()
    }

    /// Run every validator and wait for all of them.
    ///
    /// If several fail, the error reported is the one from the validator
    /// registered first, independent of completion order.
    pub async fn validate(&self, event: &Event) -> Result<(), ValidationError> {
        let results = join_all(self.validators.iter().map(|v| v.validate(event))).await;
        for (validator, result) in self.validators.iter().zip(results) {
            if let Err(err) = result {
                debug!(
                    validator = validator.name(),
                    ivorn = event.ivorn(),
                    reason = %err,
                    "event failed validation"
                );
                return Err(err);
            }
        }
        Ok(())
    }
}

/// Ordered handlers, run concurrently on a best-effort basis.
#[derive(Clone, Default)]
pub struct HandlerChain {
    handlers: Vec<Arc<dyn Handler>>,
}

impl HandlerChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, handler: impl Handler + 'static) -> Self {
        self.handlers.push(Arc::new(handler));
        self
    }

    pub fn push(&mut self, handler: Arc<dyn Handler>) {
        self.handlers.push(handler);
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    pub fn names(&self) -> Vec<&str> {
        self.handlers.iter().map(|h| h.name()).collect()
    }

    /// Run all handlers to completion. Failures are logged one by one and
    /// never affect the other handlers.
    pub async fn run(&self, event: &Event) {
        let results = join_all(self.handlers.iter().map(|h| h.handle(event))).await;
        for (handler, result) in self.handlers.iter().zip(results) {
            match result {
                Ok(()) => debug!(handler = handler.name(), ivorn = event.ivorn(), "handler done"),
                Err(err) => warn!(
                    handler = handler.name(),
                    ivorn = event.ivorn(),
                    error = %err,
                    "event handler failed"
                ),
            }
        }
    }

    /// Run the chain on its own task, detached from the caller.
    pub fn dispatch(&self, event: Event) -> JoinHandle<()> {
        let chain = self.clone();
        tokio::spawn(async move { chain.run(&event).await })
    }

    /// Run the chain on a task owned by `tasks`, so the owner can cancel it.
    pub fn dispatch_in(&self, tasks: &mut JoinSet<()>, event: Event) -> AbortHandle {
        let chain = self.clone();
        tasks.spawn(async move { chain.run(&event).await })
    }
}

/// Bounded pool for blocking work: store I/O, filter evaluation, schema and
/// signature checks.
#[derive(Debug, Clone)]
pub struct WorkerPool {
    permits: Arc<Semaphore>,
    size: usize,
}

impl WorkerPool {
    pub fn new(size: usize) -> Self {
        let size = size.max(1);
        Self {
            permits: Arc::new(Semaphore::new(size)),
            size,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    /// Run `f` on the blocking thread pool once a slot is free.
    pub async fn run<F, T>(&self, f: F) -> Result<T, VtpError>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let permit = Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map_err(|e| VtpError::Worker(e.to_string()))?;
        tokio::task::spawn_blocking(move || {
            let _permit = permit;
            f()
        })
        .await
        .map_err(|e| VtpError::Worker(e.to_string()))
    }
}

impl Default for WorkerPool {
    fn default() -> Self {
        let threads = std::thread::available_parallelism().map_or(4, |n| n.get());
        Self::new(threads)
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use parking_lot::Mutex;
    use tokio::sync::mpsc;

    use super::{Handler, Validator};
    use crate::document::Event;
    use crate::types::{HandlerError, ValidationError};

    /// Validator with a fixed answer, optionally after a delay.
    pub struct Fixed {
        pub name: &'static str,
        pub pass: bool,
        pub delay: Duration,
        pub calls: Arc<AtomicUsize>,
    }

    impl Fixed {
        pub fn pass(name: &'static str) -> Self {
            Self {
                name,
                pass: true,
                delay: Duration::ZERO,
                calls: Arc::default(),
            }
        }

        pub fn fail(name: &'static str) -> Self {
            Self {
                pass: false,
                ..Self::pass(name)
            }
        }

        pub fn after(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }
    }

    #[async_trait]
    impl Validator for Fixed {
        fn name(&self) -> &str {
            self.name
        }

        async fn validate(&self, _event: &Event) -> Result<(), ValidationError> {
            tokio::time::sleep(self.delay).await;
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.pass {
                Ok(())
            } else {
                Err(ValidationError::new(format!("{} says no", self.name)))
            }
        }
    }

    /// Handler which remembers the ivorns it saw.
    #[derive(Clone, Default)]
    pub struct Collect {
        pub seen: Arc<Mutex<Vec<String>>>,
        pub fail: bool,
    }

    #[async_trait]
    impl Handler for Collect {
        fn name(&self) -> &str {
            "collect"
        }

        async fn handle(&self, event: &Event) -> Result<(), HandlerError> {
            self.seen.lock().push(event.ivorn().to_string());
            if self.fail {
                Err(HandlerError::Other("collect failed on purpose".into()))
            } else {
                Ok(())
            }
        }
    }

    /// Handler which reports each ivorn on a channel.
    #[derive(Clone)]
    pub struct Forward {
        tx: mpsc::UnboundedSender<String>,
    }

    impl Forward {
        pub fn new() -> (Self, mpsc::UnboundedReceiver<String>) {
            let (tx, rx) = mpsc::unbounded_channel();
            (Self { tx }, rx)
        }
    }

    #[async_trait]
    impl Handler for Forward {
        fn name(&self) -> &str {
            "forward"
        }

        async fn handle(&self, event: &Event) -> Result<(), HandlerError> {
            let _ = self.tx.send(event.ivorn().to_string());
            Ok(())
        }
    }
}
