use std::sync::Arc;

use async_trait::async_trait;

use crate::document::Event;
use crate::pipeline::{Validator, WorkerPool};
use crate::types::ValidationError;

/// Verifies a cryptographic signature embedded in an event.
///
/// No verifier ships with the broker; deployments that need signed events
/// register their own.
pub trait SignatureVerifier: Send + Sync {
    /// `Ok(true)` for a good signature, `Ok(false)` for a bad or missing one.
    fn verify(&self, event: &Event) -> Result<bool, String>;
}

/// Rejects events whose signature does not verify.
#[derive(Clone)]
pub struct CheckSignature {
    verifier: Arc<dyn SignatureVerifier>,
    pool: WorkerPool,
}

impl CheckSignature {
    pub fn new(verifier: Arc<dyn SignatureVerifier>, pool: WorkerPool) -> Self {
        Self { verifier, pool }
    }
}

#[async_trait]
impl Validator for CheckSignature {
    fn name(&self) -> &str {
        "check-signature"
    }

    async fn validate(&self, event: &Event) -> Result<(), ValidationError> {
        let verifier = Arc::clone(&self.verifier);
        let owned = event.clone();
        let verdict = self
            .pool
            .run(move || verifier.verify(&owned))
            .await
            .map_err(|e| ValidationError::new(e.to_string()))?;
        match verdict {
            Ok(true) => Ok(()),
            Ok(false) => Err(ValidationError::new("Signature validation failed")),
            Err(reason) => Err(ValidationError::new(format!(
                "Signature validation failed: {reason}"
            ))),
        }
    }
}
