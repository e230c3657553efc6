//! Per-configuration resource sessions and the answering step that uses them.
//!
//! Both the local execute node and the queued `execute` job go through
//! [`Answering::answer`]: fingerprint the configuration, reuse or open the
//! session from the shared [`ResourceCache`], then ask the [`Responder`] with
//! provider-level retry.

use std::sync::Arc;

use async_trait::async_trait;
use cache::{CacheError, ContentSignature, Fingerprint, ResourceCache};
use chrono::{DateTime, Utc};
use queue::{retry_transient, JobConfig, RetryError, RetryPolicy};
use serde_json::{json, Value};
use thiserror::Error;
use tracing::{debug, info};

/// An opened connection to the data resource a configuration points at.
/// Expensive to create; shared across requests with the same fingerprint.
#[derive(Debug)]
pub struct ResourceSession {
    pub digest: String,
    pub tenant: String,
    pub model: String,
    pub connection_type: String,
    pub opened_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum AnswerError {
    /// The resource behind the configuration does not exist.
    #[error("resource '{0}' is not available")]
    ResourceMissing(String),

    #[error(transparent)]
    Cache(#[from] CacheError),

    /// The provider stayed busy through every retry.
    #[error("{0}")]
    Busy(String),

    #[error("provider error: {0}")]
    Provider(String),

    #[error("request has no question")]
    NoQuestion,
}

/// Produces the answer payload for one question against one session.
/// Errors are plain text so transient provider signals can be recognised.
#[async_trait]
pub trait Responder: Send + Sync {
    async fn respond(&self, session: &ResourceSession, question: &str) -> Result<Value, String>;
}

/// Answers with the question it was asked, tagged with the session it used.
/// Stands in for a model-backed responder in tests and local runs.
pub struct EchoResponder;

#[async_trait]
impl Responder for EchoResponder {
    async fn respond(&self, session: &ResourceSession, question: &str) -> Result<Value, String> {
        Ok(json!({
            "answer": question,
            "model": session.model,
            "resource": &session.digest[..12],
        }))
    }
}

/// Shared answering machinery: the session cache, the responder and the
/// retry policy for provider calls.
#[derive(Clone)]
pub struct Answering {
    sessions: Arc<ResourceCache<ResourceSession>>,
    responder: Arc<dyn Responder>,
    retry: RetryPolicy,
}

impl Answering {
    pub fn new(responder: Arc<dyn Responder>, retry: RetryPolicy) -> Self {
        Self { sessions: Arc::new(ResourceCache::new("sessions")), responder, retry }
    }

    pub fn sessions(&self) -> &ResourceCache<ResourceSession> {
        &self.sessions
    }

    /// Reuse or open the session for `config`.
    pub async fn session(&self, config: &JobConfig) -> Result<Arc<ResourceSession>, AnswerError> {
        let fingerprint = config.fingerprint()?;
        self.sessions
            .get_or_create(&fingerprint, || open_session(&fingerprint))
            .await
    }

    /// Drop a dead session so the next `session` call rebuilds it.
    pub fn invalidate(&self, config: &JobConfig) -> Result<(), AnswerError> {
        let fingerprint = config.fingerprint()?;
        self.sessions.evict(&fingerprint);
        Ok(())
    }

    pub async fn respond(
        &self,
        session: &ResourceSession,
        question: &str,
    ) -> Result<Value, AnswerError> {
        let responder = Arc::clone(&self.responder);
        let outcome = retry_transient(&self.retry, "model", || {
            let responder = Arc::clone(&responder);
            async move { responder.respond(session, question).await }
        })
        .await;

        match outcome {
            Ok(retried) => {
                debug!(attempts = retried.attempts, "responder answered");
                Ok(retried.value)
            }
            Err(RetryError::Exhausted { message, .. }) => Err(AnswerError::Busy(message)),
            Err(RetryError::Permanent(e)) => Err(AnswerError::Provider(e)),
        }
    }

    /// Full answering path for a configuration payload carrying `question`.
    pub async fn answer(&self, config: &JobConfig) -> Result<Value, AnswerError> {
        let question = config
            .extra
            .get("question")
            .and_then(Value::as_str)
            .filter(|q| !q.trim().is_empty())
            .ok_or(AnswerError::NoQuestion)?;

        let session = self.session(config).await?;
        self.respond(&session, question).await
    }
}

async fn open_session(fingerprint: &Fingerprint) -> Result<ResourceSession, AnswerError> {
    if matches!(fingerprint.content, ContentSignature::Missing) {
        return Err(AnswerError::ResourceMissing(fingerprint.to_string()));
    }
    info!(fingerprint = %fingerprint, "opening resource session");
    Ok(ResourceSession {
        digest: fingerprint.digest(),
        tenant: fingerprint.tenant.clone(),
        model: fingerprint.model.clone(),
        connection_type: fingerprint.connection_type.clone(),
        opened_at: Utc::now(),
    })
}
