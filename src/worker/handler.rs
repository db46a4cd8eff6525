use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::grading::Assignment;
use crate::sandbox::{Sandbox, SandboxError};

/// What a handler gets to grade one build.
#[derive(Clone)]
pub struct BuildContext {
    pub build_name: String,
    pub source: String,
    pub commit: Option<String>,
    /// Already resolved for `source`, extensions applied
    pub assignment: Assignment,
    pub sandbox: Sandbox,
    /// Cancelled when the build is stopped or the node shuts down
    pub cancel: CancellationToken,
}

#[derive(Debug, Clone, PartialEq)]
pub struct HandlerOutput {
    pub score: f64,
    pub log: String,
}

#[derive(Error, Debug)]
pub enum HandlerError {
    /// The submission failed in an expected way (tests failed, did not
    /// compile). `critical` marks failures the operator must hear about.
    #[error("{message}")]
    Failed { message: String, critical: bool },

    #[error("grading timed out after {0:?}")]
    Timeout(Duration),

    #[error("grading was cancelled")]
    Cancelled,

    #[error("internal handler error: {0}")]
    Internal(String),
}

impl HandlerError {
    pub fn failed(message: impl Into<String>) -> Self {
        HandlerError::Failed {
            message: message.into(),
            critical: false,
        }
    }

    pub fn critical(message: impl Into<String>) -> Self {
        HandlerError::Failed {
            message: message.into(),
            critical: true,
        }
    }
}

impl From<SandboxError> for HandlerError {
    fn from(err: SandboxError) -> Self {
        match err {
            SandboxError::Timeout(after) => HandlerError::Timeout(after),
            SandboxError::Cancelled => HandlerError::Cancelled,
            other => HandlerError::Internal(other.to_string()),
        }
    }
}

pub type HandlerFuture<'a> =
    Pin<Box<dyn Future<Output = Result<HandlerOutput, HandlerError>> + Send + 'a>>;

/// Grades one kind of job.
pub trait JobHandler: Send + Sync {
    fn grade<'a>(&'a self, ctx: &'a BuildContext) -> HandlerFuture<'a>;
}

/// Maps a job (assignment) name to the handler that grades it.
pub trait HandlerResolver: Send + Sync {
    fn resolve(&self, job: &str) -> Option<Arc<dyn JobHandler>>;
}

/// Fixed table of handlers, with an optional fallback for unlisted jobs.
#[derive(Clone, Default)]
pub struct HandlerMap {
    handlers: HashMap<String, Arc<dyn JobHandler>>,
    fallback: Option<Arc<dyn JobHandler>>,
}

impl HandlerMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, job: impl Into<String>, handler: Arc<dyn JobHandler>) -> Self {
        self.handlers.insert(job.into(), handler);
        self
    }

    pub fn with_fallback(mut self, handler: Arc<dyn JobHandler>) -> Self {
        self.fallback = Some(handler);
        self
    }

    pub fn insert(&mut self, job: impl Into<String>, handler: Arc<dyn JobHandler>) {
        self.handlers.insert(job.into(), handler);
    }
}

impl HandlerResolver for HandlerMap {
    fn resolve(&self, job: &str) -> Option<Arc<dyn JobHandler>> {
        self.handlers
            .get(job)
            .cloned()
            .or_else(|| self.fallback.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Fixed(f64);

    impl JobHandler for Fixed {
        fn grade<'a>(&'a self, _ctx: &'a BuildContext) -> HandlerFuture<'a> {
            Box::pin(async move {
                Ok(HandlerOutput {
                    score: self.0,
                    log: String::new(),
                })
            })
        }
    }

    #[test]
    fn sandbox_errors_map_to_handler_errors() {
        let timeout = HandlerError::from(SandboxError::Timeout(Duration::from_secs(3)));
        assert!(matches!(timeout, HandlerError::Timeout(d) if d == Duration::from_secs(3)));
        assert!(matches!(
            HandlerError::from(SandboxError::Cancelled),
            HandlerError::Cancelled
        ));
        let docker = SandboxError::Docker {
            op: "run",
            message: "no such image".into(),
        };
        assert!(matches!(HandlerError::from(docker), HandlerError::Internal(_)));
    }

    #[test]
    fn map_prefers_exact_match() {
        let map = HandlerMap::new()
            .with("hw1", Arc::new(Fixed(1.0)))
            .with_fallback(Arc::new(Fixed(2.0)));
        assert!(map.resolve("hw1").is_some());
        assert!(map.resolve("hw9").is_some());
        assert!(HandlerMap::new().resolve("hw1").is_none());
    }
}
