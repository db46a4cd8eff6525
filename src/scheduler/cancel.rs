use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use tokio_util::sync::CancellationToken;

/// Cancellation tokens of builds currently owned by a worker, by build name.
#[derive(Debug, Default)]
pub struct CancelRegistry {
    parent: CancellationToken,
    tokens: Mutex<HashMap<String, CancellationToken>>,
}

impl CancelRegistry {
    /// Tokens handed out are children of `parent`, so cancelling it interrupts
    /// every running build.
    pub fn new(parent: CancellationToken) -> Self {
        Self {
            parent,
            tokens: Mutex::new(HashMap::new()),
        }
    }

    fn tokens(&self) -> MutexGuard<'_, HashMap<String, CancellationToken>> {
        match self.tokens.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn register(&self, build: &str) -> CancellationToken {
        let token = self.parent.child_token();
        self.tokens().insert(build.to_string(), token.clone());
        token
    }

    /// Returns false when no worker currently holds the build.
    pub fn cancel(&self, build: &str) -> bool {
        match self.tokens().get(build) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub fn release(&self, build: &str) {
        self.tokens().remove(build);
    }

    pub fn len(&self) -> usize {
        self.tokens().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens().is_empty()
    }
}
