//! Shutdown Coordinator
//!
//! Named completion steps over cancellation tokens. A server declares the
//! steps of its teardown up front ("accept", "reactor", "drain", ...) and
//! marks each one done as it happens; other tasks wait on the step they
//! care about instead of on a single global flag.
//!
//! ```text
//!        parent token
//!       /      |      \
//!   accept  reactor  drain        <- child steps, cancelled with parent
//!
//!   !pidfile                      <- detached step, own root
//! ```
//!
//! By default every step is a child of the parent token, so cancelling the
//! parent marks the whole set done at once. A step declared with a leading
//! `!` is detached: it gets its own root token and completes only when
//! explicitly marked, surviving a parent-wide cancel. The `!` is part of
//! the declaration only; lookups use the bare name.

use std::collections::HashMap;

use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Error building a shutdown coordinator.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ShutdownError {
    /// The same step name was declared twice.
    #[error("duplicate shutdown step: {0:?}")]
    DuplicateStep(String),
    /// A step name was empty (or just the detach marker).
    #[error("empty shutdown step name")]
    EmptyStep,
}

/// Tracks a fixed set of named shutdown steps.
#[derive(Debug)]
pub struct Shutdown {
    steps: HashMap<String, CancellationToken>,
}

impl Shutdown {
    /// Declare the steps of a shutdown sequence under `parent`.
    ///
    /// Step names prefixed with `!` are detached from the parent; the
    /// prefix is stripped before registration.
    pub fn new<S: AsRef<str>>(
        parent: &CancellationToken,
        names: impl IntoIterator<Item = S>,
    ) -> Result<Self, ShutdownError> {
        let mut steps = HashMap::new();
        for name in names {
            let name = name.as_ref();
            let (name, token) = match name.strip_prefix('!') {
                Some(bare) => (bare, CancellationToken::new()),
                None => (name, parent.child_token()),
            };
            if name.is_empty() {
                return Err(ShutdownError::EmptyStep);
            }
            if steps.insert(name.to_string(), token).is_some() {
                return Err(ShutdownError::DuplicateStep(name.to_string()));
            }
        }
        Ok(Self { steps })
    }

    /// Mark a step done. Idempotent.
    ///
    /// # Panics
    ///
    /// Panics if `name` was not declared; referring to an undeclared step
    /// is a programming error, not a runtime condition.
    pub fn done(&self, name: &str) {
        tracing::debug!(step = name, "Shutdown step done");
        self.step(name).cancel();
    }

    /// Wait until a step is done.
    ///
    /// # Panics
    ///
    /// Panics if `name` was not declared.
    pub async fn wait(&self, name: &str) {
        self.step(name).cancelled().await;
    }

    /// Whether a step is done.
    ///
    /// # Panics
    ///
    /// Panics if `name` was not declared.
    #[must_use]
    pub fn is_done(&self, name: &str) -> bool {
        self.step(name).is_cancelled()
    }

    fn step(&self, name: &str) -> &CancellationToken {
        self.steps
            .get(name)
            .unwrap_or_else(|| panic!("undeclared shutdown step: {name:?}"))
    }
}
