//! Supervised Task Group
//!
//! Thin wrapper over `tokio_util::task::TaskTracker` so spawned service
//! tasks can be awaited collectively at shutdown. Tasks are spawned into a
//! group; `wait` closes the group and resolves once every tracked task has
//! finished. A group can be cloned freely — clones share the same tracker.

use std::future::Future;

use tokio_util::task::TaskTracker;

/// A group of supervised tasks awaited together at shutdown.
#[derive(Clone, Default)]
pub struct TaskGroup {
    tracker: TaskTracker,
}

impl TaskGroup {
    /// Create an empty group.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Run a future inside the group, inline on the current task. The group
    /// counts it as outstanding until it completes.
    pub async fn run<F: Future>(&self, fut: F) -> F::Output {
        self.tracker.track_future(fut).await
    }

    /// Spawn a future into the group as a background task.
    pub fn background<F>(&self, fut: F) -> tokio::task::JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.tracker.spawn(fut)
    }

    /// Number of tasks currently outstanding.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tracker.len()
    }

    /// Whether the group has no outstanding tasks.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tracker.is_empty()
    }

    /// Close the group to new tasks and wait for all outstanding ones.
    ///
    /// Tasks spawned after `wait` begins are not tracked; call this only
    /// once teardown has stopped producing work.
    pub async fn wait(&self) {
        self.tracker.close();
        self.tracker.wait().await;
    }
}
