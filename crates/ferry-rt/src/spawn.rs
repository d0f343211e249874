//! Detached work under a root task.

use std::future::Future;

use crate::task::TaskContext;

/// Output of a spawned future, reduced to success or failure.
///
/// Nobody awaits a spawned future, so a failure becomes the root task's
/// deferred failure instead of a return value.
pub trait Outcome {
    fn into_result(self) -> anyhow::Result<()>;
}

impl Outcome for () {
    fn into_result(self) -> anyhow::Result<()> {
        Ok(())
    }
}

impl<E> Outcome for Result<(), E>
where
    E: Into<anyhow::Error>,
{
    fn into_result(self) -> anyhow::Result<()> {
        self.map_err(Into::into)
    }
}

impl TaskContext {
    /// Run `future` in the background of this root task.
    ///
    /// The root task will not exit before `future` finishes.
    pub fn spawn<F>(&self, future: F)
    where
        F: Future + 'static,
        F::Output: Outcome,
    {
        self.begin_unit();
        let cx = self.clone();
        self.schedule(async move {
            if let Err(err) = future.await.into_result() {
                log::warn!("spawned task failed: {err:#}");
                cx.defer_failure(err);
            }
            cx.end_unit();
        });
    }
}
