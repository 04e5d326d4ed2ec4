//! Stream-attached device timers

use crate::backend::{StreamToken, TimerToken};
use crate::error::{Error, Result};
use crate::executor::Executor;
use std::fmt;
use std::time::Duration;

/// Measures device time between two points of a stream
///
/// Start and stop are enqueued with
/// [`Chain::then_start_timer`](crate::Chain::then_start_timer) and
/// [`Chain::then_stop_timer`](crate::Chain::then_stop_timer); the elapsed time
/// is readable once the stream has been synchronized past the stop.
pub struct Timer<'e> {
    executor: &'e Executor,
    token: TimerToken,
}

impl<'e> Timer<'e> {
    pub fn new(executor: &'e Executor) -> Result<Self> {
        let token = executor.backend().create_timer()?;
        Ok(Self { executor, token })
    }

    pub fn elapsed(&self) -> Option<Duration> {
        self.executor.backend().timer_elapsed(self.token)
    }

    pub fn microseconds(&self) -> Option<u64> {
        self.elapsed().map(|d| d.as_micros() as u64)
    }

    pub fn nanoseconds(&self) -> Option<u64> {
        self.elapsed().map(|d| d.as_nanos() as u64)
    }

    pub(crate) fn start(&self, executor: &Executor, stream: StreamToken) -> Result<()> {
        self.check_owner(executor)?;
        executor.backend().start_timer(stream, self.token)
    }

    pub(crate) fn stop(&self, executor: &Executor, stream: StreamToken) -> Result<()> {
        self.check_owner(executor)?;
        executor.backend().stop_timer(stream, self.token)
    }

    fn check_owner(&self, executor: &Executor) -> Result<()> {
        if executor.id() != self.executor.id() {
            return Err(Error::invalid_handle(format!(
                "timer belongs to {}, not {}",
                self.executor.id(),
                executor.id()
            )));
        }
        Ok(())
    }
}

impl Drop for Timer<'_> {
    fn drop(&mut self) {
        self.executor.backend().destroy_timer(self.token);
    }
}

impl fmt::Debug for Timer<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Timer")
            .field("executor", &self.executor.id())
            .field("token", &self.token)
            .finish()
    }
}
