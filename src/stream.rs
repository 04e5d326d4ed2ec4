//! Streams and operation chains
//!
//! A [`Stream`] is an ordered queue of device work on one executor. Work is
//! enqueued through a [`Chain`], an explicit chain-state value: every `then_*`
//! step consumes the chain and returns it, carrying the first failure along.
//! Once a step fails, every later step is skipped without touching the device.
//!
//! ```
//! use streamexec::{host, HostBuffer, PlatformRegistry};
//!
//! let registry = PlatformRegistry::new();
//! host::register_default(&registry).unwrap();
//! let executor = registry.lookup("host").unwrap().executor(0).unwrap();
//!
//! let device = executor.allocate_scoped(4).unwrap();
//! let readback = HostBuffer::new(4);
//! let stream = executor.create_stream().unwrap();
//! stream
//!     .init()
//!     .then_memcpy_h2d(&device, &[1, 2, 3, 4])
//!     .then_memcpy_d2h(&readback, &device)
//!     .block_host_until_done()
//!     .unwrap();
//! assert_eq!(readback.to_vec(), vec![1, 2, 3, 4]);
//! ```
//!
//! Errors surface only at synchronization points. Observing an error there
//! clears it, and the stream accepts work again; until then every chain
//! started with [`Stream::init`] begins in the failed state.

use crate::backend::{Pattern, StreamToken};
use crate::error::{Error, Result};
use crate::executor::Executor;
use crate::kernel::{KernelArgs, KernelHandle};
use crate::launch::{BlockDim, LaunchConfig, ThreadDim};
use crate::memory::{DeviceMemory, HostBuffer};
use crate::timer::Timer;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;

/// First error recorded on a stream and not yet observed.
///
/// Shared with the executor so device-wide synchronization can see it.
pub(crate) type ErrorSlot = Arc<Mutex<Option<Error>>>;

pub struct Stream<'e> {
    executor: &'e Executor,
    token: StreamToken,
    recorded: ErrorSlot,
}

impl<'e> Stream<'e> {
    pub fn new(executor: &'e Executor) -> Result<Self> {
        let token = executor.backend().create_stream()?;
        let recorded = ErrorSlot::default();
        executor.track_stream(token, Arc::clone(&recorded));
        Ok(Self {
            executor,
            token,
            recorded,
        })
    }

    pub fn executor(&self) -> &'e Executor {
        self.executor
    }

    /// Start a chain of operations on this stream.
    ///
    /// The chain starts failed if the stream holds an unobserved error.
    pub fn init(&self) -> Chain<'_, 'e> {
        let first_error = self.error();
        Chain {
            stream: self,
            first_error,
        }
    }

    /// Whether an unobserved error is recorded on the stream.
    pub fn is_ok(&self) -> bool {
        self.recorded.lock().is_none()
    }

    /// Peek at the recorded error without observing it.
    pub fn error(&self) -> Option<Error> {
        self.recorded.lock().clone()
    }

    /// Block until all work enqueued so far has completed.
    ///
    /// Returns the first error of the stream: one recorded while enqueueing
    /// takes precedence over one the backend hit while executing. Either way
    /// the error counts as observed and is cleared.
    pub fn block_host_until_done(&self) -> Result<()> {
        let executed = self.executor.backend().block_host_until_done(self.token);
        match self.recorded.lock().take() {
            Some(err) => Err(err),
            None => executed,
        }
    }

    fn record(&self, err: Error) {
        let mut recorded = self.recorded.lock();
        if recorded.is_none() {
            *recorded = Some(err);
        }
    }
}

impl Drop for Stream<'_> {
    fn drop(&mut self) {
        self.executor.forget_stream(self.token);
        self.executor.backend().destroy_stream(self.token);
    }
}

impl fmt::Debug for Stream<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Stream")
            .field("executor", &self.executor.id())
            .field("token", &self.token)
            .field("recorded", &*self.recorded.lock())
            .finish()
    }
}

/// Chain state: the stream plus the first error seen so far
///
/// A failing step records its error on the stream at once, so every other
/// chain on the stream stops doing device work until a synchronization
/// observes it.
#[must_use = "a chain's error surfaces only at the next synchronization"]
pub struct Chain<'s, 'e> {
    stream: &'s Stream<'e>,
    first_error: Option<Error>,
}

impl<'s, 'e> Chain<'s, 'e> {
    /// Run `op` unless this chain or the stream already holds an error.
    fn step(mut self, name: &'static str, op: impl FnOnce(&'e Executor, StreamToken) -> Result<()>) -> Self {
        if self.first_error.is_none() {
            self.first_error = self.stream.error();
        }
        if let Some(err) = &self.first_error {
            tracing::trace!("Skipping {} on errored stream: {}", name, err);
            return self;
        }
        if let Err(err) = op(self.stream.executor, self.stream.token) {
            tracing::debug!("{} failed: {}", name, err);
            self.stream.record(err.clone());
            self.first_error = Some(err);
        }
        self
    }

    pub fn stream(&self) -> &'s Stream<'e> {
        self.stream
    }

    pub fn error(&self) -> Option<&Error> {
        self.first_error.as_ref()
    }

    pub fn is_ok(&self) -> bool {
        self.first_error.is_none()
    }

    pub fn then_launch(
        self,
        threads: ThreadDim,
        blocks: BlockDim,
        kernel: &KernelHandle,
        args: &KernelArgs,
    ) -> Self {
        self.then_launch_with(&LaunchConfig::new(threads, blocks), kernel, args)
    }

    pub fn then_launch_with(self, config: &LaunchConfig, kernel: &KernelHandle, args: &KernelArgs) -> Self {
        self.step("launch", |executor, token| executor.launch(token, config, kernel, args))
    }

    /// Copy `src` into the start of `dst`. The bytes are staged at enqueue time.
    pub fn then_memcpy_h2d(self, dst: &DeviceMemory, src: &[u8]) -> Self {
        self.step("host-to-device copy", |executor, token| executor.memcpy_h2d(token, dst, src))
    }

    /// Copy all of `src` into the start of `dst`.
    pub fn then_memcpy_d2h(self, dst: &HostBuffer, src: &DeviceMemory) -> Self {
        self.step("device-to-host copy", |executor, token| executor.memcpy_d2h(token, dst, src))
    }

    /// Copy all of `src` into the start of `dst`.
    pub fn then_memcpy_d2d(self, dst: &DeviceMemory, src: &DeviceMemory) -> Self {
        self.step("device-to-device copy", |executor, token| executor.memcpy_d2d(token, dst, src))
    }

    pub fn then_memzero(self, dst: &DeviceMemory) -> Self {
        self.step("memzero", |executor, token| executor.memset(token, dst, Pattern::Byte(0)))
    }

    /// Fill `dst` with a repeated 32-bit pattern; its size must be a multiple of 4.
    pub fn then_memset32(self, dst: &DeviceMemory, pattern: u32) -> Self {
        self.step("memset32", |executor, token| executor.memset(token, dst, Pattern::Word(pattern)))
    }

    /// Run `callback` on a host thread once all earlier work has completed.
    pub fn then_do_host_callback(self, callback: impl FnOnce() + Send + 'static) -> Self {
        self.step("host callback", |executor, token| {
            executor.backend().host_callback(token, Box::new(callback))
        })
    }

    /// Make later work on this stream wait for everything enqueued on `other` so far.
    pub fn then_wait_for(self, other: &Stream<'_>) -> Self {
        if !std::ptr::eq(other.executor, self.stream.executor) {
            let err = Error::invalid_handle("cannot wait for a stream of another executor");
            return self.step("wait", |_, _| Err(err));
        }
        self.step("wait", |executor, token| executor.backend().wait_for(token, other.token))
    }

    pub fn then_start_timer(self, timer: &Timer<'_>) -> Self {
        self.step("start timer", |executor, token| timer.start(executor, token))
    }

    pub fn then_stop_timer(self, timer: &Timer<'_>) -> Self {
        self.step("stop timer", |executor, token| timer.stop(executor, token))
    }

    /// End the chain; any error stays on the stream for the next sync.
    pub fn finish(self) -> &'s Stream<'e> {
        self.stream
    }

    /// End the chain and wait for the stream.
    ///
    /// Reports this chain's failure even when another synchronization has
    /// already observed and cleared it on the stream.
    pub fn block_host_until_done(self) -> Result<()> {
        let synced = self.stream.block_host_until_done();
        match (synced, self.first_error) {
            (Err(err), _) | (Ok(()), Some(err)) => Err(err),
            (Ok(()), None) => Ok(()),
        }
    }
}

impl fmt::Debug for Chain<'_, '_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Chain")
            .field("stream", &self.stream.token)
            .field("first_error", &self.first_error)
            .finish()
    }
}
