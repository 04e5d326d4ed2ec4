//! Stream workers
//!
//! Each host stream is one thread draining a command channel in order.
//! Progress counters let the host block until a given command has run.

use super::heap::DeviceHeap;
use super::kernels::{HostKernelFn, KernelContext};
use crate::backend::{HostCallback, Pattern};
use crate::error::{Error, Result};
use crate::kernel::KernelArg;
use crate::launch::LaunchConfig;
use crate::memory::{DeviceMemory, HostBuffer};
use crossbeam::channel::{self, Receiver, Sender};
use parking_lot::{Condvar, Mutex};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

pub(crate) enum Command {
    Launch {
        kernel: String,
        body: HostKernelFn,
        config: LaunchConfig,
        args: Vec<KernelArg>,
    },
    CopyToDevice {
        dst: DeviceMemory,
        data: Vec<u8>,
    },
    CopyToHost {
        dst: HostBuffer,
        src: DeviceMemory,
    },
    CopyOnDevice {
        dst: DeviceMemory,
        src: DeviceMemory,
    },
    Fill {
        dst: DeviceMemory,
        pattern: Pattern,
    },
    Callback(HostCallback),
    WaitFor {
        other: Arc<Progress>,
        target: u64,
    },
    RecordTime {
        timer: Arc<TimerSlot>,
        edge: Edge,
    },
}

impl Command {
    fn name(&self) -> &'static str {
        match self {
            Command::Launch { .. } => "launch",
            Command::CopyToDevice { .. } => "host-to-device copy",
            Command::CopyToHost { .. } => "device-to-host copy",
            Command::CopyOnDevice { .. } => "device-to-device copy",
            Command::Fill { .. } => "memset",
            Command::Callback(_) => "host callback",
            Command::WaitFor { .. } => "wait",
            Command::RecordTime { .. } => "timer",
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum Edge {
    Start,
    Stop,
}

/// Start/stop instants of one timer
#[derive(Debug, Default)]
pub(crate) struct TimerSlot {
    marks: Mutex<(Option<Instant>, Option<Instant>)>,
}

impl TimerSlot {
    fn record(&self, edge: Edge) {
        let mut marks = self.marks.lock();
        match edge {
            Edge::Start => *marks = (Some(Instant::now()), None),
            Edge::Stop => marks.1 = Some(Instant::now()),
        }
    }

    pub(crate) fn elapsed(&self) -> Option<Duration> {
        match *self.marks.lock() {
            (Some(start), Some(stop)) => Some(stop.saturating_duration_since(start)),
            _ => None,
        }
    }
}

#[derive(Debug, Default)]
struct ProgressState {
    enqueued: u64,
    completed: u64,
    error: Option<Error>,
}

/// Enqueued/completed counters of one stream
#[derive(Debug, Default)]
pub(crate) struct Progress {
    state: Mutex<ProgressState>,
    changed: Condvar,
}

impl Progress {
    pub(crate) fn enqueued(&self) -> u64 {
        self.state.lock().enqueued
    }

    /// Block until the first `target` commands have completed.
    pub(crate) fn wait_for(&self, target: u64) {
        let mut state = self.state.lock();
        while state.completed < target {
            self.changed.wait(&mut state);
        }
    }

    /// Block until idle; does not observe the error.
    pub(crate) fn wait_idle(&self) {
        let target = self.enqueued();
        self.wait_for(target);
    }

    /// Block until idle, then observe (take) the error.
    pub(crate) fn wait_and_take_error(&self) -> Result<()> {
        self.wait_idle();
        match self.state.lock().error.take() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    pub(crate) fn has_error(&self) -> bool {
        self.state.lock().error.is_some()
    }

    fn complete(&self, outcome: Result<()>) {
        let mut state = self.state.lock();
        if let Err(err) = outcome {
            if state.error.is_none() {
                state.error = Some(err);
            }
        }
        state.completed += 1;
        self.changed.notify_all();
    }
}

/// One stream: a sender into its worker thread plus shared progress
pub(crate) struct StreamWorker {
    sender: Option<Sender<Command>>,
    progress: Arc<Progress>,
    handle: Option<JoinHandle<()>>,
}

impl StreamWorker {
    pub(crate) fn spawn(
        name: String,
        heap: Arc<Mutex<DeviceHeap>>,
        latency: Duration,
    ) -> Result<Self> {
        let (sender, receiver) = channel::unbounded();
        let progress = Arc::new(Progress::default());
        let worker_progress = Arc::clone(&progress);
        let handle = thread::Builder::new()
            .name(name)
            .spawn(move || run(receiver, worker_progress, heap, latency))
            .map_err(|e| Error::InitializationFailed {
                reason: format!("failed to spawn stream worker: {}", e),
            })?;
        Ok(Self {
            sender: Some(sender),
            progress,
            handle: Some(handle),
        })
    }

    pub(crate) fn progress(&self) -> &Arc<Progress> {
        &self.progress
    }

    pub(crate) fn enqueue(&self, command: Command) -> Result<()> {
        // Count under the lock so `completed` can never overtake `enqueued`.
        let mut state = self.progress.state.lock();
        let sender = self.sender.as_ref().ok_or_else(worker_gone)?;
        sender.send(command).map_err(|_| worker_gone())?;
        state.enqueued += 1;
        Ok(())
    }

    /// Let the worker drain its queue, then join it.
    pub(crate) fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        self.sender.take();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::warn!("Stream worker panicked while shutting down");
            }
        }
    }
}

impl Drop for StreamWorker {
    fn drop(&mut self) {
        self.stop();
    }
}

fn worker_gone() -> Error {
    Error::SynchronizationFailed {
        reason: "stream worker has exited".to_string(),
    }
}

fn run(
    receiver: Receiver<Command>,
    progress: Arc<Progress>,
    heap: Arc<Mutex<DeviceHeap>>,
    latency: Duration,
) {
    while let Ok(command) = receiver.recv() {
        if progress.has_error() {
            tracing::trace!("Stream errored, skipping {}", command.name());
            progress.complete(Ok(()));
            continue;
        }
        if !latency.is_zero() {
            thread::sleep(latency);
        }
        let outcome = execute(command, &heap);
        progress.complete(outcome);
    }
}

fn execute(command: Command, heap: &Mutex<DeviceHeap>) -> Result<()> {
    match command {
        Command::Launch {
            kernel,
            body,
            config,
            args,
        } => {
            let mut heap = heap.lock();
            let mut ctx = KernelContext::new(config, &args, &mut heap);
            match panic::catch_unwind(AssertUnwindSafe(|| body(&mut ctx))) {
                Ok(Ok(())) => Ok(()),
                Ok(Err(reason)) => Err(Error::LaunchFailed { kernel, reason }),
                Err(_) => Err(Error::LaunchFailed {
                    kernel,
                    reason: "kernel panicked".to_string(),
                }),
            }
        }
        Command::CopyToDevice { dst, data } => heap
            .lock()
            .write(dst, &data)
            .map_err(|e| Error::copy_failed(e.to_string())),
        Command::CopyToHost { dst, src } => {
            let heap = heap.lock();
            let bytes = heap
                .resolve(src)
                .map_err(|e| Error::copy_failed(e.to_string()))?;
            let mut host = dst.lock();
            if host.len() < bytes.len() {
                return Err(Error::copy_failed("host buffer shrank before the copy ran"));
            }
            host[..bytes.len()].copy_from_slice(bytes);
            Ok(())
        }
        Command::CopyOnDevice { dst, src } => heap
            .lock()
            .copy(dst, src)
            .map_err(|e| Error::copy_failed(e.to_string())),
        Command::Fill { dst, pattern } => heap.lock().fill(dst, pattern),
        Command::Callback(callback) => panic::catch_unwind(AssertUnwindSafe(callback))
            .map_err(|_| Error::SynchronizationFailed {
                reason: "host callback panicked".to_string(),
            }),
        Command::WaitFor { other, target } => {
            other.wait_for(target);
            Ok(())
        }
        Command::RecordTime { timer, edge } => {
            timer.record(edge);
            Ok(())
        }
    }
}
