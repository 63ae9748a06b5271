// Copyright (c) 2025 Jonathan Fontanez
// SPDX-License-Identifier: BUSL-1.1

//! Threading utilities: bounded task pool, precise sleep, core pinning.
//!
//! Nothing on the pipeline hot path depends on the pool; it exists for
//! blocks that want to offload side work (encoding, file writes) without
//! spawning ad-hoc threads.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender};

use super::error::{PipelineError, Result};

type Job = Box<dyn FnOnce() + Send>;

/// Fixed-size worker pool fed by an unbounded channel.
///
/// Shutdown stops accepting new tasks, lets the workers drain everything
/// already queued, and joins them.
pub struct TaskPool {
    tx: Option<Sender<Job>>,
    workers: Vec<JoinHandle<()>>,
}

impl TaskPool {
    /// Create a pool with `workers` threads; 0 means one per available core.
    pub fn new(workers: usize) -> Result<Self> {
        let count = if workers == 0 {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        } else {
            workers
        };

        let (tx, rx) = crossbeam_channel::unbounded::<Job>();
        let mut handles = Vec::with_capacity(count);
        for i in 0..count {
            let rx = rx.clone();
            let spawned = std::thread::Builder::new()
                .name(format!("taskpool-{i}"))
                .spawn(move || worker_loop(rx));

            match spawned {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    // Close the channel so already-spawned workers exit,
                    // then join them before reporting the failure.
                    drop(tx);
                    for handle in handles {
                        let _ = handle.join();
                    }
                    return Err(PipelineError::ResourceUnavailable(format!(
                        "failed to spawn task pool worker: {e}"
                    )));
                }
            }
        }

        tracing::debug!("task pool created with {} workers", count);
        Ok(Self {
            tx: Some(tx),
            workers: handles,
        })
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Number of tasks queued but not yet picked up.
    pub fn pending(&self) -> usize {
        self.tx.as_ref().map(|tx| tx.len()).unwrap_or(0)
    }

    /// Submit a task; the returned handle yields its result.
    pub fn submit<T, F>(&self, task: F) -> Result<TaskHandle<T>>
    where
        T: Send + 'static,
        F: FnOnce() -> T + Send + 'static,
    {
        let tx = self
            .tx
            .as_ref()
            .ok_or_else(|| PipelineError::Cancelled("task pool is shut down".into()))?;

        let (result_tx, result_rx) = crossbeam_channel::bounded(1);
        let job: Job = Box::new(move || {
            let value = task();
            // Receiver may have been dropped; nothing to do then.
            let _ = result_tx.send(value);
        });

        tx.send(job)
            .map_err(|_| PipelineError::Cancelled("task pool is shut down".into()))?;
        Ok(TaskHandle { rx: result_rx })
    }

    /// Stop accepting tasks, finish everything queued, join workers.
    pub fn shutdown(&mut self) {
        // Dropping the sender closes the channel; workers drain what is
        // already buffered before recv() reports disconnection.
        self.tx = None;
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                tracing::error!("task pool worker panicked during shutdown");
            }
        }
        tracing::debug!("task pool shutdown complete");
    }
}

impl Drop for TaskPool {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn worker_loop(rx: Receiver<Job>) {
    while let Ok(job) = rx.recv() {
        if catch_unwind(AssertUnwindSafe(job)).is_err() {
            tracing::error!("panic in task pool job");
        }
    }
}

/// Handle to a submitted task's result.
pub struct TaskHandle<T> {
    rx: Receiver<T>,
}

impl<T> TaskHandle<T> {
    /// Block until the task completes.
    pub fn wait(self) -> Result<T> {
        self.rx
            .recv()
            .map_err(|_| PipelineError::Cancelled("task dropped before completion".into()))
    }

    /// Non-blocking poll; `None` if the task has not finished yet.
    pub fn try_wait(&self) -> Option<T> {
        self.rx.try_recv().ok()
    }
}

const SPIN_RESERVE: Duration = Duration::from_micros(500);

/// Sleep for `duration` with sub-millisecond accuracy.
///
/// Sleeps for all but the last 500us, then yield-spins to the target.
pub fn precise_sleep(duration: Duration) {
    precise_sleep_until(Instant::now() + duration);
}

/// Sleep until `deadline` with sub-millisecond accuracy.
pub fn precise_sleep_until(deadline: Instant) {
    let now = Instant::now();
    if deadline <= now {
        return;
    }

    let remaining = deadline - now;
    if remaining > SPIN_RESERVE {
        std::thread::sleep(remaining - SPIN_RESERVE);
    }

    while Instant::now() < deadline {
        std::thread::yield_now();
    }
}

/// Pin the current thread to the given CPU cores.
///
/// Returns `false` (without error) where affinity is unsupported.
#[cfg(target_os = "linux")]
pub fn pin_current_thread(cores: &[usize]) -> bool {
    if cores.is_empty() {
        return false;
    }

    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        libc::CPU_ZERO(&mut set);
        for &core in cores {
            if core < libc::CPU_SETSIZE as usize {
                libc::CPU_SET(core, &mut set);
            }
        }

        if libc::sched_setaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &set) != 0 {
            tracing::error!(
                "failed to set thread affinity: {}",
                std::io::Error::last_os_error()
            );
            return false;
        }
    }
    true
}

#[cfg(not(target_os = "linux"))]
pub fn pin_current_thread(_cores: &[usize]) -> bool {
    tracing::warn!("thread affinity not supported on this platform");
    false
}

/// Cores the current thread may run on.
#[cfg(target_os = "linux")]
pub fn available_cores() -> Vec<usize> {
    let mut cores = Vec::new();
    unsafe {
        let mut set: libc::cpu_set_t = std::mem::zeroed();
        if libc::sched_getaffinity(0, std::mem::size_of::<libc::cpu_set_t>(), &mut set) == 0 {
            for i in 0..libc::CPU_SETSIZE as usize {
                if libc::CPU_ISSET(i, &set) {
                    cores.push(i);
                }
            }
        }
    }
    cores
}

#[cfg(not(target_os = "linux"))]
pub fn available_cores() -> Vec<usize> {
    let count = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    (0..count).collect()
}

/// Raise the current thread to round-robin real-time scheduling.
///
/// Priority 0 restores the default policy. Returns `false` where
/// unsupported or not permitted.
#[cfg(target_os = "linux")]
pub fn set_current_thread_priority(priority: i32) -> bool {
    unsafe {
        let param = libc::sched_param {
            sched_priority: priority,
        };
        let policy = if priority > 0 {
            libc::SCHED_RR
        } else {
            libc::SCHED_OTHER
        };

        if libc::sched_setscheduler(0, policy, &param) != 0 {
            tracing::warn!(
                "failed to set thread priority: {}",
                std::io::Error::last_os_error()
            );
            return false;
        }
    }
    true
}

#[cfg(not(target_os = "linux"))]
pub fn set_current_thread_priority(_priority: i32) -> bool {
    tracing::warn!("thread priority not supported on this platform");
    false
}
