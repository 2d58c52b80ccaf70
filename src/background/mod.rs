use log::warn;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::error::{VellumError, VellumResult};

/// High-level categories of background workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerKind {
    DeadlockDetector,
}

#[derive(Debug, Clone, Copy)]
pub struct WorkerMetadata {
    pub kind: WorkerKind,
    pub interval: Option<Duration>,
}

/// Owning handle to a periodic background thread. Dropping the handle
/// signals the worker to stop and joins it.
#[derive(Debug)]
pub struct WorkerHandle {
    metadata: WorkerMetadata,
    stop_flag: Arc<AtomicBool>,
    join_handle: Option<JoinHandle<()>>,
}

impl WorkerHandle {
    pub fn metadata(&self) -> WorkerMetadata {
        self.metadata
    }

    pub fn shutdown(&self) {
        self.stop_flag.store(true, Ordering::SeqCst);
    }

    pub fn join(&mut self) {
        if let Some(handle) = self.join_handle.take() {
            if handle.join().is_err() {
                warn!(
                    "background worker {:?} terminated with panic",
                    self.metadata.kind
                );
            }
        }
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        self.shutdown();
        self.join();
    }
}

/// Spawn a named thread that sleeps `interval`, runs `tick`, and repeats
/// until the returned handle is shut down or dropped.
pub fn spawn_periodic_worker<F>(
    name: &str,
    kind: WorkerKind,
    interval: Duration,
    mut tick: F,
) -> VellumResult<WorkerHandle>
where
    F: FnMut() + Send + 'static,
{
    let stop_flag = Arc::new(AtomicBool::new(false));
    let thread_flag = stop_flag.clone();
    let join_handle = thread::Builder::new()
        .name(name.into())
        .spawn(move || loop {
            thread::sleep(interval);
            if thread_flag.load(Ordering::SeqCst) {
                break;
            }
            tick();
        })
        .map_err(VellumError::Io)?;

    Ok(WorkerHandle {
        metadata: WorkerMetadata {
            kind,
            interval: Some(interval),
        },
        stop_flag,
        join_handle: Some(join_handle),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn periodic_worker_runs_and_stops() {
        let counter = Arc::new(AtomicUsize::new(0));
        let tick_counter = counter.clone();
        let mut handle = spawn_periodic_worker(
            "test-worker",
            WorkerKind::DeadlockDetector,
            Duration::from_millis(5),
            move || {
                tick_counter.fetch_add(1, Ordering::SeqCst);
            },
        )
        .unwrap();
        assert_eq!(handle.metadata().kind, WorkerKind::DeadlockDetector);

        while counter.load(Ordering::SeqCst) == 0 {
            thread::sleep(Duration::from_millis(5));
        }

        handle.shutdown();
        handle.join();
        let frozen = counter.load(Ordering::SeqCst);
        thread::sleep(Duration::from_millis(25));
        assert_eq!(counter.load(Ordering::SeqCst), frozen);
    }
}
