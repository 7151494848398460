//! Named serial execution queues.
//!
//! A [`WorkerQueue`] runs submitted jobs one at a time on a dedicated named
//! thread, in submission order. Handles are cheap to clone; the thread exits
//! once every handle is gone and the backlog is drained.

use std::sync::{Arc, OnceLock};
use std::thread;

use crossbeam_channel::{unbounded, Sender};

type Job = Box<dyn FnOnce() + Send>;

/// A serial queue backed by one named worker thread.
#[derive(Clone)]
pub struct WorkerQueue {
    label: Arc<str>,
    tx: Sender<Job>,
}

impl WorkerQueue {
    pub fn new(label: &str) -> WorkerQueue {
        let (tx, rx) = unbounded::<Job>();
        thread::Builder::new()
            .name(label.to_string())
            .spawn(move || {
                for job in rx {
                    job();
                }
            })
            .expect("failed to spawn worker queue thread");

        WorkerQueue {
            label: Arc::from(label),
            tx,
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Enqueues `job` behind everything already submitted.
    pub fn submit<F: FnOnce() + Send + 'static>(&self, job: F) {
        let _ = self.tx.send(Box::new(job));
    }
}

/// The shared background queue used by handlers that must not block a
/// dispatch pump.
pub fn background() -> &'static WorkerQueue {
    static QUEUE: OnceLock<WorkerQueue> = OnceLock::new();
    QUEUE.get_or_init(|| WorkerQueue::new("gatelink-background"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    #[test]
    fn jobs_run_in_submission_order() {
        let queue = WorkerQueue::new("queue-test-order");
        let seen = Arc::new(Mutex::new(Vec::new()));
        let done = Arc::new(AtomicUsize::new(0));

        for value in 0..8 {
            let seen = Arc::clone(&seen);
            let done = Arc::clone(&done);
            queue.submit(move || {
                seen.lock().unwrap().push(value);
                done.fetch_add(1, Ordering::SeqCst);
            });
        }

        while done.load(Ordering::SeqCst) < 8 {
            thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(*seen.lock().unwrap(), (0..8).collect::<Vec<_>>());
    }
}
