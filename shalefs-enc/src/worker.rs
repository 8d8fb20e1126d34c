//! A named, bounded worker thread pool.
//!
//! Two admission modes exist: *fixed* pools accept any number of queued
//! tasks, while *load-adaptive* pools bound the queue so that
//! [`submit`][WorkerGroup::submit] blocks once the backlog exceeds the
//! threshold. The scanner uses the latter to keep its readahead bounded.
//!
//! Tasks run FIFO with no work stealing. A panic inside a task is captured
//! and re-raised by [`wait`][WorkerGroup::wait] (or by the pool's `Drop`).

use std::{
    any::Any,
    fmt, panic,
    sync::{Arc, Mutex},
    thread,
};

use crossbeam_channel as mpmc;

type Task = Box<dyn FnOnce() + Send + 'static>;

pub struct WorkerGroup {
    injector: Option<mpmc::Sender<Task>>,
    threads: Box<[thread::JoinHandle<()>]>,
    panic: Arc<Mutex<Option<Box<dyn Any + Send>>>>,
}

impl fmt::Debug for WorkerGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerGroup")
            .field("threads", &self.threads.len())
            .field("running", &self.injector.is_some())
            .finish()
    }
}

impl WorkerGroup {
    /// A fixed pool: `thread_cnt` workers draining an unbounded queue.
    pub fn new(thread_name: &str, thread_cnt: usize) -> std::io::Result<Self> {
        let (injector, rx) = mpmc::unbounded();
        Self::new_inner(thread_name, thread_cnt.max(1), injector, rx)
    }

    /// A load-adaptive pool: `thread_cnt` workers, and `submit` blocks while
    /// more than `max_queued` tasks are waiting.
    pub fn new_load_adaptive(
        thread_name: &str,
        thread_cnt: usize,
        max_queued: usize,
    ) -> std::io::Result<Self> {
        let (injector, rx) = mpmc::bounded(max_queued.max(1));
        Self::new_inner(thread_name, thread_cnt.max(1), injector, rx)
    }

    fn new_inner(
        thread_name: &str,
        thread_cnt: usize,
        injector: mpmc::Sender<Task>,
        rx: mpmc::Receiver<Task>,
    ) -> std::io::Result<Self> {
        let panic = Arc::new(Mutex::new(None));
        let threads = (0..thread_cnt)
            .map(|idx| {
                let rx = rx.clone();
                let panic = Arc::clone(&panic);
                thread::Builder::new()
                    .name(format!("{thread_name}-{idx}"))
                    .spawn(move || Self::worker(rx, panic))
            })
            .collect::<std::io::Result<Box<[_]>>>()?;
        Ok(Self {
            injector: Some(injector),
            threads,
            panic,
        })
    }

    fn worker(rx: mpmc::Receiver<Task>, panic: Arc<Mutex<Option<Box<dyn Any + Send>>>>) {
        while let Ok(task) = rx.recv() {
            if let Err(payload) = panic::catch_unwind(panic::AssertUnwindSafe(task)) {
                panic.lock().expect("not poisoned").get_or_insert(payload);
            }
        }
    }

    /// Queue a task. Blocks on a load-adaptive pool while the queue is full.
    ///
    /// # Panics
    ///
    /// Panics if called after [`wait`][Self::wait].
    pub fn submit(&self, task: impl FnOnce() + Send + 'static) {
        self.injector
            .as_ref()
            .expect("worker group is shut down")
            .send(Box::new(task))
            .expect("workers are alive");
    }

    /// Queue a task and get a handle to retrieve its result.
    pub fn submit_with_result<T: Send + 'static>(
        &self,
        task: impl FnOnce() -> T + Send + 'static,
    ) -> TaskHandle<T> {
        let (tx, rx) = mpmc::bounded(1);
        self.submit(move || {
            // The result is dropped here if the handle is gone.
            let _ = tx.send(task());
        });
        TaskHandle { rx }
    }

    /// Wait until every submitted task has completed and the workers have
    /// exited.
    ///
    /// # Panics
    ///
    /// Re-raises the first panic captured from a worker.
    pub fn wait(&mut self) {
        self.injector = None;
        for j in std::mem::take(&mut self.threads) {
            // Worker panics are captured, not propagated through `join`.
            j.join().expect("worker exits cleanly");
        }
        if let Some(payload) = self.panic.lock().expect("not poisoned").take() {
            panic::resume_unwind(payload);
        }
    }
}

impl Drop for WorkerGroup {
    fn drop(&mut self) {
        if self.injector.is_some() && !thread::panicking() {
            self.wait();
        }
    }
}

/// A handle to the result of one task submitted via
/// [`WorkerGroup::submit_with_result`].
#[derive(Debug)]
pub struct TaskHandle<T> {
    rx: mpmc::Receiver<T>,
}

impl<T> TaskHandle<T> {
    /// Block until the task completes and take its result.
    ///
    /// # Panics
    ///
    /// Panics if the task itself panicked (the worker drops the sender).
    pub fn wait(self) -> T {
        self.rx.recv().expect("task completed without a result")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn runs_all_tasks() {
        let counter = Arc::new(AtomicUsize::new(0));
        let mut pool = WorkerGroup::new("test", 4).unwrap();
        for _ in 0..100 {
            let counter = counter.clone();
            pool.submit(move || {
                counter.fetch_add(1, Ordering::Relaxed);
            });
        }
        pool.wait();
        assert_eq!(counter.load(Ordering::Relaxed), 100);
    }

    #[test]
    fn returns_results() {
        let pool = WorkerGroup::new_load_adaptive("test", 2, 4).unwrap();
        let handles: Vec<_> = (0..16u64)
            .map(|i| pool.submit_with_result(move || i * i))
            .collect();
        let got: Vec<u64> = handles.into_iter().map(TaskHandle::wait).collect();
        assert_eq!(got, (0..16u64).map(|i| i * i).collect::<Vec<_>>());
    }

    #[test]
    #[should_panic = "boom"]
    fn surfaces_panics() {
        let mut pool = WorkerGroup::new("test", 1).unwrap();
        pool.submit(|| panic!("boom"));
        pool.wait();
    }
}
