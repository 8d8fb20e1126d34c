//! Run tasks on a small thread pool while emitting results in submission
//! order.
//!
//! Each task gets a sequence number on submission; completed results park in
//! a reorder buffer until every earlier sequence has been handed out. The
//! number of admitted-but-not-yet-emitted tasks is bounded, so a slow head
//! task applies back-pressure to the submitter.

use std::{collections::BTreeMap, panic, thread};

use crossbeam_channel as mpmc;

type Task<R> = (u64, Box<dyn FnOnce() -> R + Send>);
type TaskResult<R> = (u64, thread::Result<R>);

pub(crate) struct OrderedParallel<R> {
    tasks: Option<mpmc::Sender<Task<R>>>,
    results: mpmc::Receiver<TaskResult<R>>,
    /// Sequence number for the next submission.
    next_seq: u64,
    /// Sequence number of the next result to emit.
    next_out: u64,
    reorder: BTreeMap<u64, R>,
    max_inflight: usize,
    threads: Box<[thread::JoinHandle<()>]>,
}

impl<R> std::fmt::Debug for OrderedParallel<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrderedParallel")
            .field("next_seq", &self.next_seq)
            .field("next_out", &self.next_out)
            .field("threads", &self.threads.len())
            .finish_non_exhaustive()
    }
}

impl<R: Send + 'static> OrderedParallel<R> {
    pub fn new(thread_name: &str, thread_cnt: usize) -> std::io::Result<Self> {
        let thread_cnt = thread_cnt.max(1);
        // Allow some queued readahead beyond the running tasks: 1.5x.
        let max_inflight = thread_cnt + thread_cnt.div_ceil(2);

        let (tasks_tx, tasks_rx) = mpmc::bounded::<Task<R>>(max_inflight);
        let (results_tx, results_rx) = mpmc::bounded::<TaskResult<R>>(max_inflight);

        let threads = (0..thread_cnt)
            .map(|idx| {
                let tasks_rx = tasks_rx.clone();
                let results_tx = results_tx.clone();
                thread::Builder::new()
                    .name(format!("{thread_name}-{idx}"))
                    .spawn(move || Self::worker(tasks_rx, results_tx))
            })
            .collect::<std::io::Result<Box<[_]>>>()?;

        Ok(Self {
            tasks: Some(tasks_tx),
            results: results_rx,
            next_seq: 0,
            next_out: 0,
            reorder: BTreeMap::new(),
            max_inflight,
            threads,
        })
    }

    fn worker(tasks: mpmc::Receiver<Task<R>>, results: mpmc::Sender<TaskResult<R>>) {
        while let Ok((seq, task)) = tasks.recv() {
            let ret = panic::catch_unwind(panic::AssertUnwindSafe(task));
            if results.send((seq, ret)).is_err() {
                break;
            }
        }
    }

    fn store((seq, ret): TaskResult<R>, reorder: &mut BTreeMap<u64, R>) {
        match ret {
            Ok(v) => {
                reorder.insert(seq, v);
            }
            Err(payload) => panic::resume_unwind(payload),
        }
    }

    fn pop_ready(&mut self) -> Vec<R> {
        let mut out = Vec::new();
        while let Some(v) = self.reorder.remove(&self.next_out) {
            out.push(v);
            self.next_out += 1;
        }
        out
    }

    /// Submit a task, then return every result that is ready in order.
    ///
    /// Blocks while the in-flight window is full, which happens exactly when
    /// the oldest unfinished task is the bottleneck.
    pub fn submit_and_get<F>(&mut self, task: F) -> Vec<R>
    where
        F: FnOnce() -> R + Send + 'static,
    {
        let mut out = Vec::new();
        while (self.next_seq - self.next_out) as usize >= self.max_inflight {
            let ret = self.results.recv().expect("workers are alive");
            Self::store(ret, &mut self.reorder);
            out.append(&mut self.pop_ready());
        }

        let seq = self.next_seq;
        self.next_seq += 1;
        self.tasks
            .as_ref()
            .expect("pool is not finished")
            .send((seq, Box::new(task)))
            .expect("workers are alive");

        while let Ok(ret) = self.results.try_recv() {
            Self::store(ret, &mut self.reorder);
        }
        out.append(&mut self.pop_ready());
        out
    }

    /// Signal the end of submissions and collect all remaining results in
    /// order.
    pub fn finish(&mut self) -> Vec<R> {
        self.tasks = None;
        while self.next_out + (self.reorder.len() as u64) < self.next_seq {
            let ret = self.results.recv().expect("workers are alive");
            Self::store(ret, &mut self.reorder);
        }
        let out = self.pop_ready();
        debug_assert!(self.reorder.is_empty());
        out
    }
}

impl<R> Drop for OrderedParallel<R> {
    fn drop(&mut self) {
        self.tasks = None;
        let worker_panicked = std::mem::take(&mut self.threads)
            .into_iter()
            .fold(false, |panicked, j| panicked | j.join().is_err());
        if worker_panicked && !thread::panicking() {
            panic!("worker panicked");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn preserves_order() {
        let mut pool = OrderedParallel::new("test", 4).unwrap();
        let mut got = Vec::new();
        for i in 0..64u64 {
            got.extend(pool.submit_and_get(move || {
                // Earlier tasks sleep longer, forcing reordering inside the pool.
                thread::sleep(Duration::from_millis(64 - i));
                i
            }));
        }
        got.extend(pool.finish());
        assert_eq!(got, (0..64).collect::<Vec<_>>());
    }
}
