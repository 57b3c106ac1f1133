// Licensed to the Apache Software Foundation (ASF) under one
// or more contributor license agreements.  See the NOTICE file
// distributed with this work for additional information
// regarding copyright ownership.  The ASF licenses this file
// to you under the Apache License, Version 2.0 (the
// "License"); you may not use this file except in compliance
// with the License.  You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing,
// software distributed under the License is distributed on an
// "AS IS" BASIS, WITHOUT WARRANTIES OR CONDITIONS OF ANY
// KIND, either express or implied.  See the License for the
// specific language governing permissions and limitations
// under the License.
//! Task executor and worker pool.
//!
//! Responsibilities:
//! - Queues kernel tasks from any thread and runs them on a bounded worker
//!   pool; a dedicated driver thread is the queue's single consumer.
//! - Each worker owns one pre-allocated compute stream for its lifetime.
//! - Retries resource-exhausted attempts up to the attempts limit with the
//!   same task id and inputs; reports terminal failures to the owning
//!   graph's completion object, never silently.
//!
//! Task life cycle:
//!
//! ```text
//!   Queued -> Running -> Completed
//!                |-----> Requeued (resource exhausted, attempts < limit)
//!                |-----> Failed   (terminal, reported to GraphCompletion)
//! ```
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crate::cache::{CacheData, CacheMachine};
use crate::ember_logging::{debug, error, info};
use crate::exec::kernel::{ComputeStream, Kernel, RunOutcome};

struct CompletionState {
    pending: usize,
    error: Option<String>,
}

/// Tracks how many tasks of one graph are still in flight and remembers the
/// first terminal failure. Owners block on `wait` to learn when the graph
/// has gone idle and whether it failed.
pub struct GraphCompletion {
    mu: Mutex<CompletionState>,
    cv: Condvar,
}

impl GraphCompletion {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            mu: Mutex::new(CompletionState {
                pending: 0,
                error: None,
            }),
            cv: Condvar::new(),
        })
    }

    pub(crate) fn task_started(&self) {
        let mut st = self.mu.lock().expect("graph completion lock");
        st.pending += 1;
    }

    pub(crate) fn task_finished(&self) {
        let mut st = self.mu.lock().expect("graph completion lock");
        if st.pending == 0 {
            return;
        }
        st.pending -= 1;
        if st.pending == 0 {
            self.cv.notify_all();
        }
    }

    /// Records a terminal failure. The first error wins; later ones are
    /// dropped so the owner sees the root cause.
    pub fn fail(&self, err: String) {
        let mut st = self.mu.lock().expect("graph completion lock");
        if st.error.is_none() {
            st.error = Some(err);
        }
        self.cv.notify_all();
    }

    pub fn failure(&self) -> Option<String> {
        self.mu
            .lock()
            .expect("graph completion lock")
            .error
            .clone()
    }

    pub fn pending_tasks(&self) -> usize {
        self.mu.lock().expect("graph completion lock").pending
    }

    /// Blocks until every started task has settled, then reports the first
    /// terminal failure if one happened.
    pub fn wait(&self) -> Result<(), String> {
        let mut st = self.mu.lock().expect("graph completion lock");
        while st.pending > 0 {
            st = self.cv.wait(st).unwrap_or_else(|e| e.into_inner());
        }
        st.error.clone().map(Err).unwrap_or(Ok(()))
    }

    /// `wait` with a deadline; a still-busy graph past the deadline is an
    /// error naming the number of unsettled tasks.
    pub fn wait_with_timeout(&self, timeout: Duration) -> Result<(), String> {
        let deadline = Instant::now() + timeout;
        let mut st = self.mu.lock().expect("graph completion lock");
        while st.pending > 0 {
            let now = Instant::now();
            if now >= deadline {
                return Err(format!(
                    "timed out after {}ms with {} tasks still pending",
                    timeout.as_millis(),
                    st.pending
                ));
            }
            let (guard, _timeout) = self
                .cv
                .wait_timeout(st, deadline - now)
                .unwrap_or_else(|e| e.into_inner());
            st = guard;
        }
        st.error.clone().map(Err).unwrap_or(Ok(()))
    }
}

/// One queued unit of kernel work. Inputs are owned by the task so a
/// resource-exhausted attempt can re-run against the identical inputs.
struct Task {
    task_id: u64,
    attempts: u32,
    inputs: Vec<CacheData>,
    output: Arc<CacheMachine>,
    kernel: Arc<dyn Kernel>,
    completion: Arc<GraphCompletion>,
}

impl Task {
    fn run(&self, stream: &ComputeStream) -> RunOutcome {
        self.kernel.process(&self.inputs, &self.output, stream)
    }
}

struct ExecutorShared {
    queue: Mutex<VecDeque<Task>>,
    cv: Condvar,
    shutdown: AtomicBool,
}

impl ExecutorShared {
    fn new() -> Self {
        Self {
            queue: Mutex::new(VecDeque::new()),
            cv: Condvar::new(),
            shutdown: AtomicBool::new(false),
        }
    }

    fn push(&self, task: Task) {
        let mut queue = self.queue.lock().expect("task queue lock");
        queue.push_back(task);
        self.cv.notify_all();
    }

    /// Blocking pop; `None` means shutdown.
    fn pop(&self) -> Option<Task> {
        let mut queue = self.queue.lock().expect("task queue lock");
        loop {
            if self.shutdown.load(Ordering::Acquire) {
                return None;
            }
            if let Some(task) = queue.pop_front() {
                return Some(task);
            }
            queue = self.cv.wait(queue).expect("task queue lock");
        }
    }

    fn stop(&self) {
        self.shutdown.store(true, Ordering::Release);
        let _queue = self.queue.lock().expect("task queue lock");
        self.cv.notify_all();
    }
}

/// Bounded-pool task executor.
///
/// `queue` feeds the driver thread (single consumer); the driver hands each
/// task to `ready`, the worker stage, where `num_threads` workers run tasks
/// on their own compute streams. Requeued tasks re-enter `queue` and flow
/// through the driver again.
pub struct TaskExecutor {
    queue: Arc<ExecutorShared>,
    ready: Arc<ExecutorShared>,
    handles: Mutex<Vec<thread::JoinHandle<()>>>,
    next_task_id: AtomicU64,
}

impl TaskExecutor {
    pub fn new(num_threads: usize, attempts_limit: u32) -> Arc<Self> {
        let num_threads = num_threads.max(1);
        let queue = Arc::new(ExecutorShared::new());
        let ready = Arc::new(ExecutorShared::new());

        let mut handles = Vec::with_capacity(num_threads + 1);
        {
            let queue = Arc::clone(&queue);
            let ready = Arc::clone(&ready);
            handles.push(
                thread::Builder::new()
                    .name("task_driver".to_string())
                    .spawn(move || driver_loop(queue, ready))
                    .expect("spawn task driver thread"),
            );
        }
        for worker_id in 0..num_threads {
            let queue = Arc::clone(&queue);
            let ready = Arc::clone(&ready);
            handles.push(
                thread::Builder::new()
                    .name(format!("task_worker_{worker_id}"))
                    .spawn(move || worker_loop(worker_id, queue, ready, attempts_limit))
                    .expect("spawn task worker thread"),
            );
        }

        info!(
            "task executor started: workers={} attempts_limit={}",
            num_threads, attempts_limit
        );
        Arc::new(Self {
            queue,
            ready,
            handles: Mutex::new(handles),
            next_task_id: AtomicU64::new(0),
        })
    }

    /// Enqueues a task with a fresh monotonic id and zero attempts. Any
    /// thread may call this; the owning graph's completion object counts the
    /// task as pending until it settles.
    pub fn add_task(
        &self,
        inputs: Vec<CacheData>,
        output: Arc<CacheMachine>,
        kernel: Arc<dyn Kernel>,
        completion: Arc<GraphCompletion>,
    ) -> u64 {
        let task_id = self.next_task_id.fetch_add(1, Ordering::Relaxed);
        completion.task_started();
        self.queue.push(Task {
            task_id,
            attempts: 0,
            inputs,
            output,
            kernel,
            completion,
        });
        task_id
    }

    /// Stops the driver and workers. Tasks still queued are dropped without
    /// settling their completion counters; callers that care drain with
    /// `GraphCompletion::wait` first.
    pub fn shutdown(&self) {
        self.queue.stop();
        self.ready.stop();
        let handles = {
            let mut guard = self.handles.lock().expect("task executor handles lock");
            std::mem::take(&mut *guard)
        };
        for handle in handles {
            let _ = handle.join();
        }
    }
}

/// Single consumer of the submission queue: pops one task at a time and
/// hands it to the worker stage. The blocking pop is the loop's only wait.
fn driver_loop(queue: Arc<ExecutorShared>, ready: Arc<ExecutorShared>) {
    while let Some(task) = queue.pop() {
        ready.push(task);
    }
}

fn worker_loop(
    worker_id: usize,
    queue: Arc<ExecutorShared>,
    ready: Arc<ExecutorShared>,
    attempts_limit: u32,
) {
    // One stream per worker slot, allocated once up front.
    let stream = ComputeStream::new(worker_id);
    debug!("task worker {} ready, stream {}", worker_id, stream.stream_id());

    while let Some(mut task) = ready.pop() {
        match task.run(&stream) {
            RunOutcome::Success => {
                task.completion.task_finished();
            }
            RunOutcome::ResourceExhausted(e) => {
                if task.attempts < attempts_limit {
                    task.attempts += 1;
                    debug!(
                        "task {} in kernel {} ({}) resource exhausted, requeue attempt {}/{}: {}",
                        task.task_id,
                        task.kernel.kernel_id(),
                        task.kernel.name(),
                        task.attempts,
                        attempts_limit,
                        e
                    );
                    queue.push(task);
                } else {
                    let err = format!(
                        "task {} in kernel {} ({}) exhausted resources after {} attempts: {}",
                        task.task_id,
                        task.kernel.kernel_id(),
                        task.kernel.name(),
                        task.attempts + 1,
                        e
                    );
                    error!("{}", err);
                    task.completion.fail(err);
                    task.completion.task_finished();
                }
            }
            RunOutcome::Failed(e) => {
                let err = format!(
                    "task {} in kernel {} ({}) failed: {}",
                    task.task_id,
                    task.kernel.kernel_id(),
                    task.kernel.name(),
                    e
                );
                error!("{}", err);
                task.completion.fail(err);
                task.completion.task_finished();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CachePolicy;
    use crate::common::types::KernelId;
    use crate::exec::table::Table;
    use std::sync::atomic::AtomicUsize;

    struct FlakyKernel {
        failures_before_success: usize,
        runs: AtomicUsize,
    }

    impl Kernel for FlakyKernel {
        fn kernel_id(&self) -> KernelId {
            KernelId(1)
        }

        fn name(&self) -> &str {
            "flaky"
        }

        fn process(
            &self,
            _inputs: &[CacheData],
            output: &Arc<CacheMachine>,
            _stream: &ComputeStream,
        ) -> RunOutcome {
            let run = self.runs.fetch_add(1, Ordering::SeqCst);
            if run < self.failures_before_success {
                return RunOutcome::ResourceExhausted("simulated oom".to_string());
            }
            output.add_to_cache(Table::empty(), "done", true);
            RunOutcome::Success
        }
    }

    #[test]
    fn test_retry_then_success() {
        let executor = TaskExecutor::new(2, 10);
        let output = Arc::new(CacheMachine::new(CachePolicy::Stream));
        let completion = GraphCompletion::new();
        let kernel = Arc::new(FlakyKernel {
            failures_before_success: 3,
            runs: AtomicUsize::new(0),
        });

        executor.add_task(Vec::new(), Arc::clone(&output), kernel.clone(), Arc::clone(&completion));
        completion
            .wait_with_timeout(Duration::from_secs(10))
            .unwrap();
        assert_eq!(kernel.runs.load(Ordering::SeqCst), 4);
        assert_eq!(output.len(), 1);
        executor.shutdown();
    }

    #[test]
    fn test_terminal_after_attempts_limit() {
        let executor = TaskExecutor::new(1, 2);
        let output = Arc::new(CacheMachine::new(CachePolicy::Stream));
        let completion = GraphCompletion::new();
        let kernel = Arc::new(FlakyKernel {
            failures_before_success: usize::MAX,
            runs: AtomicUsize::new(0),
        });

        executor.add_task(Vec::new(), output, kernel.clone(), Arc::clone(&completion));
        let err = completion
            .wait_with_timeout(Duration::from_secs(10))
            .unwrap_err();
        assert!(err.contains("exhausted resources"), "err = {}", err);
        // attempts_limit retries plus the first run
        assert_eq!(kernel.runs.load(Ordering::SeqCst), 3);
        executor.shutdown();
    }
}
