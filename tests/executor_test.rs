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
//! Task executor behavior under retries, terminal failures and load.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use embersql::cache::{CacheData, CacheMachine, CachePolicy};
use embersql::common::types::{ContextToken, KernelId};
use embersql::exec::{
    ComputeStream, ExecutionGraph, GraphCompletion, Kernel, RunOutcome, TaskExecutor,
};

mod common;

use common::{rows_table, run_with_timeout};

const SETTLE_WAIT: Duration = Duration::from_secs(10);

/// Records every run's first-input row count, then fails with resource
/// exhaustion a configured number of times before succeeding.
struct RecordingKernel {
    runs: AtomicUsize,
    seen_rows: Mutex<Vec<usize>>,
    failures_before_success: usize,
}

impl RecordingKernel {
    fn new(failures_before_success: usize) -> Arc<Self> {
        Arc::new(Self {
            runs: AtomicUsize::new(0),
            seen_rows: Mutex::new(Vec::new()),
            failures_before_success,
        })
    }
}

impl Kernel for RecordingKernel {
    fn kernel_id(&self) -> KernelId {
        KernelId(1)
    }

    fn name(&self) -> &str {
        "recording"
    }

    fn process(
        &self,
        inputs: &[CacheData],
        output: &Arc<CacheMachine>,
        _stream: &ComputeStream,
    ) -> RunOutcome {
        let run = self.runs.fetch_add(1, Ordering::SeqCst);
        self.seen_rows.lock().unwrap().push(inputs[0].num_rows());
        if run < self.failures_before_success {
            return RunOutcome::ResourceExhausted("pool exhausted".to_string());
        }
        output.add_to_cache(inputs[0].table.clone(), "done", true);
        RunOutcome::Success
    }
}

/// Always fails terminally, counting its runs.
struct DoomedKernel {
    runs: AtomicUsize,
}

impl Kernel for DoomedKernel {
    fn kernel_id(&self) -> KernelId {
        KernelId(2)
    }

    fn name(&self) -> &str {
        "doomed"
    }

    fn process(
        &self,
        _inputs: &[CacheData],
        _output: &Arc<CacheMachine>,
        _stream: &ComputeStream,
    ) -> RunOutcome {
        self.runs.fetch_add(1, Ordering::SeqCst);
        RunOutcome::Failed("boom".to_string())
    }
}

#[test]
fn test_retry_preserves_task_inputs() {
    let executor = TaskExecutor::new(2, 10);
    let output = Arc::new(CacheMachine::new(CachePolicy::Stream));
    let completion = GraphCompletion::new();
    let kernel = RecordingKernel::new(2);

    let inputs = vec![CacheData::from_table(rows_table(&[1, 2, 3, 4]))];
    executor.add_task(
        inputs,
        Arc::clone(&output),
        Arc::clone(&kernel) as Arc<dyn Kernel>,
        Arc::clone(&completion),
    );

    let waited = Arc::clone(&completion);
    run_with_timeout(SETTLE_WAIT, move || waited.wait()).expect("task settles cleanly");

    assert_eq!(kernel.runs.load(Ordering::SeqCst), 3);
    // every retry ran against the original inputs
    let seen = kernel.seen_rows.lock().unwrap().clone();
    assert_eq!(seen, vec![4, 4, 4]);
    assert_eq!(output.len(), 1);

    executor.shutdown();
}

#[test]
fn test_attempts_limit_is_terminal() {
    let executor = TaskExecutor::new(1, 3);
    let output = Arc::new(CacheMachine::new(CachePolicy::Stream));
    let completion = GraphCompletion::new();
    // more failures than the executor will retry through
    let kernel = RecordingKernel::new(100);

    executor.add_task(
        vec![CacheData::from_table(rows_table(&[1]))],
        Arc::clone(&output),
        Arc::clone(&kernel) as Arc<dyn Kernel>,
        Arc::clone(&completion),
    );

    let err = completion
        .wait_with_timeout(SETTLE_WAIT)
        .expect_err("task fails terminally");
    assert!(err.contains("exhausted resources"), "err = {}", err);
    // attempts_limit retries plus the first run
    assert_eq!(kernel.runs.load(Ordering::SeqCst), 4);
    assert!(output.is_empty());

    executor.shutdown();
}

#[test]
fn test_failed_outcome_is_never_retried() {
    let executor = TaskExecutor::new(2, 10);
    let output = Arc::new(CacheMachine::new(CachePolicy::Stream));
    let completion = GraphCompletion::new();
    let kernel = Arc::new(DoomedKernel {
        runs: AtomicUsize::new(0),
    });

    executor.add_task(
        vec![CacheData::from_table(rows_table(&[1]))],
        Arc::clone(&output),
        Arc::clone(&kernel) as Arc<dyn Kernel>,
        Arc::clone(&completion),
    );

    let err = completion
        .wait_with_timeout(SETTLE_WAIT)
        .expect_err("task fails terminally");
    assert!(err.contains("boom"), "err = {}", err);
    assert_eq!(completion.failure(), Some(err));
    assert_eq!(kernel.runs.load(Ordering::SeqCst), 1);

    executor.shutdown();
}

// Tasks of one query share the graph's completion handle.
#[test]
fn test_many_tasks_settle_on_graph_completion() {
    let executor = TaskExecutor::new(2, 10);
    let outbound = Arc::new(CacheMachine::new(CachePolicy::Stream));
    let graph = ExecutionGraph::new(ContextToken(7), outbound);
    let output = graph.register_cache("output_0", CachePolicy::Stream);
    let kernel = RecordingKernel::new(0);

    for i in 0..16 {
        executor.add_task(
            vec![CacheData::from_table(rows_table(&[i]))],
            Arc::clone(&output),
            Arc::clone(&kernel) as Arc<dyn Kernel>,
            Arc::clone(graph.completion()),
        );
    }

    graph
        .completion()
        .wait_with_timeout(SETTLE_WAIT)
        .expect("all tasks settle");
    assert_eq!(graph.completion().pending_tasks(), 0);
    assert_eq!(kernel.runs.load(Ordering::SeqCst), 16);
    assert_eq!(output.len(), 16);

    executor.shutdown();
}
