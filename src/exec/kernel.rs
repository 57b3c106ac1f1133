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
use std::sync::Arc;

use crate::cache::{CacheData, CacheMachine};
use crate::common::types::KernelId;

/// Result of one kernel execution attempt.
///
/// `ResourceExhausted` marks conditions that may clear on a later attempt
/// (device memory pressure, transient allocation failure); the executor
/// retries those up to its attempts limit. Every other failure is `Failed`
/// and terminal: retrying a logic error would spin forever.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RunOutcome {
    Success,
    ResourceExhausted(String),
    Failed(String),
}

/// One pre-allocated compute lane. Each executor worker owns exactly one
/// stream for its whole lifetime; tasks borrow the stream of whichever
/// worker runs them, so no task ever pays for stream construction.
#[derive(Debug)]
pub struct ComputeStream {
    stream_id: usize,
}

impl ComputeStream {
    pub(crate) fn new(stream_id: usize) -> Self {
        Self { stream_id }
    }

    pub fn stream_id(&self) -> usize {
        self.stream_id
    }
}

/// One dataflow operator instance inside an execution graph.
///
/// `process` must treat `inputs` as read-only: a retried task re-runs with
/// the exact same inputs. Operators that re-partition data across the
/// cluster hold a `Distributor` value and drive it from `process`; operators
/// that stay node-local simply don't.
pub trait Kernel: Send + Sync {
    fn kernel_id(&self) -> KernelId;

    fn name(&self) -> &str;

    fn process(
        &self,
        inputs: &[CacheData],
        output: &Arc<CacheMachine>,
        stream: &ComputeStream,
    ) -> RunOutcome;
}
