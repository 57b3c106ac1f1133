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
//! Per-query execution graph state.
//!
//! Responsibilities:
//! - Owns the caches that incoming messages for one query land in: the
//!   default input message cache plus any named caches kernels register.
//! - Carries the completion object that the task executor settles kernel
//!   tasks against.
//!
//! Current limitations:
//! - Kernels and their edges are managed by the planner layer; this type
//!   only tracks the pieces the message path and executor need.
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::cache::{CacheMachine, CachePolicy};
use crate::common::types::ContextToken;
use crate::exec::executor::GraphCompletion;

pub struct ExecutionGraph {
    token: ContextToken,
    input_message_cache: Arc<CacheMachine>,
    output_message_cache: Arc<CacheMachine>,
    caches: Mutex<HashMap<String, Arc<CacheMachine>>>,
    completion: Arc<GraphCompletion>,
}

impl ExecutionGraph {
    /// Builds the graph for `token`. The outbound message cache is shared
    /// with the process-wide message sender; the input message cache is
    /// private to this graph.
    pub fn new(token: ContextToken, output_message_cache: Arc<CacheMachine>) -> Self {
        Self {
            token,
            input_message_cache: Arc::new(CacheMachine::new(CachePolicy::Stream)),
            output_message_cache,
            caches: Mutex::new(HashMap::new()),
            completion: GraphCompletion::new(),
        }
    }

    pub fn token(&self) -> ContextToken {
        self.token
    }

    pub fn input_message_cache(&self) -> &Arc<CacheMachine> {
        &self.input_message_cache
    }

    pub fn output_message_cache(&self) -> &Arc<CacheMachine> {
        &self.output_message_cache
    }

    pub fn completion(&self) -> &Arc<GraphCompletion> {
        &self.completion
    }

    /// Registers a named cache for messages addressed to a specific cache id.
    /// Registering an id twice returns the cache already in place so both
    /// registrants share it.
    pub fn register_cache(&self, cache_id: &str, policy: CachePolicy) -> Arc<CacheMachine> {
        let mut caches = self.caches.lock().expect("graph caches lock");
        Arc::clone(
            caches
                .entry(cache_id.to_string())
                .or_insert_with(|| Arc::new(CacheMachine::new(policy))),
        )
    }

    pub fn cache(&self, cache_id: &str) -> Option<Arc<CacheMachine>> {
        let caches = self.caches.lock().expect("graph caches lock");
        caches.get(cache_id).map(Arc::clone)
    }

    /// Finishes the graph's caches so blocked consumers drain and unblock.
    /// The shared outbound cache is left alone; it outlives any one graph.
    pub fn shutdown(&self) {
        self.input_message_cache.finish();
        let caches = self.caches.lock().expect("graph caches lock");
        for cache in caches.values() {
            cache.finish();
        }
    }
}
