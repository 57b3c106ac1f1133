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
//! Context-token to execution-graph lookup used by the inbound message path.
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::common::types::ContextToken;
use crate::exec::graph::ExecutionGraph;

#[derive(Default)]
pub struct GraphRegistry {
    graphs: Mutex<HashMap<ContextToken, Arc<ExecutionGraph>>>,
}

impl GraphRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `graph` under its token, replacing any graph still parked
    /// under the same token.
    pub fn register_graph(&self, graph: Arc<ExecutionGraph>) {
        let mut graphs = self.graphs.lock().expect("graph registry lock");
        graphs.insert(graph.token(), graph);
    }

    pub fn get_graph(&self, token: ContextToken) -> Option<Arc<ExecutionGraph>> {
        let graphs = self.graphs.lock().expect("graph registry lock");
        graphs.get(&token).map(Arc::clone)
    }

    pub fn deregister_graph(&self, token: ContextToken) -> Option<Arc<ExecutionGraph>> {
        let mut graphs = self.graphs.lock().expect("graph registry lock");
        graphs.remove(&token)
    }

    pub fn len(&self) -> usize {
        self.graphs.lock().expect("graph registry lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
