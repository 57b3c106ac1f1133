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
//! Process-wide service root.
//!
//! Responsibilities:
//! - Builds the long-lived services from one `EmberConfig`: cluster node
//!   list, outbound message sender, graph registry, and task executor.
//! - Hands out per-query pieces: contexts over the cluster and registered
//!   execution graphs.
//!
//! Everything hangs off the `ExecEnv` value the caller holds; nothing here
//! is process-global, so tests stand up several environments side by side.
use std::collections::HashMap;
use std::sync::Arc;

use crate::cache::{CacheMachine, CachePolicy};
use crate::common::types::{ContextToken, Node};
use crate::ember_config::EmberConfig;
use crate::ember_logging::info;
use crate::exec::executor::TaskExecutor;
use crate::exec::graph::ExecutionGraph;
use crate::runtime::context::{Context, parse_workers};
use crate::runtime::graph_registry::GraphRegistry;
use crate::service::message_sender::MessageSender;
use crate::service::message_server::MessageServer;
use crate::service::transport::build_transport;

pub struct ExecEnv {
    nodes: Vec<Node>,
    self_index: usize,
    outbound_cache: Arc<CacheMachine>,
    message_sender: MessageSender,
    graph_registry: Arc<GraphRegistry>,
    task_executor: Arc<TaskExecutor>,
}

impl std::fmt::Debug for ExecEnv {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecEnv")
            .field("nodes", &self.nodes)
            .field("self_index", &self.self_index)
            .finish_non_exhaustive()
    }
}

impl ExecEnv {
    /// Builds the environment for this worker. With no `[cluster]` workers
    /// configured the node runs single-node from its own `[node]` section;
    /// otherwise the configured node id must appear in the worker list.
    pub fn new(config: &EmberConfig) -> Result<Arc<Self>, String> {
        let nodes = if config.cluster.workers.is_empty() {
            vec![Node::new(
                config.node.id.clone(),
                config.node.host.clone(),
                config.node.comm_port,
            )]
        } else {
            parse_workers(&config.cluster.workers)?
        };
        let self_index = nodes
            .iter()
            .position(|n| n.id == config.node.id)
            .ok_or_else(|| {
                format!(
                    "node id '{}' not present in the configured worker list",
                    config.node.id
                )
            })?;

        let transport = build_transport(&config.comm.transport, self_index as u16)?;
        let outbound_cache = Arc::new(CacheMachine::new(CachePolicy::Stream));
        let node_map: HashMap<String, Node> =
            nodes.iter().map(|n| (n.id.clone(), n.clone())).collect();
        let message_sender = MessageSender::new(
            Arc::clone(&outbound_cache),
            node_map,
            config.comm.comm_threads,
            transport,
        );
        let graph_registry = Arc::new(GraphRegistry::new());
        let task_executor = TaskExecutor::new(
            config.exec.actual_exec_threads(),
            config.exec.task_attempts_limit,
        );

        info!(
            "exec env up: node={} cluster_size={} transport={}",
            nodes[self_index].id,
            nodes.len(),
            config.comm.transport
        );
        Ok(Arc::new(Self {
            nodes,
            self_index,
            outbound_cache,
            message_sender,
            graph_registry,
            task_executor,
        }))
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn self_index(&self) -> usize {
        self.self_index
    }

    pub fn self_node(&self) -> &Node {
        &self.nodes[self.self_index]
    }

    pub fn outbound_cache(&self) -> &Arc<CacheMachine> {
        &self.outbound_cache
    }

    pub fn graph_registry(&self) -> &Arc<GraphRegistry> {
        &self.graph_registry
    }

    pub fn task_executor(&self) -> &Arc<TaskExecutor> {
        &self.task_executor
    }

    /// Starts the inbound message server on this node's comm address, wired
    /// to this environment's graph registry.
    pub fn start_message_server(&self, config: &EmberConfig) -> Result<MessageServer, String> {
        MessageServer::start(
            self.self_node(),
            Arc::clone(&self.graph_registry),
            &config.comm.transport,
            config.comm.server_threads,
        )
    }

    /// The execution context every kernel of one query shares.
    pub fn build_context(&self, token: ContextToken) -> Result<Context, String> {
        Context::new(token, self.nodes.clone(), self.self_index)
    }

    /// Creates and registers the execution graph for `token`. Inbound
    /// messages for the token route into this graph from here on.
    pub fn new_graph(&self, token: ContextToken) -> Arc<ExecutionGraph> {
        let graph = Arc::new(ExecutionGraph::new(token, Arc::clone(&self.outbound_cache)));
        self.graph_registry.register_graph(Arc::clone(&graph));
        graph
    }

    /// Deregisters the graph and finishes its caches. Messages for the token
    /// that are still in flight get dropped by the server afterwards.
    pub fn teardown_graph(&self, token: ContextToken) {
        if let Some(graph) = self.graph_registry.deregister_graph(token) {
            graph.shutdown();
        }
    }

    /// Stops the outbound sender (draining what is queued) and the task
    /// executor. Graphs are torn down individually by their owners.
    pub fn shutdown(&self) {
        self.message_sender.shutdown();
        self.task_executor.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CacheData;
    use crate::common::types::KernelId;
    use crate::exec::kernel::{ComputeStream, Kernel, RunOutcome};
    use crate::exec::table::Table;
    use std::time::Duration;

    #[test]
    fn test_defaults_to_single_node() {
        let config = EmberConfig::default();
        let env = ExecEnv::new(&config).unwrap();
        assert_eq!(env.nodes().len(), 1);
        assert_eq!(env.self_index(), 0);
        assert_eq!(env.self_node().id, config.node.id);
        env.shutdown();
    }

    #[test]
    fn test_rejects_self_id_missing_from_worker_list() {
        let mut config = EmberConfig::default();
        config.node.id = "worker_9".to_string();
        config.cluster.workers = vec![
            "worker_0=127.0.0.1:9670".to_string(),
            "worker_1=127.0.0.1:9671".to_string(),
        ];
        let err = ExecEnv::new(&config).unwrap_err();
        assert!(err.contains("worker_9"), "err = {}", err);
    }

    #[test]
    fn test_graph_lifecycle() {
        let config = EmberConfig::default();
        let env = ExecEnv::new(&config).unwrap();

        let graph = env.new_graph(ContextToken(31));
        assert!(env.graph_registry().get_graph(ContextToken(31)).is_some());
        // every graph drains into the process-wide outbound cache
        assert!(Arc::ptr_eq(graph.output_message_cache(), env.outbound_cache()));

        let context = env.build_context(ContextToken(31)).unwrap();
        assert_eq!(context.total_nodes(), 1);
        assert_eq!(context.self_node().id, env.self_node().id);

        env.teardown_graph(ContextToken(31));
        assert!(env.graph_registry().get_graph(ContextToken(31)).is_none());
        assert!(graph.input_message_cache().is_finished());
        env.shutdown();
    }

    #[test]
    fn test_tasks_run_through_env_executor() {
        struct NoopKernel;

        impl Kernel for NoopKernel {
            fn kernel_id(&self) -> KernelId {
                KernelId(1)
            }

            fn name(&self) -> &str {
                "noop"
            }

            fn process(
                &self,
                _inputs: &[CacheData],
                output: &Arc<CacheMachine>,
                _stream: &ComputeStream,
            ) -> RunOutcome {
                output.add_to_cache(Table::empty(), "done", true);
                RunOutcome::Success
            }
        }

        let config = EmberConfig::default();
        let env = ExecEnv::new(&config).unwrap();
        let graph = env.new_graph(ContextToken(32));
        let output = graph.register_cache("output_0", CachePolicy::Stream);

        env.task_executor().add_task(
            Vec::new(),
            Arc::clone(&output),
            Arc::new(NoopKernel),
            Arc::clone(graph.completion()),
        );
        graph
            .completion()
            .wait_with_timeout(Duration::from_secs(10))
            .unwrap();
        assert_eq!(output.len(), 1);

        env.teardown_graph(ContextToken(32));
        env.shutdown();
    }
}
