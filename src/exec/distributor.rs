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
//! Cross-node data distribution for one kernel.
//!
//! Responsibilities:
//! - Stamps outbound tables with the routing metadata the message path needs
//!   and hands them to the shared outbound cache.
//! - Tracks, per message tracker, how many partitions went to each node and
//!   which count-report messages this kernel still has to collect.
//! - Implements the distribution shapes: broadcast, scatter, per-node
//!   scatter, and the partition-count exchange.
//!
//! Kernels that move data across nodes own one `Distributor` next to their
//! other state and call it from `process`.
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::cache::metadata::{
    self, ADD_TO_SPECIFIC_CACHE_LABEL, CACHE_ID_LABEL, KERNEL_ID_LABEL, MESSAGE_ID_LABEL,
    MetadataDictionary, PARTITION_COUNT_LABEL, QUERY_ID_LABEL, SENDER_WORKER_ID_LABEL,
    TOTAL_TABLE_ROWS_LABEL, WORKER_IDS_LABEL,
};
use crate::cache::{CacheData, CacheMachine};
use crate::common::types::{KernelId, Node};
use crate::exec::graph::ExecutionGraph;
use crate::exec::table::Table;
use crate::runtime::context::Context;

struct TrackerState {
    node_count: Vec<HashMap<String, u64>>,
    messages_to_wait_for: Vec<Vec<String>>,
}

impl TrackerState {
    fn check_index(&self, message_tracker_idx: usize) -> Result<(), String> {
        if message_tracker_idx >= self.node_count.len() {
            return Err(format!(
                "message tracker index {} out of range, {} trackers configured",
                message_tracker_idx,
                self.node_count.len()
            ));
        }
        Ok(())
    }

    fn increment(&mut self, node_id: &str, message_tracker_idx: usize) -> Result<(), String> {
        self.check_index(message_tracker_idx)?;
        *self.node_count[message_tracker_idx]
            .entry(node_id.to_string())
            .or_insert(0) += 1;
        Ok(())
    }
}

/// Distribution engine for one kernel instance.
///
/// Tasks of the same kernel may run concurrently, so the tracker state sits
/// behind a mutex rather than assuming a single writer.
pub struct Distributor {
    context: Arc<Context>,
    kernel_id: KernelId,
    self_node: Node,
    input_message_cache: Arc<CacheMachine>,
    output_message_cache: Arc<CacheMachine>,
    trackers: Mutex<TrackerState>,
}

impl Distributor {
    /// Wires the distributor to its graph's message caches. Starts with one
    /// message tracker; kernels that need more call
    /// `set_message_tracker_count` before distributing.
    pub fn new(kernel_id: KernelId, context: Arc<Context>, graph: &ExecutionGraph) -> Self {
        let self_node = context.self_node().clone();
        Self {
            context,
            kernel_id,
            self_node,
            input_message_cache: Arc::clone(graph.input_message_cache()),
            output_message_cache: Arc::clone(graph.output_message_cache()),
            trackers: Mutex::new(TrackerState {
                node_count: vec![HashMap::new()],
                messages_to_wait_for: vec![Vec::new()],
            }),
        }
    }

    pub fn message_tracker_count(&self) -> usize {
        self.trackers
            .lock()
            .expect("message trackers lock")
            .node_count
            .len()
    }

    /// Resizes the tracker slots. Counters and wait lists already recorded in
    /// surviving slots are kept.
    pub fn set_message_tracker_count(&self, count: usize) {
        let mut trackers = self.trackers.lock().expect("message trackers lock");
        trackers.node_count.resize_with(count, HashMap::new);
        trackers.messages_to_wait_for.resize_with(count, Vec::new);
    }

    /// Stamps `table` with routing metadata and queues it on the outbound
    /// message cache.
    ///
    /// `target_id` is one worker id or a comma-joined list of them; the
    /// message sender fans one queued message out to every listed worker.
    /// With `wait_for` the kernel registers that it expects a reply scoped to
    /// `target_id`, collected later by `get_total_partition_counts`. When the
    /// message is kept by the outbound cache and is addressed to a specific
    /// cache, every listed destination's partition counter advances by one.
    ///
    /// The tracker index is only validated on the branches that touch tracker
    /// state.
    #[allow(clippy::too_many_arguments)]
    pub fn send_message(
        &self,
        table: Option<Table>,
        add_to_specific_cache: bool,
        cache_id: &str,
        target_id: &str,
        total_rows: Option<u64>,
        message_id_prefix: &str,
        always_add: bool,
        wait_for: bool,
        message_tracker_idx: usize,
        extra_metadata: &MetadataDictionary,
    ) -> Result<(), String> {
        let token = self.context.token();
        let mut md = MetadataDictionary::new();
        md.add_value(QUERY_ID_LABEL, token.to_string());
        md.add_value(KERNEL_ID_LABEL, self.kernel_id.to_string());
        md.add_value(ADD_TO_SPECIFIC_CACHE_LABEL, add_to_specific_cache.to_string());
        md.add_value(CACHE_ID_LABEL, cache_id);
        md.add_value(SENDER_WORKER_ID_LABEL, self.self_node.id.clone());
        md.add_value(WORKER_IDS_LABEL, target_id);
        if let Some(rows) = total_rows {
            md.add_value(TOTAL_TABLE_ROWS_LABEL, rows.to_string());
        }
        md.add_value(
            MESSAGE_ID_LABEL,
            metadata::message_id(message_id_prefix, token, self.kernel_id, &self.self_node.id),
        );
        // caller-provided labels win over the stamped ones
        md.merge_from(extra_metadata);

        let data = CacheData::new(table.unwrap_or_else(Table::empty), md);
        let added = self.output_message_cache.add_cache_data(data, "", always_add);

        if wait_for {
            let wait_id =
                metadata::message_id(message_id_prefix, token, self.kernel_id, target_id);
            let mut trackers = self.trackers.lock().expect("message trackers lock");
            trackers.check_index(message_tracker_idx)?;
            trackers.messages_to_wait_for[message_tracker_idx].push(wait_id);
        }

        if added && add_to_specific_cache {
            let mut trackers = self.trackers.lock().expect("message trackers lock");
            trackers.check_index(message_tracker_idx)?;
            for target in target_id.split(',').filter(|t| !t.is_empty()) {
                *trackers.node_count[message_tracker_idx]
                    .entry(target.to_string())
                    .or_insert(0) += 1;
            }
        }
        Ok(())
    }

    /// Totals the partitions of one tracker across the cluster: this node's
    /// own counter plus the counts every peer reported. Blocks on each
    /// outstanding count report, draining the tracker's wait list; the node
    /// counters themselves are left in place.
    pub fn get_total_partition_counts(&self, message_tracker_idx: usize) -> Result<u64, String> {
        let (mut total, wait_ids) = {
            let mut trackers = self.trackers.lock().expect("message trackers lock");
            trackers.check_index(message_tracker_idx)?;
            let own = trackers.node_count[message_tracker_idx]
                .get(&self.self_node.id)
                .copied()
                .unwrap_or(0);
            let wait_ids = std::mem::take(&mut trackers.messages_to_wait_for[message_tracker_idx]);
            (own, wait_ids)
        };

        for wait_id in wait_ids {
            let data = self.input_message_cache.pull_cache_data(&wait_id)?;
            let raw = data.metadata.get(PARTITION_COUNT_LABEL).ok_or_else(|| {
                format!(
                    "message {} carries no {} metadata",
                    wait_id, PARTITION_COUNT_LABEL
                )
            })?;
            let count: u64 = raw.parse().map_err(|_| {
                format!(
                    "message {} carries a malformed partition count '{}'",
                    wait_id, raw
                )
            })?;
            total += count;
        }
        Ok(total)
    }

    /// Reports to every other node how many partitions this kernel sent it
    /// on the given tracker, and registers the matching reply from each of
    /// them so a later `get_total_partition_counts` completes the exchange.
    pub fn send_total_partition_counts(
        &self,
        message_id_prefix: &str,
        cache_id: &str,
        message_tracker_idx: usize,
    ) -> Result<(), String> {
        let counts: Vec<(Node, u64)> = {
            let trackers = self.trackers.lock().expect("message trackers lock");
            trackers.check_index(message_tracker_idx)?;
            self.context
                .all_other_nodes()
                .into_iter()
                .map(|node| {
                    let count = trackers.node_count[message_tracker_idx]
                        .get(&node.id)
                        .copied()
                        .unwrap_or(0);
                    (node, count)
                })
                .collect()
        };

        for (node, count) in counts {
            let mut extra = MetadataDictionary::new();
            extra.add_value(PARTITION_COUNT_LABEL, count.to_string());
            self.send_message(
                None,
                false,
                cache_id,
                &node.id,
                None,
                message_id_prefix,
                true,
                true,
                message_tracker_idx,
                &extra,
            )?;
        }
        Ok(())
    }

    /// Delivers `table` to every node: locally into `output`, remotely as one
    /// outbound message addressed to all other workers at once. Remote copies
    /// advance the same tracker the local copy does, under the caller's
    /// message id prefix.
    pub fn broadcast(
        &self,
        table: &Table,
        output: &Arc<CacheMachine>,
        message_id_prefix: &str,
        cache_id: &str,
        message_tracker_idx: usize,
    ) -> Result<(), String> {
        let worker_ids: Vec<String> = self
            .context
            .all_other_nodes()
            .iter()
            .map(|n| n.id.clone())
            .collect();

        if output.add_to_cache(table.clone(), message_id_prefix, false) {
            self.increment_node_count(&self.self_node.id, message_tracker_idx)?;
        }

        if !worker_ids.is_empty() {
            self.send_message(
                Some(table.clone()),
                true,
                cache_id,
                &worker_ids.join(","),
                None,
                message_id_prefix,
                true,
                false,
                message_tracker_idx,
                &MetadataDictionary::new(),
            )?;
        }
        Ok(())
    }

    /// Distributes one partition to each node, in cluster order. Zero-row
    /// partitions are delivered like any other, so consumers see exactly one
    /// partition per scatter regardless of skew.
    pub fn scatter(
        &self,
        partitions: Vec<Table>,
        output: &Arc<CacheMachine>,
        message_id_prefix: &str,
        cache_id: &str,
        message_tracker_idx: usize,
    ) -> Result<(), String> {
        if partitions.len() != self.context.total_nodes() {
            return Err(format!(
                "scatter expects one partition per node: got {} partitions for {} nodes",
                partitions.len(),
                self.context.total_nodes()
            ));
        }

        for (node, partition) in self.context.all_nodes().iter().zip(partitions) {
            if *node == self.self_node {
                if output.add_to_cache(partition, message_id_prefix, false) {
                    self.increment_node_count(&self.self_node.id, message_tracker_idx)?;
                }
            } else {
                self.send_message(
                    Some(partition),
                    true,
                    cache_id,
                    &node.id,
                    None,
                    message_id_prefix,
                    false,
                    false,
                    message_tracker_idx,
                    &MetadataDictionary::new(),
                )?;
            }
        }
        Ok(())
    }

    /// Distributes pre-routed `(node, table)` partitions, any number per
    /// node. Partition `i` lands in cache `output_<i % per_node>` where
    /// `per_node` is the partition count divided by the cluster size, floored
    /// at one. Zero-row partitions are dropped on the remote and the local
    /// path alike. Remote sends run before local inserts.
    pub fn scatter_by_node(
        &self,
        partitions: &[(Node, Table)],
        output: &Arc<CacheMachine>,
        message_id_prefix: &str,
        message_tracker_idx: usize,
    ) -> Result<(), String> {
        let per_node = (partitions.len() / self.context.total_nodes()).max(1);

        for (i, (node, table)) in partitions.iter().enumerate() {
            if *node == self.self_node || table.num_rows() == 0 {
                continue;
            }
            let cache_id = format!("output_{}", i % per_node);
            self.send_message(
                Some(table.clone()),
                true,
                &cache_id,
                &node.id,
                None,
                message_id_prefix,
                true,
                false,
                message_tracker_idx,
                &MetadataDictionary::new(),
            )?;
        }

        for (i, (node, table)) in partitions.iter().enumerate() {
            if *node != self.self_node || table.num_rows() == 0 {
                continue;
            }
            let cache_id = format!("output_{}", i % per_node);
            if output.add_to_cache(table.clone(), &cache_id, true) {
                self.increment_node_count(&self.self_node.id, message_tracker_idx)?;
            }
        }
        Ok(())
    }

    /// Advances one node's partition counter on the given tracker.
    pub fn increment_node_count(
        &self,
        node_id: &str,
        message_tracker_idx: usize,
    ) -> Result<(), String> {
        let mut trackers = self.trackers.lock().expect("message trackers lock");
        trackers.increment(node_id, message_tracker_idx)
    }

    pub fn node_count_for(
        &self,
        message_tracker_idx: usize,
        node_id: &str,
    ) -> Result<u64, String> {
        let trackers = self.trackers.lock().expect("message trackers lock");
        trackers.check_index(message_tracker_idx)?;
        Ok(trackers.node_count[message_tracker_idx]
            .get(node_id)
            .copied()
            .unwrap_or(0))
    }

    /// How many count reports the tracker still has to collect.
    pub fn pending_message_count(&self, message_tracker_idx: usize) -> Result<usize, String> {
        let trackers = self.trackers.lock().expect("message trackers lock");
        trackers.check_index(message_tracker_idx)?;
        Ok(trackers.messages_to_wait_for[message_tracker_idx].len())
    }
}
