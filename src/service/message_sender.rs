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
//! Outbound message pump.
//!
//! Responsibilities:
//! - Drains the process-wide outbound message cache on a dedicated pump
//!   thread and resolves each message's worker ids to nodes.
//! - Encodes a message's table once, then dispatches one transfer per
//!   destination onto the sender pool so a slow or dead destination never
//!   stalls delivery to the others.
//!
//! Current limitations:
//! - Delivery is best effort; a failed transfer is logged and dropped, and
//!   recovery is left to query-level retry.
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::thread;

use threadpool::ThreadPool;

use crate::cache::metadata::{MESSAGE_ID_LABEL, MetadataDictionary, WORKER_IDS_LABEL};
use crate::cache::{CacheData, CacheMachine};
use crate::common::types::Node;
use crate::ember_logging::{debug, error, warn};
use crate::service::transport::BufferTransport;
use crate::service::wire::{ColumnTransport, encode_columns};

pub struct MessageSender {
    outbound_cache: Arc<CacheMachine>,
    pool: ThreadPool,
    pump: Mutex<Option<thread::JoinHandle<()>>>,
}

impl MessageSender {
    /// Starts the pump over `outbound_cache`. `nodes` maps worker ids to the
    /// nodes they live on; messages addressed to ids outside the map lose
    /// that destination with a warning.
    pub fn new(
        outbound_cache: Arc<CacheMachine>,
        nodes: HashMap<String, Node>,
        num_threads: usize,
        transport: Arc<dyn BufferTransport>,
    ) -> Self {
        let pool = ThreadPool::with_name("message_sender".to_string(), num_threads.max(1));
        let pump = {
            let cache = Arc::clone(&outbound_cache);
            let pool = pool.clone();
            thread::Builder::new()
                .name("message_sender_pump".to_string())
                .spawn(move || pump_loop(cache, nodes, pool, transport))
                .expect("spawn message sender pump")
        };
        Self {
            outbound_cache,
            pool,
            pump: Mutex::new(Some(pump)),
        }
    }

    /// Finishes the outbound cache, lets the pump drain what is already
    /// queued, and waits for in-flight transfers to settle.
    pub fn shutdown(&self) {
        self.outbound_cache.finish();
        let pump = self.pump.lock().expect("message sender pump lock").take();
        if let Some(handle) = pump {
            let _ = handle.join();
        }
        self.pool.join();
    }
}

fn pump_loop(
    cache: Arc<CacheMachine>,
    nodes: HashMap<String, Node>,
    pool: ThreadPool,
    transport: Arc<dyn BufferTransport>,
) {
    while let Some(data) = cache.pop_or_wait() {
        dispatch_message(data, &nodes, &pool, &transport);
    }
    debug!("message sender pump drained");
}

fn dispatch_message(
    data: CacheData,
    nodes: &HashMap<String, Node>,
    pool: &ThreadPool,
    transport: &Arc<dyn BufferTransport>,
) {
    let message_id = data
        .metadata
        .get(MESSAGE_ID_LABEL)
        .unwrap_or("<unlabeled>")
        .to_string();
    let worker_ids = match data.metadata.get(WORKER_IDS_LABEL) {
        Some(ids) => ids.to_string(),
        None => {
            warn!(
                "outbound message {} carries no {} metadata, dropping it",
                message_id, WORKER_IDS_LABEL
            );
            return;
        }
    };

    let mut destinations = Vec::new();
    for worker_id in worker_ids.split(',').filter(|w| !w.is_empty()) {
        match nodes.get(worker_id) {
            Some(node) => destinations.push(node.clone()),
            None => warn!(
                "outbound message {} addresses unknown worker {}, skipping that destination",
                message_id, worker_id
            ),
        }
    }
    if destinations.is_empty() {
        return;
    }

    let (column_transports, buffers) = match encode_columns(&data.table) {
        Ok(encoded) => encoded,
        Err(e) => {
            error!("encode message {} failed: {}", message_id, e);
            return;
        }
    };
    let buffer_sizes: Vec<u64> = buffers.iter().map(|b| b.len() as u64).collect();
    // Encoded once, shared read-only by every per-destination transfer.
    let buffers = Arc::new(buffers);

    for node in destinations {
        let transport = Arc::clone(transport);
        let column_transports = column_transports.clone();
        let buffer_sizes = buffer_sizes.clone();
        let metadata = data.metadata.clone();
        let buffers = Arc::clone(&buffers);
        let message_id = message_id.clone();
        pool.execute(move || {
            send_to_destination(
                transport.as_ref(),
                node,
                column_transports,
                buffer_sizes,
                metadata,
                &buffers,
                &message_id,
            );
        });
    }
}

fn send_to_destination(
    transport: &dyn BufferTransport,
    node: Node,
    column_transports: Vec<ColumnTransport>,
    buffer_sizes: Vec<u64>,
    metadata: MetadataDictionary,
    buffers: &[Vec<u8>],
    message_id: &str,
) {
    let node_id = node.id.clone();
    let destination = [node];
    let mut handle =
        match transport.open(&destination, column_transports, buffer_sizes, &metadata) {
            Ok(handle) => handle,
            Err(e) => {
                error!("open transport for message {} to {}: {}", message_id, node_id, e);
                return;
            }
        };
    if let Err(e) = handle.send_begin_transmission() {
        error!("begin transmission of message {} to {}: {}", message_id, node_id, e);
        return;
    }
    for buffer in buffers {
        if !handle.any_live() {
            break;
        }
        if let Err(e) = handle.send_chunk(buffer) {
            error!("send chunk of message {} to {}: {}", message_id, node_id, e);
            return;
        }
    }
    let failures = handle.failed_destinations();
    if failures.is_empty() {
        debug!("message {} delivered to {}", message_id, node_id);
    }
    for (dest, err) in failures {
        error!("message {} to destination {} failed: {}", message_id, dest, err);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CachePolicy;
    use crate::exec::table::Table;
    use crate::service::transport::TransportHandle;
    use arrow::array::Int32Array;
    use arrow::datatypes::{DataType, Field, Schema};
    use arrow::record_batch::RecordBatch;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Debug, Default)]
    struct RecordingTransport {
        opens: Mutex<Vec<(Vec<String>, usize, String)>>,
        chunks: Arc<AtomicUsize>,
    }

    #[derive(Debug)]
    struct RecordingHandle {
        chunks: Arc<AtomicUsize>,
    }

    impl BufferTransport for RecordingTransport {
        fn open(
            &self,
            destinations: &[Node],
            _column_transports: Vec<ColumnTransport>,
            buffer_sizes: Vec<u64>,
            metadata: &MetadataDictionary,
        ) -> Result<Box<dyn TransportHandle>, String> {
            self.opens.lock().unwrap().push((
                destinations.iter().map(|n| n.id.clone()).collect(),
                buffer_sizes.len(),
                metadata
                    .get(MESSAGE_ID_LABEL)
                    .unwrap_or_default()
                    .to_string(),
            ));
            Ok(Box::new(RecordingHandle {
                chunks: Arc::clone(&self.chunks),
            }))
        }
    }

    impl TransportHandle for RecordingHandle {
        fn send_begin_transmission(&mut self) -> Result<(), String> {
            Ok(())
        }

        fn send_chunk(&mut self, _buffer: &[u8]) -> Result<(), String> {
            self.chunks.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn failed_destinations(&self) -> Vec<(String, String)> {
            Vec::new()
        }

        fn any_live(&self) -> bool {
            true
        }
    }

    fn rows_table(values: &[i32]) -> Table {
        let schema = Arc::new(Schema::new(vec![Field::new("v", DataType::Int32, false)]));
        let batch =
            RecordBatch::try_new(schema, vec![Arc::new(Int32Array::from(values.to_vec()))])
                .unwrap();
        Table::from_batch(batch)
    }

    fn node_map(ids: &[&str]) -> HashMap<String, Node> {
        ids.iter()
            .enumerate()
            .map(|(i, id)| {
                (
                    id.to_string(),
                    Node::new(*id, "127.0.0.1", 9700 + i as u16),
                )
            })
            .collect()
    }

    fn outbound_message(worker_ids: &str, message_id: &str, table: Table) -> CacheData {
        let mut md = MetadataDictionary::new();
        md.add_value(WORKER_IDS_LABEL, worker_ids);
        md.add_value(MESSAGE_ID_LABEL, message_id);
        CacheData::new(table, md)
    }

    #[test]
    fn test_pump_opens_one_transfer_per_destination() {
        let transport = Arc::new(RecordingTransport::default());
        let cache = Arc::new(CacheMachine::new(CachePolicy::Stream));
        let sender = MessageSender::new(
            Arc::clone(&cache),
            node_map(&["worker_1", "worker_2"]),
            2,
            Arc::clone(&transport) as Arc<dyn BufferTransport>,
        );

        cache.add_cache_data(
            outbound_message("worker_1,worker_2", "m_1", rows_table(&[1, 2, 3])),
            "",
            true,
        );
        sender.shutdown();

        let opens = transport.opens.lock().unwrap();
        assert_eq!(opens.len(), 2);
        let mut dests: Vec<String> = opens.iter().map(|(d, _, _)| d.join(",")).collect();
        dests.sort();
        assert_eq!(dests, vec!["worker_1", "worker_2"]);
        for (dest_ids, declared, message_id) in opens.iter() {
            assert_eq!(dest_ids.len(), 1);
            assert_eq!(*declared, 1);
            assert_eq!(message_id, "m_1");
        }
        // one declared buffer sent per destination
        assert_eq!(transport.chunks.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_unknown_worker_loses_only_that_destination() {
        let transport = Arc::new(RecordingTransport::default());
        let cache = Arc::new(CacheMachine::new(CachePolicy::Stream));
        let sender = MessageSender::new(
            Arc::clone(&cache),
            node_map(&["worker_1"]),
            1,
            Arc::clone(&transport) as Arc<dyn BufferTransport>,
        );

        cache.add_cache_data(
            outbound_message("worker_1,ghost", "m_2", rows_table(&[7])),
            "",
            true,
        );
        sender.shutdown();

        let opens = transport.opens.lock().unwrap();
        assert_eq!(opens.len(), 1);
        assert_eq!(opens[0].0, vec!["worker_1"]);
    }

    #[test]
    fn test_message_without_worker_ids_is_dropped() {
        let transport = Arc::new(RecordingTransport::default());
        let cache = Arc::new(CacheMachine::new(CachePolicy::Stream));
        let sender = MessageSender::new(
            Arc::clone(&cache),
            node_map(&["worker_1"]),
            1,
            Arc::clone(&transport) as Arc<dyn BufferTransport>,
        );

        let mut md = MetadataDictionary::new();
        md.add_value(MESSAGE_ID_LABEL, "m_3");
        cache.add_cache_data(CacheData::new(Table::empty(), md), "", true);
        sender.shutdown();

        assert!(transport.opens.lock().unwrap().is_empty());
    }
}
