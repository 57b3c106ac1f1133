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
//! Inbound message server.
//!
//! Responsibilities:
//! - Accepts one message per connection, in the wire variant the cluster is
//!   configured for, and reassembles the begin frame plus bulk buffers.
//! - Routes each decoded table into the right cache of the right execution
//!   graph: the graph's input message cache, or the named cache when the
//!   message asks for one.
//! - Messages for unknown queries or unregistered caches are dropped with a
//!   warning; queries tear down while peers may still be flushing.
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use prost::Message;
use threadpool::ThreadPool;

use crate::cache::metadata::{
    ADD_TO_SPECIFIC_CACHE_LABEL, CACHE_ID_LABEL, MESSAGE_ID_LABEL, MetadataDictionary,
    QUERY_ID_LABEL,
};
use crate::cache::{CacheData, CacheMachine};
use crate::common::config::exchange_wait_ms;
use crate::common::types::{ContextToken, Node};
use crate::ember_logging::{debug, info, warn};
use crate::exec::table::Table;
use crate::runtime::graph_registry::GraphRegistry;
use crate::service::transport::{
    STREAM_FRAME_BEGIN, read_payload, read_stream_frame_header, read_tagged_frame_header,
    send_begin_transmission_ack,
};
use crate::service::wire::{
    ACKNOWLEDGE_FRAME_NUMBER, BEGIN_FRAME_NUMBER, BeginFrame, base_message_tag, decode_columns,
    is_begin_tag, tag_frame_number,
};

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum ServerVariant {
    Stream,
    Tagged,
}

pub struct MessageServer {
    local_addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    accept_thread: Mutex<Option<thread::JoinHandle<()>>>,
    pool: ThreadPool,
}

impl MessageServer {
    /// Binds `node`'s comm address and starts accepting. `transport_kind`
    /// must match the variant the cluster's senders use.
    pub fn start(
        node: &Node,
        registry: Arc<GraphRegistry>,
        transport_kind: &str,
        num_threads: usize,
    ) -> Result<Self, String> {
        let variant = match transport_kind {
            "stream" => ServerVariant::Stream,
            "tagged" => ServerVariant::Tagged,
            other => {
                return Err(format!(
                    "unknown transport '{}', expected \"stream\" or \"tagged\"",
                    other
                ));
            }
        };
        let address = node.address();
        let listener =
            TcpListener::bind(&address).map_err(|e| format!("bind {}: {}", address, e))?;
        let local_addr = listener
            .local_addr()
            .map_err(|e| format!("local_addr {}: {}", address, e))?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let pool = ThreadPool::with_name("message_server".to_string(), num_threads.max(1));
        let accept_thread = {
            let shutdown = Arc::clone(&shutdown);
            let pool = pool.clone();
            thread::Builder::new()
                .name("message_server_accept".to_string())
                .spawn(move || accept_loop(listener, variant, registry, pool, shutdown))
                .map_err(|e| format!("spawn accept thread: {}", e))?
        };

        info!(
            "message server listening on {} ({:?} variant)",
            local_addr, variant
        );
        Ok(Self {
            local_addr,
            shutdown,
            accept_thread: Mutex::new(Some(accept_thread)),
            pool,
        })
    }

    /// The address actually bound; differs from the configured one when the
    /// configured port is 0.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stops accepting and waits for handlers already running to finish.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
        // a throwaway connection unblocks the accept loop
        let _ = TcpStream::connect(self.local_addr);
        let accept = self
            .accept_thread
            .lock()
            .expect("message server accept lock")
            .take();
        if let Some(handle) = accept {
            let _ = handle.join();
        }
        self.pool.join();
    }
}

fn accept_loop(
    listener: TcpListener,
    variant: ServerVariant,
    registry: Arc<GraphRegistry>,
    pool: ThreadPool,
    shutdown: Arc<AtomicBool>,
) {
    for conn in listener.incoming() {
        if shutdown.load(Ordering::Acquire) {
            break;
        }
        match conn {
            Ok(stream) => {
                let registry = Arc::clone(&registry);
                pool.execute(move || {
                    let peer = stream
                        .peer_addr()
                        .map(|a| a.to_string())
                        .unwrap_or_else(|_| "<unknown>".to_string());
                    if let Err(e) = handle_connection(stream, variant, &registry) {
                        warn!("inbound message from {} dropped: {}", peer, e);
                    }
                });
            }
            Err(e) => {
                warn!("accept failed: {}", e);
            }
        }
    }
    debug!("message server accept loop stopped");
}

/// One message per connection: reassemble, decode, route.
fn handle_connection(
    mut stream: TcpStream,
    variant: ServerVariant,
    registry: &GraphRegistry,
) -> Result<(), String> {
    stream
        .set_read_timeout(Some(Duration::from_millis(exchange_wait_ms())))
        .map_err(|e| format!("set_read_timeout: {}", e))?;
    let (frame, buffers) = match variant {
        ServerVariant::Stream => receive_stream_message(&mut stream)?,
        ServerVariant::Tagged => receive_tagged_message(&mut stream)?,
    };
    let metadata = frame.metadata_dictionary();
    let table = decode_columns(&frame.column_transports, buffers)?;
    route_message(registry, table, metadata)
}

fn receive_stream_message(stream: &mut TcpStream) -> Result<(BeginFrame, Vec<Vec<u8>>), String> {
    let (kind, len) =
        read_stream_frame_header(stream).map_err(|e| format!("read begin header: {}", e))?;
    if kind != STREAM_FRAME_BEGIN {
        return Err(format!("unexpected frame kind {:#04x}, expected begin", kind));
    }
    let payload =
        read_payload(stream, len as usize).map_err(|e| format!("read begin frame: {}", e))?;
    let frame =
        BeginFrame::decode(payload.as_slice()).map_err(|e| format!("decode begin frame: {}", e))?;

    let mut buffers = Vec::with_capacity(frame.buffer_sizes.len());
    for (i, size) in frame.buffer_sizes.iter().enumerate() {
        let buffer = read_payload(stream, *size as usize)
            .map_err(|e| format!("read buffer {}: {}", i, e))?;
        buffers.push(buffer);
    }
    Ok((frame, buffers))
}

fn receive_tagged_message(stream: &mut TcpStream) -> Result<(BeginFrame, Vec<Vec<u8>>), String> {
    let (begin_tag, len) =
        read_tagged_frame_header(stream).map_err(|e| format!("read begin header: {}", e))?;
    if !is_begin_tag(begin_tag) {
        return Err(format!(
            "unexpected frame {:#018x} (frame number {}), expected begin",
            begin_tag,
            tag_frame_number(begin_tag)
        ));
    }
    let payload =
        read_payload(stream, len as usize).map_err(|e| format!("read begin frame: {}", e))?;
    let frame =
        BeginFrame::decode(payload.as_slice()).map_err(|e| format!("decode begin frame: {}", e))?;

    // the acknowledge grants the transfer; data frames follow it
    send_begin_transmission_ack(stream, begin_tag)
        .map_err(|e| format!("send acknowledge: {}", e))?;

    let base = base_message_tag(begin_tag);
    let total = frame.buffer_sizes.len();
    let mut buffers: Vec<Option<Vec<u8>>> = vec![None; total];
    let mut received = 0usize;
    while received < total {
        let (tag, len) = read_tagged_frame_header(stream)
            .map_err(|e| format!("read data frame header: {}", e))?;
        if base_message_tag(tag) != base {
            return Err(format!(
                "frame {:#018x} does not belong to message {:#018x}",
                tag, base
            ));
        }
        let frame_number = tag_frame_number(tag);
        if frame_number == BEGIN_FRAME_NUMBER || frame_number == ACKNOWLEDGE_FRAME_NUMBER {
            return Err(format!(
                "control frame number {} inside the data stream",
                frame_number
            ));
        }
        let index = frame_number as usize - 1;
        if index >= total {
            return Err(format!(
                "data frame number {} exceeds the {} declared buffers",
                frame_number, total
            ));
        }
        let declared = frame.buffer_sizes[index] as usize;
        if declared != len as usize {
            return Err(format!(
                "data frame {} carries {} bytes, begin frame declared {}",
                frame_number, len, declared
            ));
        }
        let payload = read_payload(stream, len as usize)
            .map_err(|e| format!("read data frame {}: {}", frame_number, e))?;
        if buffers[index].replace(payload).is_some() {
            return Err(format!("data frame {} received twice", frame_number));
        }
        received += 1;
    }
    let buffers = buffers.into_iter().map(|b| b.unwrap_or_default()).collect();
    Ok((frame, buffers))
}

/// Places a decoded message into its destination cache. Unknown queries and
/// unregistered caches drop the message; both happen in normal operation
/// when a query finishes on this node before a peer stops sending.
fn route_message(
    registry: &GraphRegistry,
    table: Table,
    metadata: MetadataDictionary,
) -> Result<(), String> {
    let token = metadata.require(QUERY_ID_LABEL)?.parse::<ContextToken>()?;
    let Some(graph) = registry.get_graph(token) else {
        warn!("message for unknown query {} dropped", token);
        return Ok(());
    };
    let message_id = metadata.require(MESSAGE_ID_LABEL)?.to_string();

    let cache = if metadata.get(ADD_TO_SPECIFIC_CACHE_LABEL) == Some("true") {
        let cache_id = metadata.require(CACHE_ID_LABEL)?;
        match graph.cache(cache_id) {
            Some(cache) => cache,
            None => {
                warn!(
                    "query {} has no cache {} registered, message {} dropped",
                    token, cache_id, message_id
                );
                return Ok(());
            }
        }
    } else {
        Arc::clone(graph.input_message_cache())
    };

    debug!("message {} routed into query {}", message_id, token);
    cache.add_cache_data(CacheData::new(table, metadata), &message_id, true);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::CachePolicy;
    use crate::cache::metadata::{SENDER_WORKER_ID_LABEL, WORKER_IDS_LABEL};
    use crate::exec::graph::ExecutionGraph;
    use crate::service::transport::{BufferTransport, StreamTransport, TaggedTransport};
    use crate::service::wire::encode_columns;
    use arrow::array::Int32Array;
    use arrow::datatypes::{DataType, Field, Schema};
    use arrow::record_batch::RecordBatch;

    fn rows_table(values: &[i32]) -> Table {
        let schema = Arc::new(Schema::new(vec![Field::new("v", DataType::Int32, false)]));
        let batch =
            RecordBatch::try_new(schema, vec![Arc::new(Int32Array::from(values.to_vec()))])
                .unwrap();
        Table::from_batch(batch)
    }

    fn register_graph(registry: &GraphRegistry, token: u32) -> Arc<ExecutionGraph> {
        let outbound = Arc::new(CacheMachine::new(CachePolicy::Stream));
        let graph = Arc::new(ExecutionGraph::new(ContextToken(token), outbound));
        registry.register_graph(Arc::clone(&graph));
        graph
    }

    fn send_one(
        transport: &dyn BufferTransport,
        port: u16,
        table: &Table,
        metadata: &MetadataDictionary,
    ) {
        let dest = Node::new("receiver", "127.0.0.1", port);
        let (transports, buffers) = encode_columns(table).unwrap();
        let sizes: Vec<u64> = buffers.iter().map(|b| b.len() as u64).collect();
        let mut handle = transport.open(&[dest], transports, sizes, metadata).unwrap();
        handle.send_begin_transmission().unwrap();
        for buffer in &buffers {
            handle.send_chunk(buffer).unwrap();
        }
        assert!(handle.any_live(), "failures: {:?}", handle.failed_destinations());
    }

    fn base_metadata(token: u32, message_id: &str) -> MetadataDictionary {
        let mut md = MetadataDictionary::new();
        md.add_value(QUERY_ID_LABEL, token.to_string());
        md.add_value(MESSAGE_ID_LABEL, message_id);
        md.add_value(SENDER_WORKER_ID_LABEL, "worker_1");
        md.add_value(WORKER_IDS_LABEL, "worker_0");
        md.add_value(ADD_TO_SPECIFIC_CACHE_LABEL, "false");
        md
    }

    #[test]
    fn test_stream_round_trip_into_input_cache() {
        let registry = Arc::new(GraphRegistry::new());
        let graph = register_graph(&registry, 3);
        let bind = Node::new("worker_0", "127.0.0.1", 0);
        let server = MessageServer::start(&bind, Arc::clone(&registry), "stream", 2).unwrap();
        let port = server.local_addr().port();

        let table = rows_table(&[4, 5, 6]);
        send_one(
            &StreamTransport::new(),
            port,
            &table,
            &base_metadata(3, "m_stream"),
        );

        let arrived = graph
            .input_message_cache()
            .pull_cache_data_with_timeout("m_stream", Duration::from_secs(5))
            .unwrap();
        assert_eq!(arrived.num_rows(), 3);
        assert_eq!(arrived.metadata.get(SENDER_WORKER_ID_LABEL), Some("worker_1"));
        server.shutdown();
    }

    #[test]
    fn test_tagged_round_trip_into_named_cache() {
        let registry = Arc::new(GraphRegistry::new());
        let graph = register_graph(&registry, 4);
        let named = graph.register_cache("output_2", CachePolicy::Stream);
        let bind = Node::new("worker_0", "127.0.0.1", 0);
        let server = MessageServer::start(&bind, Arc::clone(&registry), "tagged", 2).unwrap();
        let port = server.local_addr().port();

        let mut md = base_metadata(4, "m_tagged");
        md.add_value(ADD_TO_SPECIFIC_CACHE_LABEL, "true");
        md.add_value(CACHE_ID_LABEL, "output_2");
        send_one(&TaggedTransport::new(1), port, &rows_table(&[9]), &md);

        let arrived = named
            .pull_cache_data_with_timeout("m_tagged", Duration::from_secs(5))
            .unwrap();
        assert_eq!(arrived.num_rows(), 1);
        // nothing leaked into the default input cache
        assert!(graph.input_message_cache().is_empty());
        server.shutdown();
    }

    #[test]
    fn test_unknown_query_dropped_server_stays_up() {
        let registry = Arc::new(GraphRegistry::new());
        let graph = register_graph(&registry, 5);
        let bind = Node::new("worker_0", "127.0.0.1", 0);
        let server = MessageServer::start(&bind, Arc::clone(&registry), "stream", 1).unwrap();
        let port = server.local_addr().port();

        send_one(
            &StreamTransport::new(),
            port,
            &Table::empty(),
            &base_metadata(99, "m_stray"),
        );
        send_one(
            &StreamTransport::new(),
            port,
            &rows_table(&[1]),
            &base_metadata(5, "m_valid"),
        );

        let arrived = graph
            .input_message_cache()
            .pull_cache_data_with_timeout("m_valid", Duration::from_secs(5))
            .unwrap();
        assert_eq!(arrived.num_rows(), 1);
        assert!(graph.input_message_cache().is_empty());
        server.shutdown();
    }
}
