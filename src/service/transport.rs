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
//! Outbound transports.
//!
//! Responsibilities:
//! - `BufferTransport`/`TransportHandle`: the capability seam between the
//!   message sender and the wire. One handle moves one message to a set of
//!   destinations with per-destination failure isolation.
//! - `StreamTransport`: begin frame plus raw bulk bytes over one TCP
//!   connection per destination.
//! - `TaggedTransport`: tag-matched frames over TCP standing in for an
//!   RDMA-capable interconnect; the begin frame must be acknowledged by the
//!   receiver before data frames flow.
//!
//! Current limitations:
//! - One connection per message and destination; no connection pooling.
use std::fmt;
use std::io::{self, Read, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use bytes::{Buf, BufMut, BytesMut};
use prost::Message;

use crate::cache::metadata::MetadataDictionary;
use crate::common::config::connect_timeout_ms;
use crate::common::types::Node;
use crate::ember_logging::debug;
use crate::service::wire::{
    BEGIN_FRAME_NUMBER, BeginFrame, ColumnTransport, MAX_DATA_FRAME_NUMBER, acknowledge_tag,
    build_message_tag, data_frame_tag, is_acknowledge_tag, tag_frame_number,
};

/// Frame kind byte of the streaming-socket variant.
pub(crate) const STREAM_FRAME_BEGIN: u8 = 0x01;

/// Capability to move messages to remote nodes. One `open` call prepares a
/// single message for a destination set and yields the handle that sends it.
pub trait BufferTransport: Send + Sync + fmt::Debug {
    fn open(
        &self,
        destinations: &[Node],
        column_transports: Vec<ColumnTransport>,
        buffer_sizes: Vec<u64>,
        metadata: &MetadataDictionary,
    ) -> Result<Box<dyn TransportHandle>, String>;
}

/// In-flight state of one message. Destinations fail independently: an I/O
/// error marks that destination dead and later frames skip it, while the
/// remaining destinations keep receiving.
pub trait TransportHandle: Send + fmt::Debug {
    /// Writes the begin-transmission frame to every live destination. The
    /// tag-matched variant also waits for each destination's acknowledge
    /// before returning.
    fn send_begin_transmission(&mut self) -> Result<(), String>;

    /// Sends the next declared bulk buffer to every live destination.
    /// Transmission completes implicitly once every declared buffer has been
    /// sent.
    fn send_chunk(&mut self, buffer: &[u8]) -> Result<(), String>;

    /// Destinations lost so far: `(node id, error)` pairs.
    fn failed_destinations(&self) -> Vec<(String, String)>;

    /// Whether at least one destination is still reachable.
    fn any_live(&self) -> bool;
}

pub(crate) fn write_stream_begin(stream: &mut TcpStream, frame: &[u8]) -> io::Result<()> {
    if frame.len() > u32::MAX as usize {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "begin frame exceeds u32 length",
        ));
    }
    let mut header = BytesMut::with_capacity(5);
    header.put_u8(STREAM_FRAME_BEGIN);
    header.put_u32(frame.len() as u32);
    stream.write_all(&header)?;
    stream.write_all(frame)
}

pub(crate) fn read_stream_frame_header(stream: &mut TcpStream) -> io::Result<(u8, u32)> {
    let mut buf = [0u8; 5];
    stream.read_exact(&mut buf)?;
    let mut cursor = &buf[..];
    let kind = cursor.get_u8();
    let len = cursor.get_u32();
    Ok((kind, len))
}

pub(crate) fn write_tagged_frame(
    stream: &mut TcpStream,
    tag: u64,
    payload: &[u8],
) -> io::Result<()> {
    if payload.len() > u32::MAX as usize {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "frame payload exceeds u32 length",
        ));
    }
    let mut header = BytesMut::with_capacity(12);
    header.put_u64(tag);
    header.put_u32(payload.len() as u32);
    stream.write_all(&header)?;
    if !payload.is_empty() {
        stream.write_all(payload)?;
    }
    Ok(())
}

pub(crate) fn read_tagged_frame_header(stream: &mut TcpStream) -> io::Result<(u64, u32)> {
    let mut buf = [0u8; 12];
    stream.read_exact(&mut buf)?;
    let mut cursor = &buf[..];
    let tag = cursor.get_u64();
    let len = cursor.get_u32();
    Ok((tag, len))
}

pub(crate) fn read_payload(stream: &mut TcpStream, len: usize) -> io::Result<Vec<u8>> {
    let mut payload = vec![0u8; len];
    stream.read_exact(&mut payload)?;
    Ok(payload)
}

#[derive(Debug)]
struct Destination {
    node: Node,
    stream: Option<TcpStream>,
    error: Option<String>,
}

impl Destination {
    fn fail(&mut self, error: String) {
        self.stream = None;
        self.error = Some(error);
    }
}

fn connect_destination(node: &Node) -> Result<TcpStream, String> {
    let address = node.address();
    let timeout = Duration::from_millis(connect_timeout_ms());
    let mut addrs = address
        .to_socket_addrs()
        .map_err(|e| format!("resolve {address}: {e}"))?;
    let addr = addrs
        .next()
        .ok_or_else(|| format!("resolve {address}: no address"))?;
    let stream = TcpStream::connect_timeout(&addr, timeout)
        .map_err(|e| format!("connect {address}: {e}"))?;
    stream
        .set_nodelay(true)
        .map_err(|e| format!("set_nodelay {address}: {e}"))?;
    stream
        .set_read_timeout(Some(timeout))
        .map_err(|e| format!("set_read_timeout {address}: {e}"))?;
    Ok(stream)
}

fn open_destinations(nodes: &[Node]) -> Vec<Destination> {
    nodes
        .iter()
        .map(|node| match connect_destination(node) {
            Ok(stream) => Destination {
                node: node.clone(),
                stream: Some(stream),
                error: None,
            },
            Err(e) => {
                let mut dest = Destination {
                    node: node.clone(),
                    stream: None,
                    error: None,
                };
                dest.fail(e);
                dest
            }
        })
        .collect()
}

/// Applies one frame write to every live destination, demoting failures to
/// per-destination errors.
fn fan_out(
    destinations: &mut [Destination],
    mut write: impl FnMut(&mut TcpStream) -> io::Result<()>,
) {
    for dest in destinations.iter_mut() {
        if let Some(stream) = dest.stream.as_mut() {
            if let Err(e) = write(stream) {
                dest.fail(format!("send to {}: {}", dest.node.address(), e));
            }
        }
    }
}

fn collect_failures(destinations: &[Destination]) -> Vec<(String, String)> {
    destinations
        .iter()
        .filter_map(|d| {
            d.error
                .as_ref()
                .map(|e| (d.node.id.clone(), e.clone()))
        })
        .collect()
}

/// Plain streaming-socket variant: one synchronous begin frame, then the
/// bulk buffers raw on the same connection. No acknowledge.
#[derive(Debug)]
pub struct StreamTransport;

impl StreamTransport {
    pub fn new() -> Self {
        Self
    }
}

impl Default for StreamTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl BufferTransport for StreamTransport {
    fn open(
        &self,
        destinations: &[Node],
        column_transports: Vec<ColumnTransport>,
        buffer_sizes: Vec<u64>,
        metadata: &MetadataDictionary,
    ) -> Result<Box<dyn TransportHandle>, String> {
        let frame = BeginFrame::new(column_transports, buffer_sizes, metadata);
        let expected_buffers = frame.buffer_sizes.len();
        Ok(Box::new(StreamTransportHandle {
            destinations: open_destinations(destinations),
            begin_bytes: frame.encode_to_vec(),
            expected_buffers,
            sent_buffers: 0,
            begun: false,
        }))
    }
}

#[derive(Debug)]
struct StreamTransportHandle {
    destinations: Vec<Destination>,
    begin_bytes: Vec<u8>,
    expected_buffers: usize,
    sent_buffers: usize,
    begun: bool,
}

impl TransportHandle for StreamTransportHandle {
    fn send_begin_transmission(&mut self) -> Result<(), String> {
        if self.begun {
            return Err("begin transmission already sent".to_string());
        }
        self.begun = true;
        let begin_bytes = std::mem::take(&mut self.begin_bytes);
        fan_out(&mut self.destinations, |stream| {
            write_stream_begin(stream, &begin_bytes)
        });
        Ok(())
    }

    fn send_chunk(&mut self, buffer: &[u8]) -> Result<(), String> {
        if !self.begun {
            return Err("send_chunk before begin transmission".to_string());
        }
        if self.sent_buffers >= self.expected_buffers {
            return Err(format!(
                "send_chunk beyond the {} declared buffers",
                self.expected_buffers
            ));
        }
        self.sent_buffers += 1;
        fan_out(&mut self.destinations, |stream| stream.write_all(buffer));
        Ok(())
    }

    fn failed_destinations(&self) -> Vec<(String, String)> {
        collect_failures(&self.destinations)
    }

    fn any_live(&self) -> bool {
        self.destinations.iter().any(|d| d.stream.is_some())
    }
}

/// Tag-matched variant. Every frame carries an 8-byte tag; the receiver
/// grants the transfer by acknowledging the begin frame, which keeps it from
/// buffering transfers it never agreed to.
#[derive(Debug)]
pub struct TaggedTransport {
    worker_number: u16,
    sequence: AtomicU32,
}

impl TaggedTransport {
    pub fn new(worker_number: u16) -> Self {
        Self {
            worker_number,
            sequence: AtomicU32::new(0),
        }
    }
}

impl BufferTransport for TaggedTransport {
    fn open(
        &self,
        destinations: &[Node],
        column_transports: Vec<ColumnTransport>,
        buffer_sizes: Vec<u64>,
        metadata: &MetadataDictionary,
    ) -> Result<Box<dyn TransportHandle>, String> {
        if buffer_sizes.len() > MAX_DATA_FRAME_NUMBER as usize {
            return Err(format!(
                "message needs {} data frames, frame numbers only reach {}",
                buffer_sizes.len(),
                MAX_DATA_FRAME_NUMBER
            ));
        }
        let sequence_id = self.sequence.fetch_add(1, Ordering::Relaxed);
        let base_tag = build_message_tag(sequence_id, self.worker_number, BEGIN_FRAME_NUMBER);
        let frame = BeginFrame::new(column_transports, buffer_sizes, metadata);
        let expected_buffers = frame.buffer_sizes.len();
        Ok(Box::new(TaggedTransportHandle {
            destinations: open_destinations(destinations),
            begin_bytes: frame.encode_to_vec(),
            base_tag,
            expected_buffers,
            sent_buffers: 0,
            begun: false,
        }))
    }
}

#[derive(Debug)]
struct TaggedTransportHandle {
    destinations: Vec<Destination>,
    begin_bytes: Vec<u8>,
    base_tag: u64,
    expected_buffers: usize,
    sent_buffers: usize,
    begun: bool,
}

impl TaggedTransportHandle {
    /// Waits for the acknowledge frame of `base_tag` on one destination.
    fn recv_begin_transmission_ack(stream: &mut TcpStream, base_tag: u64) -> io::Result<()> {
        let (tag, len) = read_tagged_frame_header(stream)?;
        if !is_acknowledge_tag(tag) || tag != acknowledge_tag(base_tag) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!(
                    "unexpected frame {:#018x} (frame number {}) while waiting for acknowledge",
                    tag,
                    tag_frame_number(tag)
                ),
            ));
        }
        if len != 0 {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("acknowledge frame carries {} payload bytes, expected 0", len),
            ));
        }
        Ok(())
    }
}

impl TransportHandle for TaggedTransportHandle {
    fn send_begin_transmission(&mut self) -> Result<(), String> {
        if self.begun {
            return Err("begin transmission already sent".to_string());
        }
        self.begun = true;
        let begin_bytes = std::mem::take(&mut self.begin_bytes);
        let base_tag = self.base_tag;
        fan_out(&mut self.destinations, |stream| {
            write_tagged_frame(stream, base_tag, &begin_bytes)?;
            Self::recv_begin_transmission_ack(stream, base_tag)
        });
        debug!(
            "begin transmission acknowledged: tag={:#018x} live_destinations={}",
            self.base_tag,
            self.destinations.iter().filter(|d| d.stream.is_some()).count()
        );
        Ok(())
    }

    fn send_chunk(&mut self, buffer: &[u8]) -> Result<(), String> {
        if !self.begun {
            return Err("send_chunk before begin transmission".to_string());
        }
        if self.sent_buffers >= self.expected_buffers {
            return Err(format!(
                "send_chunk beyond the {} declared buffers",
                self.expected_buffers
            ));
        }
        self.sent_buffers += 1;
        // Frame numbers restart at 1 per message; 0 and 0xFFFF are reserved.
        let frame_tag = data_frame_tag(self.base_tag, self.sent_buffers as u16)?;
        fan_out(&mut self.destinations, |stream| {
            write_tagged_frame(stream, frame_tag, buffer)
        });
        Ok(())
    }

    fn failed_destinations(&self) -> Vec<(String, String)> {
        collect_failures(&self.destinations)
    }

    fn any_live(&self) -> bool {
        self.destinations.iter().any(|d| d.stream.is_some())
    }
}

/// Builds the transport variant named by the configuration.
pub fn build_transport(kind: &str, worker_number: u16) -> Result<std::sync::Arc<dyn BufferTransport>, String> {
    match kind {
        "stream" => Ok(std::sync::Arc::new(StreamTransport::new())),
        "tagged" => Ok(std::sync::Arc::new(TaggedTransport::new(worker_number))),
        other => Err(format!(
            "unknown transport '{}', expected \"stream\" or \"tagged\"",
            other
        )),
    }
}

/// Writes the acknowledge frame granting a tagged begin transmission.
/// Receiver-side counterpart of `recv_begin_transmission_ack`.
pub(crate) fn send_begin_transmission_ack(stream: &mut TcpStream, begin_tag: u64) -> io::Result<()> {
    write_tagged_frame(stream, acknowledge_tag(begin_tag), &[])
}
