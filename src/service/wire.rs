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
//! Wire-level message layout shared by both transport variants.
//!
//! Responsibilities:
//! - The begin-transmission frame (protobuf) announcing column descriptors,
//!   buffer sizes and metadata ahead of the bulk transfer.
//! - Per-column Arrow IPC serialization of tables into transfer buffers.
//! - Tag arithmetic for the tag-matched variant: an 8-byte tag whose low 4
//!   bytes are the message sequence id, next 2 bytes the sender worker
//!   number, high 2 bytes the frame number. Frame 0 is the begin frame,
//!   0xFFFF the acknowledge frame, everything between a data frame.
use std::io::Cursor;
use std::sync::Arc;

use arrow::datatypes::Schema;
use arrow::ipc::reader::StreamReader;
use arrow::ipc::writer::StreamWriter;
use arrow::record_batch::RecordBatch;

use crate::cache::metadata::MetadataDictionary;
use crate::exec::table::Table;

pub const BEGIN_TAG_MASK: u64 = 0xFFFF_0000_0000_0000;
pub const MESSAGE_TAG_MASK: u64 = 0x0000_FFFF_FFFF_FFFF;
pub const ACKNOWLEDGE_TAG_MASK: u64 = 0xFFFF_FFFF_FFFF_FFFF;

pub const BEGIN_FRAME_NUMBER: u16 = 0;
pub const ACKNOWLEDGE_FRAME_NUMBER: u16 = 0xFFFF;
/// Highest usable data frame number; data frames run 1..=0xFFFE.
pub const MAX_DATA_FRAME_NUMBER: u16 = 0xFFFE;

/// Per-column descriptor sent ahead of the column's serialized bytes.
#[derive(Clone, PartialEq, prost::Message)]
pub struct ColumnTransport {
    #[prost(string, tag = "1")]
    pub name: String,
    #[prost(string, tag = "2")]
    pub type_name: String,
    #[prost(uint64, tag = "3")]
    pub rows: u64,
    #[prost(uint64, tag = "4")]
    pub null_count: u64,
    #[prost(uint64, tag = "5")]
    pub size: u64,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct MetadataPair {
    #[prost(string, tag = "1")]
    pub label: String,
    #[prost(string, tag = "2")]
    pub value: String,
}

/// Begin-transmission control frame. Declares everything the receiver needs
/// to size its buffers and route the message before any bulk byte arrives.
#[derive(Clone, PartialEq, prost::Message)]
pub struct BeginFrame {
    #[prost(uint64, tag = "1")]
    pub message_size: u64,
    #[prost(message, repeated, tag = "2")]
    pub column_transports: Vec<ColumnTransport>,
    #[prost(uint64, repeated, tag = "3")]
    pub buffer_sizes: Vec<u64>,
    #[prost(message, repeated, tag = "4")]
    pub metadata: Vec<MetadataPair>,
}

impl BeginFrame {
    pub fn new(
        column_transports: Vec<ColumnTransport>,
        buffer_sizes: Vec<u64>,
        metadata: &MetadataDictionary,
    ) -> Self {
        let message_size = buffer_sizes.iter().sum();
        let metadata = metadata
            .iter()
            .map(|(label, value)| MetadataPair {
                label: label.to_string(),
                value: value.to_string(),
            })
            .collect();
        Self {
            message_size,
            column_transports,
            buffer_sizes,
            metadata,
        }
    }

    pub fn metadata_dictionary(&self) -> MetadataDictionary {
        let mut dict = MetadataDictionary::new();
        for pair in &self.metadata {
            dict.add_value(pair.label.clone(), pair.value.clone());
        }
        dict
    }
}

/// Serializes a table into one Arrow IPC stream per column, together with
/// the matching column descriptors. An empty table yields no buffers.
pub fn encode_columns(table: &Table) -> Result<(Vec<ColumnTransport>, Vec<Vec<u8>>), String> {
    let schema = table.schema();
    let mut transports = Vec::with_capacity(table.num_columns());
    let mut buffers = Vec::with_capacity(table.num_columns());

    for (idx, field) in schema.fields().iter().enumerate() {
        let column = table.batch().column(idx);
        let column_schema = Arc::new(Schema::new(vec![field.as_ref().clone()]));
        let batch = RecordBatch::try_new(Arc::clone(&column_schema), vec![Arc::clone(column)])
            .map_err(|e| format!("failed to build column batch for '{}': {e}", field.name()))?;

        let mut buffer = Vec::new();
        let mut writer = StreamWriter::try_new(&mut buffer, &column_schema)
            .map_err(|e| format!("failed to create Arrow IPC writer: {e}"))?;
        writer
            .write(&batch)
            .map_err(|e| format!("failed to write column '{}': {e}", field.name()))?;
        writer
            .finish()
            .map_err(|e| format!("failed to finish Arrow IPC writer: {e}"))?;

        transports.push(ColumnTransport {
            name: field.name().clone(),
            type_name: format!("{:?}", field.data_type()),
            rows: column.len() as u64,
            null_count: column.null_count() as u64,
            size: buffer.len() as u64,
        });
        buffers.push(buffer);
    }

    Ok((transports, buffers))
}

/// Rebuilds a table from per-column buffers. The inverse of
/// `encode_columns`; descriptor/buffer counts and declared row counts are
/// validated against what actually decodes.
pub fn decode_columns(
    transports: &[ColumnTransport],
    buffers: Vec<Vec<u8>>,
) -> Result<Table, String> {
    if transports.len() != buffers.len() {
        return Err(format!(
            "column transport count {} does not match buffer count {}",
            transports.len(),
            buffers.len()
        ));
    }
    if buffers.is_empty() {
        return Ok(Table::empty());
    }

    let mut fields = Vec::with_capacity(buffers.len());
    let mut columns = Vec::with_capacity(buffers.len());
    for (idx, bytes) in buffers.iter().enumerate() {
        let mut cursor = Cursor::new(bytes.as_slice());
        let reader = StreamReader::try_new(&mut cursor, None)
            .map_err(|e| format!("failed to create Arrow IPC reader: {e}"))?;
        let mut batches = reader
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| format!("failed to read column {idx}: {e}"))?;
        if batches.len() != 1 {
            return Err(format!(
                "column buffer {} holds {} record batches, expected exactly 1",
                idx,
                batches.len()
            ));
        }
        let batch = batches.remove(0);
        if batch.num_columns() != 1 {
            return Err(format!(
                "column buffer {} decoded to {} columns, expected exactly 1",
                idx,
                batch.num_columns()
            ));
        }
        if batch.num_rows() as u64 != transports[idx].rows {
            return Err(format!(
                "column '{}' decoded {} rows but its transport declared {}",
                transports[idx].name,
                batch.num_rows(),
                transports[idx].rows
            ));
        }
        fields.push(batch.schema().field(0).clone());
        columns.push(Arc::clone(batch.column(0)));
    }

    let schema = Arc::new(Schema::new(fields));
    RecordBatch::try_new(schema, columns)
        .map(Table::from_batch)
        .map_err(|e| format!("failed to assemble table from columns: {e}"))
}

pub fn build_message_tag(sequence_id: u32, worker_number: u16, frame_number: u16) -> u64 {
    (sequence_id as u64) | ((worker_number as u64) << 32) | ((frame_number as u64) << 48)
}

pub fn tag_sequence_id(tag: u64) -> u32 {
    (tag & 0xFFFF_FFFF) as u32
}

pub fn tag_worker_number(tag: u64) -> u16 {
    ((tag >> 32) & 0xFFFF) as u16
}

pub fn tag_frame_number(tag: u64) -> u16 {
    (tag >> 48) as u16
}

/// Tag shared by every frame of one message: the frame bits cleared.
pub fn base_message_tag(tag: u64) -> u64 {
    tag & MESSAGE_TAG_MASK
}

pub fn is_begin_tag(tag: u64) -> bool {
    tag & BEGIN_TAG_MASK == (BEGIN_FRAME_NUMBER as u64) << 48
}

pub fn is_acknowledge_tag(tag: u64) -> bool {
    tag_frame_number(tag) == ACKNOWLEDGE_FRAME_NUMBER
}

pub fn acknowledge_tag(tag: u64) -> u64 {
    base_message_tag(tag) | ((ACKNOWLEDGE_FRAME_NUMBER as u64) << 48)
}

/// Tag for the `frame_number`-th data frame of a message. Frame numbers
/// outside 1..=0xFFFE collide with the begin/acknowledge frames and are
/// refused.
pub fn data_frame_tag(tag: u64, frame_number: u16) -> Result<u64, String> {
    if frame_number == BEGIN_FRAME_NUMBER || frame_number == ACKNOWLEDGE_FRAME_NUMBER {
        return Err(format!(
            "data frame number {} out of range 1..={}",
            frame_number, MAX_DATA_FRAME_NUMBER
        ));
    }
    Ok(base_message_tag(tag) | ((frame_number as u64) << 48))
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::{Int64Array, StringArray};
    use arrow::datatypes::{DataType, Field};
    use prost::Message;

    fn two_column_table(rows: i64) -> Table {
        let schema = Arc::new(Schema::new(vec![
            Field::new("id", DataType::Int64, false),
            Field::new("name", DataType::Utf8, true),
        ]));
        let ids = Int64Array::from_iter_values(0..rows);
        let names = StringArray::from_iter((0..rows).map(|i| {
            if i % 3 == 0 {
                None
            } else {
                Some(format!("row_{i}"))
            }
        }));
        let batch = RecordBatch::try_new(schema, vec![Arc::new(ids), Arc::new(names)])
            .expect("build record batch");
        Table::from_batch(batch)
    }

    #[test]
    fn test_tag_field_round_trip() {
        let tag = build_message_tag(0xDEAD_BEEF, 513, 7);
        assert_eq!(tag_sequence_id(tag), 0xDEAD_BEEF);
        assert_eq!(tag_worker_number(tag), 513);
        assert_eq!(tag_frame_number(tag), 7);
        assert_eq!(base_message_tag(tag), build_message_tag(0xDEAD_BEEF, 513, 0));
    }

    #[test]
    fn test_tag_classes_are_disjoint() {
        let begin = build_message_tag(42, 3, BEGIN_FRAME_NUMBER);
        assert!(is_begin_tag(begin));
        assert!(!is_acknowledge_tag(begin));

        let ack = acknowledge_tag(begin);
        assert!(is_acknowledge_tag(ack));
        assert!(!is_begin_tag(ack));
        assert_eq!(ack & ACKNOWLEDGE_TAG_MASK, ack);
        assert_eq!(base_message_tag(ack), base_message_tag(begin));

        let data = data_frame_tag(begin, 1).unwrap();
        assert!(!is_begin_tag(data));
        assert!(!is_acknowledge_tag(data));
        assert_eq!(base_message_tag(data), base_message_tag(begin));
    }

    #[test]
    fn test_data_frame_numbers_stay_in_two_bytes() {
        let base = build_message_tag(1, 1, 0);
        assert!(data_frame_tag(base, 1).is_ok());
        assert!(data_frame_tag(base, MAX_DATA_FRAME_NUMBER).is_ok());
        assert!(data_frame_tag(base, BEGIN_FRAME_NUMBER).is_err());
        assert!(data_frame_tag(base, ACKNOWLEDGE_FRAME_NUMBER).is_err());
    }

    #[test]
    fn test_encode_decode_columns_round_trip() {
        let table = two_column_table(17);
        let (transports, buffers) = encode_columns(&table).unwrap();
        assert_eq!(transports.len(), 2);
        assert_eq!(buffers.len(), 2);
        assert_eq!(transports[0].name, "id");
        assert_eq!(transports[0].rows, 17);
        assert!(transports[1].null_count > 0);
        assert_eq!(transports[0].size as usize, buffers[0].len());

        let decoded = decode_columns(&transports, buffers).unwrap();
        assert_eq!(decoded, table);
    }

    #[test]
    fn test_empty_table_has_no_buffers() {
        let (transports, buffers) = encode_columns(&Table::empty()).unwrap();
        assert!(transports.is_empty());
        assert!(buffers.is_empty());
        let decoded = decode_columns(&transports, buffers).unwrap();
        assert_eq!(decoded.num_rows(), 0);
        assert_eq!(decoded.num_columns(), 0);
    }

    #[test]
    fn test_decode_rejects_mismatched_buffer_count() {
        let table = two_column_table(4);
        let (transports, mut buffers) = encode_columns(&table).unwrap();
        buffers.pop();
        assert!(decode_columns(&transports, buffers).is_err());
    }

    #[test]
    fn test_begin_frame_proto_round_trip() {
        let table = two_column_table(9);
        let (transports, buffers) = encode_columns(&table).unwrap();
        let sizes: Vec<u64> = buffers.iter().map(|b| b.len() as u64).collect();
        let mut meta = MetadataDictionary::new();
        meta.add_value("query_id", "77");
        meta.add_value("message_id", "77_1_worker_0");

        let frame = BeginFrame::new(transports, sizes.clone(), &meta);
        assert_eq!(frame.message_size, sizes.iter().sum::<u64>());

        let bytes = frame.encode_to_vec();
        let decoded = BeginFrame::decode(bytes.as_slice()).expect("decode begin frame");
        assert_eq!(decoded, frame);
        assert_eq!(decoded.metadata_dictionary().get("query_id"), Some("77"));
    }
}
