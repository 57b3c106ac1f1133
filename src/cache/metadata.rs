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
//! Message metadata: the string key/value dictionary attached to every
//! cached and wire-transferred table, and the labels the control plane
//! agrees on.
//!
//! Key exported interfaces:
//! - `MetadataDictionary` and the `*_LABEL` constants.
//! - `message_id()`: the deterministic routing id for point-to-point sends.
use std::collections::BTreeMap;

use crate::common::types::{ContextToken, KernelId};

pub const QUERY_ID_LABEL: &str = "query_id";
pub const KERNEL_ID_LABEL: &str = "kernel_id";
pub const CACHE_ID_LABEL: &str = "cache_id";
pub const ADD_TO_SPECIFIC_CACHE_LABEL: &str = "add_to_specific_cache";
pub const SENDER_WORKER_ID_LABEL: &str = "sender_worker_id";
pub const WORKER_IDS_LABEL: &str = "worker_ids";
pub const TOTAL_TABLE_ROWS_LABEL: &str = "total_table_rows";
pub const MESSAGE_ID_LABEL: &str = "message_id";
pub const PARTITION_COUNT_LABEL: &str = "partition_count";

/// Ordered string dictionary carried with every message. Ordering is part of
/// the contract so serialized metadata is byte-stable for identical content.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MetadataDictionary {
    values: BTreeMap<String, String>,
}

impl MetadataDictionary {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_value(&mut self, label: impl Into<String>, value: impl Into<String>) {
        self.values.insert(label.into(), value.into());
    }

    pub fn get(&self, label: &str) -> Option<&str> {
        self.values.get(label).map(|v| v.as_str())
    }

    /// Like `get`, but a missing label is an error naming the label. Used on
    /// paths where the protocol guarantees the label is present.
    pub fn require(&self, label: &str) -> Result<&str, String> {
        self.get(label)
            .ok_or_else(|| format!("metadata missing required label '{}'", label))
    }

    pub fn merge_from(&mut self, other: &MetadataDictionary) {
        for (label, value) in other.iter() {
            self.values.insert(label.to_string(), value.to_string());
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.values.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}

/// Builds the routing id for one point-to-point message.
///
/// The last segment is the worker the id is scoped to: senders pass their own
/// id, while a kernel waiting for a message passes the id of the worker it
/// expects the message from. Identical inputs always produce the identical
/// id, which is what lets two nodes agree on the id without coordination.
pub fn message_id(
    prefix: &str,
    query_id: ContextToken,
    kernel_id: KernelId,
    worker_id: &str,
) -> String {
    format!("{}{}_{}_{}", prefix, query_id, kernel_id, worker_id)
}
