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
//! In-memory message caches.
//!
//! Responsibilities:
//! - Buffers `CacheData` between producers (kernels, the inbound message
//!   server) and consumers (kernels, the outbound message sender pump).
//! - Blocking pulls keyed by message id, with a bounded wait, and plain FIFO
//!   pops for the sender pump.
//!
//! Current limitations:
//! - Purely in-memory; eviction and spill-to-disk live behind the same
//!   interface in the storage layer and are not part of the control plane.
use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::cache::metadata::MetadataDictionary;
use crate::common::config::exchange_wait_ms;
use crate::exec::table::Table;

/// One table plus the metadata that routes it.
#[derive(Clone, Debug)]
pub struct CacheData {
    pub table: Table,
    pub metadata: MetadataDictionary,
}

impl CacheData {
    pub fn new(table: Table, metadata: MetadataDictionary) -> Self {
        Self { table, metadata }
    }

    pub fn from_table(table: Table) -> Self {
        Self {
            table,
            metadata: MetadataDictionary::new(),
        }
    }

    pub fn num_rows(&self) -> usize {
        self.table.num_rows()
    }
}

/// Insert discipline of a cache.
///
/// `Stream` keeps every insert. `OneShot` keeps at most one entry per
/// message id and coalesces repeats away; `always_add = true` on the insert
/// call overrides the coalescing for that one entry.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum CachePolicy {
    Stream,
    OneShot,
}

struct CacheEntry {
    message_id: String,
    data: CacheData,
}

struct CacheInner {
    queue: VecDeque<CacheEntry>,
    finished: bool,
}

/// FIFO message buffer with blocking consumers.
///
/// Producers never block. Consumers block until a matching entry arrives,
/// the cache is finished, or the wait deadline passes.
pub struct CacheMachine {
    inner: Mutex<CacheInner>,
    cv: Condvar,
    policy: CachePolicy,
}

impl CacheMachine {
    pub fn new(policy: CachePolicy) -> Self {
        Self {
            inner: Mutex::new(CacheInner {
                queue: VecDeque::new(),
                finished: false,
            }),
            cv: Condvar::new(),
            policy,
        }
    }

    /// Inserts one entry under `message_id`. Returns whether the entry was
    /// kept: inserts into a finished cache are refused, and a `OneShot`
    /// cache coalesces a repeated id away unless `always_add` is set.
    pub fn add_cache_data(&self, data: CacheData, message_id: &str, always_add: bool) -> bool {
        let mut inner = self.inner.lock().expect("cache machine lock");
        if inner.finished {
            return false;
        }
        if self.policy == CachePolicy::OneShot
            && !always_add
            && inner.queue.iter().any(|e| e.message_id == message_id)
        {
            return false;
        }
        inner.queue.push_back(CacheEntry {
            message_id: message_id.to_string(),
            data,
        });
        self.cv.notify_all();
        true
    }

    pub fn add_to_cache(&self, table: Table, message_id: &str, always_add: bool) -> bool {
        self.add_cache_data(CacheData::from_table(table), message_id, always_add)
    }

    /// Removes and returns the oldest entry stored under `message_id`,
    /// waiting up to the configured exchange wait if none is present yet.
    pub fn pull_cache_data(&self, message_id: &str) -> Result<CacheData, String> {
        self.pull_cache_data_with_timeout(message_id, Duration::from_millis(exchange_wait_ms()))
    }

    pub fn pull_cache_data_with_timeout(
        &self,
        message_id: &str,
        wait: Duration,
    ) -> Result<CacheData, String> {
        let deadline = Instant::now() + wait;
        let mut inner = self.inner.lock().expect("cache machine lock");
        loop {
            if let Some(pos) = inner.queue.iter().position(|e| e.message_id == message_id) {
                if let Some(entry) = inner.queue.remove(pos) {
                    return Ok(entry.data);
                }
            }
            if inner.finished {
                return Err(format!(
                    "cache finished while waiting for message {}",
                    message_id
                ));
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(format!(
                    "timed out after {}ms waiting for message {}",
                    wait.as_millis(),
                    message_id
                ));
            }
            let (guard, _timeout) = self
                .cv
                .wait_timeout(inner, deadline - now)
                .expect("cache machine lock");
            inner = guard;
        }
    }

    /// FIFO pop for the sender pump. Blocks while the cache is empty and
    /// unfinished; returns `None` once finished and drained.
    pub fn pop_or_wait(&self) -> Option<CacheData> {
        let mut inner = self.inner.lock().expect("cache machine lock");
        loop {
            if let Some(entry) = inner.queue.pop_front() {
                return Some(entry.data);
            }
            if inner.finished {
                return None;
            }
            inner = self.cv.wait(inner).expect("cache machine lock");
        }
    }

    /// Marks the cache closed and wakes every waiter. Entries already queued
    /// stay pullable.
    pub fn finish(&self) {
        let mut inner = self.inner.lock().expect("cache machine lock");
        inner.finished = true;
        self.cv.notify_all();
    }

    pub fn is_finished(&self) -> bool {
        self.inner.lock().expect("cache machine lock").finished
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("cache machine lock").queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
