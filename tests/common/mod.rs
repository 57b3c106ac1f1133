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
//! Shared fixtures for the integration tests.
#![allow(dead_code)]
#![allow(unused_imports)]

use std::net::TcpListener;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::mpsc;
use std::thread;
use std::time::{Duration, Instant};

use arrow::array::{Array, Int32Array};
use arrow::datatypes::{DataType, Field, Schema};
use arrow::record_batch::RecordBatch;
use tempfile::TempDir;

use embersql::ember_config;
use embersql::ember_logging;
use embersql::exec::table::Table;

// Single-node worker config with an ephemeral comm port, tight comm
// timeouts and a small executor. Tests that need a cluster build their
// EmberConfig values in code instead; the process-global config can only
// be initialized once.
const TEST_CONFIG_TOML: &str = r#"
log_level = "debug"

[node]
id = "worker_0"
host = "127.0.0.1"
comm_port = 0

[comm]
transport = "stream"
comm_threads = 2
server_threads = 2
connect_timeout_ms = 2000
exchange_wait_ms = 5000

[exec]
exec_threads = 2
task_attempts_limit = 10
"#;

/// On-disk worker config for tests that go through the config file path.
pub struct TestConfig {
    pub temp_dir: TempDir,
    pub config_path: PathBuf,
}

impl TestConfig {
    pub fn new() -> anyhow::Result<Self> {
        let temp_dir = tempfile::tempdir()?;
        let config_path = temp_dir.path().join("test_embersql.toml");
        std::fs::write(&config_path, TEST_CONFIG_TOML)?;
        Ok(Self {
            temp_dir,
            config_path,
        })
    }

    pub fn init_logging(&self) {
        ember_logging::init_with_level("debug");
    }

    pub fn load_config(&self) -> anyhow::Result<&'static ember_config::EmberConfig> {
        ember_config::init_from_path(&self.config_path)
    }
}

/// Single int32 column table with the given values.
pub fn rows_table(values: &[i32]) -> Table {
    let schema = Arc::new(Schema::new(vec![Field::new("v", DataType::Int32, false)]));
    let batch = RecordBatch::try_new(schema, vec![Arc::new(Int32Array::from(values.to_vec()))])
        .expect("record batch");
    Table::from_batch(batch)
}

/// The int32 values of a `rows_table` round trip.
pub fn table_values(table: &Table) -> Vec<i32> {
    let column = table
        .batch()
        .column(0)
        .as_any()
        .downcast_ref::<Int32Array>()
        .expect("int32 column");
    column.values().to_vec()
}

/// Reserves `n` distinct loopback ports by binding and dropping listeners.
/// The tiny window between drop and re-bind is acceptable for tests.
pub fn free_ports(n: usize) -> Vec<u16> {
    let listeners: Vec<TcpListener> = (0..n)
        .map(|_| TcpListener::bind("127.0.0.1:0").expect("bind port 0"))
        .collect();
    listeners
        .iter()
        .map(|l| l.local_addr().expect("local addr").port())
        .collect()
}

/// Polls `condition` every 10ms until it holds or `timeout` passes.
pub fn wait_for<F>(mut condition: F, timeout: Duration) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(10));
    }
    false
}

/// Runs `f` on a helper thread and panics if it does not finish in time.
/// The helper thread is not joined on timeout.
pub fn run_with_timeout<F, T>(timeout: Duration, f: F) -> T
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let _ = tx.send(f());
    });
    rx.recv_timeout(timeout)
        .unwrap_or_else(|_| panic!("timed out after {:?}", timeout))
}
