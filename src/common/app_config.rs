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
use anyhow::{Context, Result, anyhow};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

static CONFIG: OnceLock<EmberConfig> = OnceLock::new();

fn default_log_level() -> String {
    "info".to_string()
}

pub fn init_from_path(path: impl AsRef<Path>) -> Result<&'static EmberConfig> {
    if let Some(cfg) = CONFIG.get() {
        return Ok(cfg);
    }
    let path = path.as_ref().to_path_buf();
    let cfg = EmberConfig::load_from_file(&path)?;
    let _ = CONFIG.set(cfg);
    Ok(CONFIG.get().expect("CONFIG set"))
}

pub fn init_from_env_or_default() -> Result<&'static EmberConfig> {
    if let Some(cfg) = CONFIG.get() {
        return Ok(cfg);
    }
    let path = config_path_from_env_or_default()?;
    let cfg = EmberConfig::load_from_file(&path)?;
    let _ = CONFIG.set(cfg);
    Ok(CONFIG.get().expect("CONFIG set"))
}

pub fn config() -> Result<&'static EmberConfig> {
    init_from_env_or_default()
}

fn config_path_from_env_or_default() -> Result<PathBuf> {
    if let Ok(p) = std::env::var("EMBERSQL_CONFIG") {
        if !p.trim().is_empty() {
            return Ok(PathBuf::from(p));
        }
    }

    let candidates = [PathBuf::from("embersql.toml")];
    for p in candidates {
        if p.exists() {
            return Ok(p);
        }
    }

    Err(anyhow!(
        "missing config file: set $EMBERSQL_CONFIG or create ./embersql.toml"
    ))
}

#[derive(Clone, Deserialize)]
pub struct EmberConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Optional full tracing EnvFilter expression.
    /// If set, this takes precedence over `log_level`.
    /// Example: "embersql=debug"
    #[serde(default)]
    pub log_filter: Option<String>,

    #[serde(default)]
    pub node: NodeConfig,

    #[serde(default)]
    pub cluster: ClusterConfig,

    #[serde(default)]
    pub comm: CommConfig,

    #[serde(default)]
    pub exec: ExecConfig,
}

impl EmberConfig {
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let s = std::fs::read_to_string(path)
            .with_context(|| format!("read config file: {}", path.display()))?;
        let cfg: EmberConfig =
            toml::from_str(&s).with_context(|| format!("parse toml: {}", path.display()))?;
        Ok(cfg)
    }
}

impl Default for EmberConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_filter: None,
            node: NodeConfig::default(),
            cluster: ClusterConfig::default(),
            comm: CommConfig::default(),
            exec: ExecConfig::default(),
        }
    }
}

/// Identity and bind address of this worker process.
#[derive(Clone, Deserialize)]
pub struct NodeConfig {
    #[serde(default = "default_node_id")]
    pub id: String,
    #[serde(default = "default_node_host")]
    pub host: String,
    #[serde(default = "default_comm_port")]
    pub comm_port: u16,
}

fn default_node_id() -> String {
    "worker_0".to_string()
}
fn default_node_host() -> String {
    "0.0.0.0".to_string()
}
fn default_comm_port() -> u16 {
    9670
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            id: default_node_id(),
            host: default_node_host(),
            comm_port: default_comm_port(),
        }
    }
}

/// Cluster membership, in the node order every worker agrees on.
/// Each entry is `id=host:port`; the entry matching `[node].id` is this
/// worker itself.
#[derive(Clone, Default, Deserialize)]
pub struct ClusterConfig {
    #[serde(default)]
    pub workers: Vec<String>,
}

#[derive(Clone, Deserialize)]
pub struct CommConfig {
    /// Wire protocol variant: "stream" (plain socket framing) or "tagged"
    /// (tag-matched frames with the begin/acknowledge handshake).
    #[serde(default = "default_transport")]
    pub transport: String,
    #[serde(default = "default_comm_threads")]
    pub comm_threads: usize,
    #[serde(default = "default_server_threads")]
    pub server_threads: usize,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_exchange_wait_ms")]
    pub exchange_wait_ms: u64,
}

fn default_transport() -> String {
    "stream".to_string()
}

fn default_comm_threads() -> usize {
    4
}

fn default_server_threads() -> usize {
    4
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}

fn default_exchange_wait_ms() -> u64 {
    120_000
}

impl Default for CommConfig {
    fn default() -> Self {
        Self {
            transport: default_transport(),
            comm_threads: default_comm_threads(),
            server_threads: default_server_threads(),
            connect_timeout_ms: default_connect_timeout_ms(),
            exchange_wait_ms: default_exchange_wait_ms(),
        }
    }
}

#[derive(Clone, Deserialize)]
pub struct ExecConfig {
    #[serde(default = "default_exec_threads")]
    pub exec_threads: usize,
    #[serde(default = "default_task_attempts_limit")]
    pub task_attempts_limit: u32,
}

fn default_exec_threads() -> usize {
    0 // 0 means use CPU cores
}

fn default_task_attempts_limit() -> u32 {
    10
}

impl Default for ExecConfig {
    fn default() -> Self {
        Self {
            exec_threads: default_exec_threads(),
            task_attempts_limit: default_task_attempts_limit(),
        }
    }
}

impl ExecConfig {
    /// Get the actual number of executor threads.
    /// Returns CPU cores if configured as 0.
    pub fn actual_exec_threads(&self) -> usize {
        if self.exec_threads > 0 {
            self.exec_threads
        } else {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::EmberConfig;

    #[test]
    fn test_comm_defaults() {
        let cfg: EmberConfig = toml::from_str(
            r#"
[node]
id = "worker_3"
"#,
        )
        .expect("parse config");
        assert_eq!(cfg.node.id, "worker_3");
        assert_eq!(cfg.node.comm_port, 9670);
        assert_eq!(cfg.comm.transport, "stream");
        assert_eq!(cfg.comm.exchange_wait_ms, 120_000);
        assert_eq!(cfg.exec.task_attempts_limit, 10);
    }

    #[test]
    fn test_comm_can_be_overridden() {
        let cfg: EmberConfig = toml::from_str(
            r#"
[comm]
transport = "tagged"
comm_threads = 2

[exec]
exec_threads = 3
task_attempts_limit = 1
"#,
        )
        .expect("parse config");
        assert_eq!(cfg.comm.transport, "tagged");
        assert_eq!(cfg.comm.comm_threads, 2);
        assert_eq!(cfg.exec.actual_exec_threads(), 3);
        assert_eq!(cfg.exec.task_attempts_limit, 1);
    }

    #[test]
    fn test_cluster_workers_list() {
        let cfg: EmberConfig = toml::from_str(
            r#"
[cluster]
workers = ["worker_0=127.0.0.1:9670", "worker_1=127.0.0.1:9671"]
"#,
        )
        .expect("parse config");
        assert_eq!(cfg.cluster.workers.len(), 2);
        assert_eq!(cfg.cluster.workers[0], "worker_0=127.0.0.1:9670");
    }
}
