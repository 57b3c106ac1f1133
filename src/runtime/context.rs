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
use crate::common::types::{ContextToken, Node};

/// Per-query view of the cluster: the agreed node order, which entry is the
/// local worker, and the query's context token. Shared read-only by every
/// kernel of the query.
#[derive(Clone, Debug)]
pub struct Context {
    token: ContextToken,
    nodes: Vec<Node>,
    self_index: usize,
}

impl Context {
    pub fn new(token: ContextToken, nodes: Vec<Node>, self_index: usize) -> Result<Self, String> {
        if nodes.is_empty() {
            return Err(format!("context {} has no nodes", token));
        }
        if self_index >= nodes.len() {
            return Err(format!(
                "context {}: self index {} out of range for {} nodes",
                token,
                self_index,
                nodes.len()
            ));
        }
        Ok(Self {
            token,
            nodes,
            self_index,
        })
    }

    pub fn token(&self) -> ContextToken {
        self.token
    }

    pub fn all_nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn total_nodes(&self) -> usize {
        self.nodes.len()
    }

    pub fn self_node(&self) -> &Node {
        &self.nodes[self.self_index]
    }

    pub fn all_other_nodes(&self) -> Vec<Node> {
        self.nodes
            .iter()
            .enumerate()
            .filter(|(idx, _)| *idx != self.self_index)
            .map(|(_, node)| node.clone())
            .collect()
    }

    pub fn node_index(&self, node: &Node) -> Option<usize> {
        self.nodes.iter().position(|n| n == node)
    }
}

/// Parses one `id=host:port` cluster membership entry.
pub fn parse_worker_entry(entry: &str) -> Result<Node, String> {
    let (id, address) = entry
        .split_once('=')
        .ok_or_else(|| format!("worker entry '{}' is not 'id=host:port'", entry))?;
    let (host, port) = address
        .rsplit_once(':')
        .ok_or_else(|| format!("worker entry '{}' is missing ':port'", entry))?;
    let port: u16 = port
        .parse()
        .map_err(|e| format!("worker entry '{}': bad port: {}", entry, e))?;
    if id.trim().is_empty() || host.trim().is_empty() {
        return Err(format!("worker entry '{}' has an empty id or host", entry));
    }
    Ok(Node::new(id.trim(), host.trim(), port))
}

/// Parses the configured membership list, preserving cluster order.
pub fn parse_workers(entries: &[String]) -> Result<Vec<Node>, String> {
    entries.iter().map(|e| parse_worker_entry(e)).collect()
}
