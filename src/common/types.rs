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
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;

/// Identifies one query's execution graph across every node of the cluster.
/// The coordinator assigns it; workers carry it in message metadata and use
/// it to route inbound messages to the right graph.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct ContextToken(pub u32);

impl fmt::Display for ContextToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for ContextToken {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim()
            .parse::<u32>()
            .map(ContextToken)
            .map_err(|e| format!("invalid context token '{}': {}", s, e))
    }
}

/// Identifies one kernel inside a graph. Unique per graph, not globally.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub struct KernelId(pub u64);

impl fmt::Display for KernelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One worker process of the cluster.
///
/// Equality and hashing consider only `id`: two descriptors for the same
/// worker compare equal even when one of them was built without address
/// information (e.g. from a `sender_worker_id` metadata value).
#[derive(Clone, Debug)]
pub struct Node {
    pub id: String,
    pub host: String,
    pub port: u16,
}

impl Node {
    pub fn new(id: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            id: id.into(),
            host: host.into(),
            port,
        }
    }

    /// Descriptor carrying identity only, for when a message names a worker
    /// whose address the local topology does not know.
    pub fn from_id(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            host: String::new(),
            port: 0,
        }
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl PartialEq for Node {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for Node {}

impl Hash for Node {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_context_token_roundtrip() {
        let token = ContextToken(31337);
        assert_eq!(token.to_string(), "31337");
        assert_eq!("31337".parse::<ContextToken>().unwrap(), token);
        assert!("not-a-token".parse::<ContextToken>().is_err());
    }

    #[test]
    fn test_node_identity_ignores_address() {
        let a = Node::new("worker_1", "10.0.0.1", 9631);
        let b = Node::from_id("worker_1");
        assert_eq!(a, b);

        use std::collections::HashSet;
        let mut set = HashSet::new();
        set.insert(a);
        assert!(set.contains(&b));
    }
}
