//! Wire contract between observable and observer.
//!
//! Four read-only operations, JSON request and response bodies. Unknown ids
//! in a `/query` batch come back as empty arrays rather than being omitted,
//! so a response always answers every requested key.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::merkle::{self, MerkleId, MerkleNode, Payload, PayloadId};

/// `GET /root`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RootResponse {
    pub id: MerkleId,
    pub version: i64,
}

/// `GET /sources` request: the root the caller believes is current.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourcesRequest {
    pub id: MerkleId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceEntry {
    pub name: String,
    /// The source's Merkle id.
    pub id: MerkleId,
    pub payload_id: PayloadId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourcesResponse {
    pub size: usize,
    pub sources: Vec<SourceEntry>,
}

/// `GET /query` request: a batch of Merkle ids to expand.
pub type QueryRequest = Vec<MerkleId>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryItem {
    pub merkle_id: MerkleId,
    pub payload_id: PayloadId,
}

/// One entry per requested Merkle id; leaves and unknown ids map to `[]`.
pub type QueryResponse = HashMap<MerkleId, Vec<QueryItem>>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayloadRequest {
    pub payload_id: PayloadId,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayloadResponse {
    pub payload: Payload,
}

/// Error body for every non-2xx response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorMessage {
    pub message: String,
}

impl From<&merkle::Source> for SourceEntry {
    fn from(source: &merkle::Source) -> Self {
        SourceEntry {
            name: source.name.clone(),
            id: source.merkle_id.clone(),
            payload_id: source.payload_id.clone(),
        }
    }
}

impl From<SourceEntry> for merkle::Source {
    fn from(entry: SourceEntry) -> Self {
        merkle::Source {
            name: entry.name,
            merkle_id: entry.id,
            payload_id: entry.payload_id,
        }
    }
}

impl From<&MerkleNode> for QueryItem {
    fn from(node: &MerkleNode) -> Self {
        QueryItem {
            merkle_id: node.merkle_id.clone(),
            payload_id: node.payload_id.clone(),
        }
    }
}

impl From<&QueryItem> for MerkleNode {
    fn from(item: &QueryItem) -> Self {
        MerkleNode {
            merkle_id: item.merkle_id.clone(),
            payload_id: item.payload_id.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_response_wire_shape() {
        let root: RootResponse = serde_json::from_str(r#"{"id": "hello world", "version": 1}"#).unwrap();
        assert_eq!(root.id, "hello world");
        assert_eq!(root.version, 1);

        let encoded = serde_json::to_string(&RootResponse {
            id: "1234".into(),
            version: 1,
        })
        .unwrap();
        assert_eq!(encoded, r#"{"id":"1234","version":1}"#);
    }

    #[test]
    fn sources_response_wire_shape() {
        let encoded = serde_json::to_string(&SourcesResponse {
            size: 1,
            sources: vec![SourceEntry {
                name: "Source-a".into(),
                id: "m1".into(),
                payload_id: "p1".into(),
            }],
        })
        .unwrap();
        assert_eq!(
            encoded,
            r#"{"size":1,"sources":[{"name":"Source-a","id":"m1","payload_id":"p1"}]}"#
        );
    }

    #[test]
    fn query_response_wire_shape() {
        let decoded: QueryResponse =
            serde_json::from_str(r#"{"m1":[{"merkle_id":"m2","payload_id":"p2"}],"m3":[]}"#)
                .unwrap();
        assert_eq!(decoded.len(), 2);
        assert_eq!(decoded["m1"][0].payload_id, "p2");
        assert!(decoded["m3"].is_empty());
    }

    #[test]
    fn error_message_wire_shape() {
        let encoded = serde_json::to_string(&ErrorMessage {
            message: "Root not found".into(),
        })
        .unwrap();
        assert_eq!(encoded, r#"{"message":"Root not found"}"#);
    }
}
