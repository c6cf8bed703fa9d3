use serde::{Deserialize, Serialize};

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct DHTMessage {
    #[serde(rename = "type")]
    pub message_type: i32,

    #[serde(default)]
    #[serde(with = "serde_bytes")]
    pub key: Vec<u8>,

    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(with = "serde_bytes")]
    pub value: Option<Vec<u8>>,

    #[serde(default)]
    #[serde(rename = "closerPeers")]
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub closer_peers: Vec<DHTPeer>,

    /// Cluster level + 1, so that 0 means unset.
    #[serde(default)]
    #[serde(rename = "clusterLevelRaw")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cluster_level_raw: Option<i32>,
}

impl DHTMessage {
    pub fn from_bytes(bytes: &[u8]) -> Result<DHTMessage, serde_bencode::Error> {
        let obj = serde_bencode::from_bytes(bytes)?;
        Ok(obj)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_bencode::Error> {
        serde_bencode::to_bytes(self)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct DHTPeer {
    #[serde(default)]
    #[serde(with = "serde_bytes")]
    pub id: Vec<u8>,

    #[serde(default)]
    pub addrs: Vec<String>,

    #[serde(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connection: Option<i32>,
}
