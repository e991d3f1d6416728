use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;

/// `prevHash` carried by the block at index 0.
pub const GENESIS_PREV_HASH: &str = "0";

/// Category of a ledger event. Serialized as its textual form, which is also
/// the form fed into the block hash.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum ActionType {
    Genesis,
    WasteSubmission,
    RewardRedemption,
    Adjustment,
    Custom(String),
}

impl ActionType {
    pub fn as_str(&self) -> &str {
        match self {
            ActionType::Genesis => "GENESIS",
            ActionType::WasteSubmission => "WASTE_SUBMISSION",
            ActionType::RewardRedemption => "REWARD_REDEMPTION",
            ActionType::Adjustment => "ADJUSTMENT",
            ActionType::Custom(name) => name,
        }
    }
}

impl From<String> for ActionType {
    fn from(value: String) -> Self {
        match value.as_str() {
            "GENESIS" => ActionType::Genesis,
            "WASTE_SUBMISSION" => ActionType::WasteSubmission,
            "REWARD_REDEMPTION" => ActionType::RewardRedemption,
            "ADJUSTMENT" => ActionType::Adjustment,
            _ => ActionType::Custom(value),
        }
    }
}

impl From<&str> for ActionType {
    fn from(value: &str) -> Self {
        ActionType::from(value.to_string())
    }
}

impl From<ActionType> for String {
    fn from(value: ActionType) -> Self {
        value.as_str().to_string()
    }
}

impl fmt::Display for ActionType {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A scalar metadata value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetaValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl From<&str> for MetaValue {
    fn from(value: &str) -> Self {
        MetaValue::Text(value.to_string())
    }
}

impl From<String> for MetaValue {
    fn from(value: String) -> Self {
        MetaValue::Text(value)
    }
}

impl From<i64> for MetaValue {
    fn from(value: i64) -> Self {
        MetaValue::Int(value)
    }
}

impl From<f64> for MetaValue {
    fn from(value: f64) -> Self {
        MetaValue::Float(value)
    }
}

impl From<bool> for MetaValue {
    fn from(value: bool) -> Self {
        MetaValue::Bool(value)
    }
}

impl From<&MetaValue> for serde_json::Value {
    fn from(value: &MetaValue) -> Self {
        match value {
            MetaValue::Null => serde_json::Value::Null,
            MetaValue::Bool(b) => serde_json::Value::Bool(*b),
            MetaValue::Int(i) => serde_json::Value::from(*i),
            MetaValue::Float(f) => serde_json::Value::from(*f),
            MetaValue::Text(s) => serde_json::Value::String(s.clone()),
        }
    }
}

/// Free-form per-event metadata. Keys are kept sorted, so insertion order never
/// leaks into the canonical form.
pub type Metadata = BTreeMap<String, MetaValue>;

/// Canonical string form of `metadata`: compact JSON with keys in ascending
/// order. Every hash computation goes through this function.
pub fn canonical_metadata(metadata: &Metadata) -> String {
    let map: serde_json::Map<String, serde_json::Value> = metadata
        .iter()
        .map(|(key, value)| (key.clone(), serde_json::Value::from(value)))
        .collect();
    serde_json::Value::Object(map).to_string()
}

/// SHA-256 over `index ‖ prevHash ‖ timestamp ‖ userId ‖ actionType ‖ points ‖
/// canonical(metadata)`, as lowercase hex.
pub fn compute_block_hash(
    index: u64,
    prev_hash: &str,
    timestamp: &str,
    user_id: &str,
    action_type: &ActionType,
    points: i64,
    metadata: &Metadata,
) -> String {
    let mut hasher = Sha256::new();
    hasher.update(index.to_string().as_bytes());
    hasher.update(prev_hash.as_bytes());
    hasher.update(timestamp.as_bytes());
    hasher.update(user_id.as_bytes());
    hasher.update(action_type.as_str().as_bytes());
    hasher.update(points.to_string().as_bytes());
    hasher.update(canonical_metadata(metadata).as_bytes());
    hex::encode(hasher.finalize())
}

pub fn current_timestamp() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Block {
    pub index: u64,
    pub prev_hash: String,
    /// Stored verbatim; the exact string is part of the hash input.
    pub timestamp: String,
    pub user_id: String,
    pub action_type: ActionType,
    /// Signed delta: positive credits, negative debits.
    pub points: i64,
    #[serde(default)]
    pub metadata: Metadata,
    pub hash: String,
}

impl Block {
    /// Builds a sealed block stamped with the current time.
    pub fn new(
        index: u64,
        prev_hash: String,
        user_id: &str,
        action_type: ActionType,
        points: i64,
        metadata: Metadata,
    ) -> Self {
        Self::with_timestamp(
            index,
            prev_hash,
            current_timestamp(),
            user_id,
            action_type,
            points,
            metadata,
        )
    }

    pub fn with_timestamp(
        index: u64,
        prev_hash: String,
        timestamp: String,
        user_id: &str,
        action_type: ActionType,
        points: i64,
        metadata: Metadata,
    ) -> Self {
        let mut block = Block {
            index,
            prev_hash,
            timestamp,
            user_id: user_id.to_string(),
            action_type,
            points,
            metadata,
            hash: String::new(),
        };
        block.hash = block.calculate_hash();
        block
    }

    pub fn calculate_hash(&self) -> String {
        compute_block_hash(
            self.index,
            &self.prev_hash,
            &self.timestamp,
            &self.user_id,
            &self.action_type,
            self.points,
            &self.metadata,
        )
    }

    pub fn is_genesis(&self) -> bool {
        self.index == 0
    }

    pub fn summary(&self) -> BlockSummary {
        BlockSummary {
            index: self.index,
            hash: self.hash.clone(),
            timestamp: self.timestamp.clone(),
            user_id: self.user_id.clone(),
            action_type: self.action_type.clone(),
            points: self.points,
        }
    }
}

/// The metadata-free projection of a block that Merkle leaves are built from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockSummary {
    pub index: u64,
    pub hash: String,
    pub timestamp: String,
    pub user_id: String,
    pub action_type: ActionType,
    pub points: i64,
}

/// The singleton record naming the current last block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tip {
    pub latest_hash: String,
    pub current_index: u64,
}

impl Tip {
    pub fn of(block: &Block) -> Self {
        Tip {
            latest_hash: block.hash.clone(),
            current_index: block.index,
        }
    }

    /// Index and `prevHash` the next block must carry given the current tip.
    pub fn next_link(tip: Option<&Tip>) -> (u64, String) {
        match tip {
            Some(t) => (t.current_index + 1, t.latest_hash.clone()),
            None => (0, GENESIS_PREV_HASH.to_string()),
        }
    }
}
