//! Core data models shared by ingestion, retrieval, and the messaging channel.
//!
//! A [`Document`] is loaded from a file or built from a CRM record, split into
//! [`Chunk`]s that inherit its metadata, and stored in the vector index.
//! Retrieval hands back [`RetrievedChunk`]s, and the answer pipeline returns
//! an [`Answer`] that carries the chunks it was grounded on.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Well-known metadata keys.
pub mod keys {
    /// Origin of the record: a file path or `"hubspot"`.
    pub const SOURCE: &str = "source";
    /// One of `contact`, `company`, `deal`, `owner`, `file`.
    pub const OBJECT_TYPE: &str = "object_type";
    /// Identifier of the CRM record itself.
    pub const HS_OBJECT_ID: &str = "hs_object_id";
    /// Identifier of the contact a non-contact record belongs to.
    pub const ASSOCIATED_CONTACT_ID: &str = "associated_contact_id";
    pub const ASSOCIATED_COMPANY_ID: &str = "associated_company_id";
}

/// A scalar metadata value.
///
/// Filters compare identifiers by their canonical text, so `Text("1")` and
/// `Int(1)` refer to the same record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MetadataValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
}

impl MetadataValue {
    /// Text used for identifier comparison. `None` for bools and floats,
    /// which compare by type.
    pub fn key_text(&self) -> Option<String> {
        match self {
            MetadataValue::Text(s) => Some(s.clone()),
            MetadataValue::Int(i) => Some(i.to_string()),
            MetadataValue::Bool(_) | MetadataValue::Float(_) => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            MetadataValue::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for MetadataValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetadataValue::Bool(b) => write!(f, "{}", b),
            MetadataValue::Int(i) => write!(f, "{}", i),
            MetadataValue::Float(x) => write!(f, "{}", x),
            MetadataValue::Text(s) => f.write_str(s),
        }
    }
}

impl From<&str> for MetadataValue {
    fn from(s: &str) -> Self {
        MetadataValue::Text(s.to_string())
    }
}

impl From<String> for MetadataValue {
    fn from(s: String) -> Self {
        MetadataValue::Text(s)
    }
}

impl From<i64> for MetadataValue {
    fn from(i: i64) -> Self {
        MetadataValue::Int(i)
    }
}

impl From<f64> for MetadataValue {
    fn from(x: f64) -> Self {
        MetadataValue::Float(x)
    }
}

impl From<bool> for MetadataValue {
    fn from(b: bool) -> Self {
        MetadataValue::Bool(b)
    }
}

pub type Metadata = BTreeMap<String, MetadataValue>;

/// Kind of record a document was built from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObjectType {
    Contact,
    Company,
    Deal,
    Owner,
    File,
}

impl ObjectType {
    pub const CRM: [ObjectType; 4] = [
        ObjectType::Contact,
        ObjectType::Company,
        ObjectType::Deal,
        ObjectType::Owner,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ObjectType::Contact => "contact",
            ObjectType::Company => "company",
            ObjectType::Deal => "deal",
            ObjectType::Owner => "owner",
            ObjectType::File => "file",
        }
    }
}

impl fmt::Display for ObjectType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ObjectType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "contact" | "contacts" => Ok(ObjectType::Contact),
            "company" | "companies" => Ok(ObjectType::Company),
            "deal" | "deals" => Ok(ObjectType::Deal),
            "owner" | "owners" => Ok(ObjectType::Owner),
            "file" | "files" => Ok(ObjectType::File),
            other => anyhow::bail!("Unknown object type: '{}'", other),
        }
    }
}

/// A unit of source content with flat scalar metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    pub content: String,
    #[serde(default)]
    pub metadata: Metadata,
}

impl Document {
    pub fn new(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            metadata: Metadata::new(),
        }
    }

    /// Builder-style metadata insert.
    pub fn with_meta(mut self, key: &str, value: impl Into<MetadataValue>) -> Self {
        self.metadata.insert(key.to_string(), value.into());
        self
    }

    pub fn meta(&self, key: &str) -> Option<&MetadataValue> {
        self.metadata.get(key)
    }

    pub fn object_type(&self) -> Option<ObjectType> {
        self.meta(keys::OBJECT_TYPE)
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse().ok())
    }

    pub fn hs_object_id(&self) -> Option<String> {
        self.meta(keys::HS_OBJECT_ID).and_then(|v| v.key_text())
    }
}

/// A contiguous span of a document's text. Metadata is copied unchanged
/// from the parent document.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub id: String,
    pub chunk_index: i64,
    pub text: String,
    /// SHA-256 of `text`.
    pub hash: String,
    pub metadata: Metadata,
}

/// A chunk returned by a similarity search.
#[derive(Debug, Clone, Serialize)]
pub struct RetrievedChunk {
    pub chunk_id: String,
    pub text: String,
    pub metadata: Metadata,
    pub score: f32,
}

/// A grounded answer and the evidence it was built from.
#[derive(Debug, Clone, Serialize)]
pub struct Answer {
    pub text: String,
    /// The question after optional correction, when it differs from the input.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub interpreted_as: Option<String>,
    pub evidence: Vec<RetrievedChunk>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    In,
    Out,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::In => "in",
            Direction::Out => "out",
        }
    }
}

impl FromStr for Direction {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "in" => Ok(Direction::In),
            "out" => Ok(Direction::Out),
            other => anyhow::bail!("Unknown message direction: '{}'", other),
        }
    }
}

/// One stored message of a messaging-channel conversation.
#[derive(Debug, Clone, Serialize)]
pub struct ConversationMessage {
    pub id: i64,
    pub identity: String,
    pub direction: Direction,
    pub text: String,
    pub timestamp: DateTime<Utc>,
}

/// Binding of an external messaging identity to a CRM contact.
#[derive(Debug, Clone, Serialize)]
pub struct IdentityLink {
    pub identity: String,
    pub contact_id: String,
    pub display_name: Option<String>,
    pub linked_at: DateTime<Utc>,
}
