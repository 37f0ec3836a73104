use serde::{Deserialize, Serialize};

/// A protocol message exchanged between two peer controllers.
///
/// Encoding to and from transport bytes is the embedder's concern: the core
/// produces and consumes these structured values, and their serde shape is
/// the wire contract the embedder's codec must round-trip.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Globally unique identifier of the transaction this message belongs
    /// to. Results and errors carry the `message_id` of the invoke they
    /// answer, and are correlated by no other key.
    pub message_id: String,
    #[serde(flatten)]
    pub kind: Kind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Kind {
    /// Request a call of `function_id` on the receiving peer.
    Invoke {
        function_id: String,
        args: Vec<WireValue>,
        #[serde(default, skip_serializing_if = "std::ops::Not::not")]
        one_way: bool,
    },
    /// Success response to a prior invoke.
    Result { result: WireValue },
    /// Failure response to a prior invoke.
    Error { error: ErrorRecord },
    /// The sending peer no longer references `function_id`.
    Purge { function_id: String },
    /// Semantic "no response", replying to one-way invokes in waitable
    /// dispatch only.
    None,
}

/// A value crossing the peer boundary: either a descriptor standing in for
/// a function or cancellation token, or plain structured data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum WireValue {
    Descriptor(Descriptor),
    Json(serde_json::Value),
}

/// Wire-level placeholder for a function or cancellation token. Descriptors
/// carry identifiers, never values: the object itself stays with its
/// exporting peer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Descriptor {
    #[serde(rename = "type")]
    pub kind: DescriptorKind,
    pub id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DescriptorKind {
    Function,
    Cancel,
}

/// A transportable rendition of a raised error. The core never moves live
/// error objects across the boundary; it converts them to and from these
/// plain records.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub name: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
}

impl std::fmt::Display for ErrorRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}
