//! Chain-sync data model: points, tips, blocks and instructions.
//!
//! Points and tips are either the distinguished `"origin"` value or a
//! concrete position. Blocks stay opaque JSON; the engine only routes them.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

use crate::error::ClientError;

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
enum OriginTag {
    Origin,
}

#[derive(Serialize, Deserialize, Clone)]
#[serde(untagged)]
enum PointRepr {
    Origin(OriginTag),
    Block { slot: u64, hash: String },
}

#[derive(Serialize, Deserialize, Clone)]
#[serde(untagged)]
enum TipRepr {
    Origin(OriginTag),
    Block {
        slot: u64,
        hash: String,
        #[serde(rename = "blockNo")]
        block_no: u64,
    },
}

/// A position in the remote chain.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash)]
#[serde(from = "PointRepr", into = "PointRepr")]
pub enum Point {
    /// The distinguished start of the chain.
    Origin,
    /// A concrete block position.
    Block { slot: u64, hash: String },
}

impl Point {
    /// Slot of the point, `None` for origin.
    pub fn slot(&self) -> Option<u64> {
        match self {
            Self::Origin => None,
            Self::Block { slot, .. } => Some(*slot),
        }
    }
}

impl From<PointRepr> for Point {
    fn from(repr: PointRepr) -> Self {
        match repr {
            PointRepr::Origin(_) => Self::Origin,
            PointRepr::Block { slot, hash } => Self::Block { slot, hash },
        }
    }
}

impl From<Point> for PointRepr {
    fn from(point: Point) -> Self {
        match point {
            Point::Origin => Self::Origin(OriginTag::Origin),
            Point::Block { slot, hash } => Self::Block { slot, hash },
        }
    }
}

impl fmt::Display for Point {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Origin => write!(f, "origin"),
            Self::Block { slot, hash } => write!(f, "{slot}@{hash}"),
        }
    }
}

/// The remote node's current head, as reported on every response.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash)]
#[serde(from = "TipRepr", into = "TipRepr")]
pub enum Tip {
    Origin,
    Block { slot: u64, hash: String, block_no: u64 },
}

impl Tip {
    /// The point this tip refers to.
    pub fn point(&self) -> Point {
        match self {
            Self::Origin => Point::Origin,
            Self::Block { slot, hash, .. } => Point::Block {
                slot: *slot,
                hash: hash.clone(),
            },
        }
    }

    /// Block number of the tip, `None` for origin.
    pub fn block_no(&self) -> Option<u64> {
        match self {
            Self::Origin => None,
            Self::Block { block_no, .. } => Some(*block_no),
        }
    }
}

impl From<TipRepr> for Tip {
    fn from(repr: TipRepr) -> Self {
        match repr {
            TipRepr::Origin(_) => Self::Origin,
            TipRepr::Block { slot, hash, block_no } => Self::Block { slot, hash, block_no },
        }
    }
}

impl From<Tip> for TipRepr {
    fn from(tip: Tip) -> Self {
        match tip {
            Tip::Origin => Self::Origin(OriginTag::Origin),
            Tip::Block { slot, hash, block_no } => Self::Block { slot, hash, block_no },
        }
    }
}

impl fmt::Display for Tip {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Origin => write!(f, "origin"),
            Self::Block { slot, hash, block_no } => write!(f, "#{block_no} {slot}@{hash}"),
        }
    }
}

/// An opaque block payload, forwarded to handlers exactly as received.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(transparent)]
pub struct Block(Value);

impl Block {
    pub fn new(json: Value) -> Self {
        Self(json)
    }

    pub fn as_json(&self) -> &Value {
        &self.0
    }

    /// The era tag when the block is a single-key object such as `{"babbage": {...}}`.
    pub fn era(&self) -> Option<&str> {
        match &self.0 {
            Value::Object(map) if map.len() == 1 => map.keys().next().map(String::as_str),
            _ => None,
        }
    }
}

/// Starting point agreed with the remote node.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Intersection {
    pub point: Point,
    pub tip: Tip,
}

/// Rewind the cursor to `point`.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct RollBackward {
    pub point: Point,
    pub tip: Tip,
}

/// Append `block` at the cursor.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct RollForward {
    pub block: Block,
    pub tip: Tip,
}

/// A directive emitted by the remote in answer to `RequestNext`.
#[derive(Clone, Debug, PartialEq)]
pub enum Instruction {
    RollBackward(RollBackward),
    RollForward(RollForward),
}

impl Instruction {
    /// Classify a `RequestNext` result by its variant tag.
    ///
    /// A result carrying neither tag is an [`ClientError::UnknownInstruction`];
    /// a known tag with an undecodable body is a [`ClientError::Protocol`] error.
    pub fn from_result(result: Value) -> Result<Self, ClientError> {
        let Value::Object(mut map) = result else {
            return Err(ClientError::UnknownInstruction(result.to_string()));
        };
        if let Some(body) = map.remove("RollBackward") {
            let event = serde_json::from_value(body)
                .map_err(|e| ClientError::Protocol(format!("malformed RollBackward: {e}")))?;
            return Ok(Self::RollBackward(event));
        }
        if let Some(body) = map.remove("RollForward") {
            let event = serde_json::from_value(body)
                .map_err(|e| ClientError::Protocol(format!("malformed RollForward: {e}")))?;
            return Ok(Self::RollForward(event));
        }
        Err(ClientError::UnknownInstruction(Value::Object(map).to_string()))
    }

    pub fn tip(&self) -> &Tip {
        match self {
            Self::RollBackward(event) => &event.tip,
            Self::RollForward(event) => &event.tip,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::RollBackward(_) => "RollBackward",
            Self::RollForward(_) => "RollForward",
        }
    }
}

/// Outcome of a `FindIntersect` exchange.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum IntersectionOutcome {
    Found(Intersection),
    NotFound { tip: Tip },
}

impl IntersectionOutcome {
    pub fn from_result(result: Value) -> Result<Self, ClientError> {
        #[derive(Deserialize)]
        struct NotFound {
            tip: Tip,
        }

        let Value::Object(mut map) = result else {
            return Err(ClientError::Protocol(format!("unexpected FindIntersect result: {result}")));
        };
        if let Some(body) = map.remove("IntersectionFound") {
            let found = serde_json::from_value(body)
                .map_err(|e| ClientError::Protocol(format!("malformed IntersectionFound: {e}")))?;
            return Ok(Self::Found(found));
        }
        if let Some(body) = map.remove("IntersectionNotFound") {
            let NotFound { tip } = serde_json::from_value(body)
                .map_err(|e| ClientError::Protocol(format!("malformed IntersectionNotFound: {e}")))?;
            return Ok(Self::NotFound { tip });
        }
        Err(ClientError::Protocol(format!(
            "unexpected FindIntersect result: {}",
            Value::Object(map)
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sample_point() -> Point {
        Point::Block {
            slot: 42,
            hash: "ab".repeat(32),
        }
    }

    fn sample_tip() -> Tip {
        Tip::Block {
            slot: 100,
            hash: "cd".repeat(32),
            block_no: 7,
        }
    }

    #[test]
    fn origin_point_is_a_plain_string() {
        assert_eq!(serde_json::to_value(Point::Origin).unwrap(), json!("origin"));
        let parsed: Point = serde_json::from_value(json!("origin")).unwrap();
        assert_eq!(parsed, Point::Origin);
    }

    #[test]
    fn block_point_uses_slot_and_hash() {
        let value = serde_json::to_value(sample_point()).unwrap();
        assert_eq!(value, json!({ "slot": 42, "hash": "ab".repeat(32) }));
    }

    #[test]
    fn tip_uses_camel_case_block_no() {
        let value = serde_json::to_value(sample_tip()).unwrap();
        assert_eq!(value["blockNo"], json!(7));
        let parsed: Tip = serde_json::from_value(value).unwrap();
        assert_eq!(parsed, sample_tip());
    }

    #[test]
    fn unknown_string_is_not_a_point() {
        assert!(serde_json::from_value::<Point>(json!("genesis")).is_err());
    }

    #[test]
    fn tip_projects_to_point() {
        assert_eq!(Tip::Origin.point(), Point::Origin);
        assert_eq!(
            sample_tip().point(),
            Point::Block {
                slot: 100,
                hash: "cd".repeat(32)
            }
        );
    }

    #[test]
    fn classify_roll_forward_keeps_block_untouched() {
        let block = json!({ "babbage": { "header": { "slot": 100 }, "body": [1, 2, 3] } });
        let result = json!({ "RollForward": { "block": block.clone(), "tip": sample_tip() } });
        match Instruction::from_result(result).unwrap() {
            Instruction::RollForward(event) => {
                assert_eq!(event.block.as_json(), &block);
                assert_eq!(event.block.era(), Some("babbage"));
                assert_eq!(event.tip, sample_tip());
            }
            other => panic!("expected RollForward, got {other:?}"),
        }
    }

    #[test]
    fn classify_roll_backward() {
        let result = json!({ "RollBackward": { "point": "origin", "tip": "origin" } });
        let instruction = Instruction::from_result(result).unwrap();
        assert_eq!(
            instruction,
            Instruction::RollBackward(RollBackward {
                point: Point::Origin,
                tip: Tip::Origin,
            })
        );
        assert_eq!(instruction.name(), "RollBackward");
    }

    #[test]
    fn classify_unknown_tag() {
        let err = Instruction::from_result(json!({ "AwaitReply": {} })).unwrap_err();
        assert!(matches!(err, ClientError::UnknownInstruction(_)));
        let err = Instruction::from_result(json!(12)).unwrap_err();
        assert!(matches!(err, ClientError::UnknownInstruction(_)));
    }

    #[test]
    fn classify_malformed_body_is_protocol_error() {
        let err = Instruction::from_result(json!({ "RollBackward": { "tip": "origin" } })).unwrap_err();
        assert!(matches!(err, ClientError::Protocol(_)));
    }

    #[test]
    fn intersection_found_round_trips_point_and_tip() {
        let result = json!({ "IntersectionFound": { "point": sample_point(), "tip": sample_tip() } });
        let outcome = IntersectionOutcome::from_result(result).unwrap();
        assert_eq!(
            outcome,
            IntersectionOutcome::Found(Intersection {
                point: sample_point(),
                tip: sample_tip(),
            })
        );
    }

    #[test]
    fn intersection_not_found_carries_tip() {
        let result = json!({ "IntersectionNotFound": { "tip": "origin" } });
        let outcome = IntersectionOutcome::from_result(result).unwrap();
        assert_eq!(outcome, IntersectionOutcome::NotFound { tip: Tip::Origin });
    }

    #[test]
    fn intersection_unknown_shape_is_protocol_error() {
        let err = IntersectionOutcome::from_result(json!({ "Whatever": 1 })).unwrap_err();
        assert!(matches!(err, ClientError::Protocol(_)));
    }
}
