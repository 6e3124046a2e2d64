//! # ebb-core
//! Foundation types, wire envelopes and errors for the Ebb chain-sync client.

pub mod constants;
pub mod error;
pub mod protocol;
pub mod types;

pub use error::{ClientError, HandlerError};
pub use protocol::{Fault, Request, Response};
pub use types::{Block, Instruction, Intersection, IntersectionOutcome, Point, RollBackward, RollForward, Tip};
