//! Protocol constants shared by every client.

/// Default host of the node's WebSocket bridge.
pub const DEFAULT_HOST: &str = "localhost";

/// Default port of the node's WebSocket bridge.
pub const DEFAULT_PORT: u16 = 1337;

/// Default number of `RequestNext` messages kept in flight.
pub const DEFAULT_IN_FLIGHT: usize = 100;

/// Default timeout for a one-shot query (seconds).
pub const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 30;

/// Length of the generated request identifier echoed back in `reflection`.
pub const REQUEST_ID_LEN: usize = 5;

/// Service name carried by every envelope.
pub const SERVICE_NAME: &str = "ogmios";

/// Envelope protocol version.
pub const ENVELOPE_VERSION: &str = "1.0";

/// Envelope `type` of outbound requests.
pub const REQUEST_TYPE: &str = "jsonwsp/request";

/// Envelope `type` of successful responses.
pub const RESPONSE_TYPE: &str = "jsonwsp/response";

/// Envelope `type` of fault responses.
pub const FAULT_TYPE: &str = "jsonwsp/fault";

/// Method names understood by the remote node.
pub mod methods {
    pub const FIND_INTERSECT: &str = "FindIntersect";
    pub const REQUEST_NEXT: &str = "RequestNext";
    pub const QUERY: &str = "Query";
    pub const SUBMIT_TX: &str = "SubmitTx";
}

/// Key under `mirror`/`reflection` carrying the one-shot request id.
pub const REQUEST_ID_KEY: &str = "requestId";

/// Key under `mirror`/`reflection` carrying the `RequestNext` sequence number.
pub const SEQUENCE_KEY: &str = "sequence";
