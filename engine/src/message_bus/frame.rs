//! Broker wire protocol
//!
//! One JSON object per WebSocket text frame, tagged by `op`.

use serde::{Deserialize, Serialize};

/// Frame sent by a bus client to the broker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ClientFrame {
    Subscribe { channel: String },
    Unsubscribe { channel: String },
    Publish { channel: String, payload: String },
    Count { request_id: u64, channel: String },
}

/// Frame sent by the broker to a bus client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ServerFrame {
    /// Subscription on `channel` is live
    Subscribed { channel: String },
    /// Payload published on a channel the client subscribed to
    Message { channel: String, payload: String },
    /// Reply to [`ClientFrame::Count`]
    Count { request_id: u64, count: usize },
    /// The previous frame was rejected
    Error { message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_frame_wire_shape() {
        let frame = ClientFrame::Publish {
            channel: "results".to_string(),
            payload: "{}".to_string(),
        };
        let json = serde_json::to_string(&frame).unwrap();
        assert_eq!(json, r#"{"op":"publish","channel":"results","payload":"{}"}"#);
    }

    #[test]
    fn test_server_frame_parse() {
        let frame: ServerFrame =
            serde_json::from_str(r#"{"op":"count","request_id":7,"count":2}"#).unwrap();
        assert_eq!(
            frame,
            ServerFrame::Count {
                request_id: 7,
                count: 2
            }
        );
    }
}
