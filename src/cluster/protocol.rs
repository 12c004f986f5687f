//! Cluster Protocol Messages
//!
//! Defines the binary protocol used for inter-node communication.
//! Messages are serialized using bincode for efficiency.

use bincode::{Decode, Encode};

/// Protocol version for compatibility checking
pub const CLUSTER_PROTOCOL_VERSION: u8 = 1;

/// Messages exchanged between cluster nodes over TCP
#[derive(Debug, Clone, Encode, Decode)]
pub enum ClusterMessage {
    /// Handshake sent when connecting to a peer
    Hello {
        /// Node ID of the sender
        node_id: String,
        /// Protocol version
        version: u8,
    },

    /// Handshake acknowledgment
    HelloAck {
        /// Node ID of the responder
        node_id: String,
        /// Protocol version
        version: u8,
    },

    /// Forward a published message to peer
    Publish {
        /// Topic of the message
        topic: String,
        /// Message payload
        payload: Vec<u8>,
        /// QoS level (0, 1, or 2)
        qos: u8,
        /// Retain flag
        retain: bool,
        /// Origin node ID (to prevent loops)
        origin_node: String,
    },

    /// Keep-alive ping
    Ping,

    /// Keep-alive pong
    Pong,

    /// Graceful disconnect notification
    Goodbye,
}

impl ClusterMessage {
    /// Encode message to bytes using bincode
    pub fn encode(&self) -> Result<Vec<u8>, bincode::error::EncodeError> {
        bincode::encode_to_vec(self, bincode::config::standard())
    }

    /// Decode message from bytes using bincode
    pub fn decode(data: &[u8]) -> Result<Self, bincode::error::DecodeError> {
        bincode::decode_from_slice(data, bincode::config::standard()).map(|(msg, _)| msg)
    }

    /// Get the message type name for logging
    pub fn type_name(&self) -> &'static str {
        match self {
            ClusterMessage::Hello { .. } => "Hello",
            ClusterMessage::HelloAck { .. } => "HelloAck",
            ClusterMessage::Publish { .. } => "Publish",
            ClusterMessage::Ping => "Ping",
            ClusterMessage::Pong => "Pong",
            ClusterMessage::Goodbye => "Goodbye",
        }
    }
}

/// Frame a message with length prefix for TCP transmission
pub fn frame_message(msg: &ClusterMessage) -> Result<Vec<u8>, bincode::error::EncodeError> {
    let payload = msg.encode()?;
    let len = payload.len() as u32;

    let mut frame = Vec::with_capacity(4 + payload.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(&payload);

    Ok(frame)
}

/// Read frame length from bytes (returns None if not enough data)
pub fn read_frame_length(data: &[u8]) -> Option<u32> {
    if data.len() < 4 {
        return None;
    }
    Some(u32::from_be_bytes([data[0], data[1], data[2], data[3]]))
}
