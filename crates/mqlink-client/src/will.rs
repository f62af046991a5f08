//! Last Will and Testament.
//!
//! The broker publishes the will when the connection drops without a
//! DISCONNECT packet. A clean `disconnect` suppresses it.

use bytes::Bytes;
use mqlink_core::packet::{self, QoS};

use crate::error::{ClientError, Result};

/// Will message registered with the broker at connect time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Will {
    /// Topic to publish the will message to.
    pub topic: String,
    /// Will message payload.
    pub payload: Bytes,
    /// QoS level for will message delivery.
    pub qos: QoS,
    /// Whether the will message should be retained.
    pub retain: bool,
}

impl Will {
    /// Create a new will message with QoS 0 and no retain.
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            qos: QoS::AtMostOnce,
            retain: false,
        }
    }

    pub fn qos(mut self, qos: QoS) -> Self {
        self.qos = qos;
        self
    }

    pub fn retain(mut self, retain: bool) -> Self {
        self.retain = retain;
        self
    }

    pub(crate) fn validate(&self) -> Result<()> {
        packet::validate_topic_name(&self.topic)
            .map_err(|e| ClientError::InvalidOptions(format!("will topic: {}", e)))?;
        if self.payload.len() > u16::MAX as usize {
            return Err(ClientError::InvalidOptions(format!(
                "will payload of {} bytes exceeds 65535",
                self.payload.len()
            )));
        }
        Ok(())
    }

    pub(crate) fn to_packet(&self) -> packet::Will {
        packet::Will {
            topic: self.topic.clone(),
            payload: self.payload.clone(),
            qos: self.qos,
            retain: self.retain,
        }
    }
}
