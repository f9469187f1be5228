use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Envelope carried by every frame between schedulers, workers and clients.
///
/// The payload is MessagePack with named fields, so optional fields can be
/// added to protocol structs without breaking older peers. `correlation_id`
/// ties a reply to its request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Routing topic, `stellwerk.<role>.<event>`.
    pub topic: String,

    #[serde(with = "serde_bytes")]
    pub payload: Vec<u8>,

    pub timestamp: DateTime<Utc>,

    pub correlation_id: Uuid,

    /// Protocol version. Receivers reject envelopes newer than they speak.
    #[serde(default = "default_version")]
    pub version: u16,
}

/// Protocol version written by this build.
pub const PROTOCOL_VERSION: u16 = 1;

fn default_version() -> u16 {
    PROTOCOL_VERSION
}

impl Message {
    /// Build a message with a fresh correlation id.
    pub fn new<T: Serialize>(topic: impl Into<String>, payload: &T) -> Result<Self, rmp_serde::encode::Error> {
        Self::with_correlation(topic, payload, Uuid::new_v4())
    }

    /// Build a message that continues an existing exchange.
    pub fn with_correlation<T: Serialize>(
        topic: impl Into<String>,
        payload: &T,
        correlation_id: Uuid,
    ) -> Result<Self, rmp_serde::encode::Error> {
        Ok(Self {
            topic: topic.into(),
            payload: rmp_serde::to_vec_named(payload)?,
            timestamp: Utc::now(),
            correlation_id,
            version: PROTOCOL_VERSION,
        })
    }

    /// Reply to this message on `topic`, reusing its correlation id.
    pub fn reply<T: Serialize>(&self, topic: impl Into<String>, payload: &T) -> Result<Self, rmp_serde::encode::Error> {
        Self::with_correlation(topic, payload, self.correlation_id)
    }

    pub fn decode<T: for<'de> Deserialize<'de>>(&self) -> Result<T, rmp_serde::decode::Error> {
        rmp_serde::from_slice(&self.payload)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, rmp_serde::encode::Error> {
        rmp_serde::to_vec(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, rmp_serde::decode::Error> {
        rmp_serde::from_slice(bytes)
    }
}

/// Encode `Vec<u8>` as a MessagePack bin instead of an array of ints.
mod serde_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_bytes(bytes)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let bytes: &[u8] = Deserialize::deserialize(d)?;
        Ok(bytes.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Ping {
        seq: u32,
        label: String,
    }

    #[test]
    fn envelope_survives_bytes() {
        let msg = Message::new("stellwerk.test.ping", &Ping { seq: 7, label: "x".into() }).unwrap();
        let decoded = Message::from_bytes(&msg.to_bytes().unwrap()).unwrap();

        assert_eq!(decoded.topic, "stellwerk.test.ping");
        assert_eq!(decoded.correlation_id, msg.correlation_id);
        assert_eq!(decoded.version, PROTOCOL_VERSION);
        assert_eq!(decoded.decode::<Ping>().unwrap(), Ping { seq: 7, label: "x".into() });
    }

    #[test]
    fn reply_keeps_the_correlation_id() {
        let request = Message::new("stellwerk.test.ping", &1u8).unwrap();
        let reply = request.reply("stellwerk.test.ping.reply", &2u8).unwrap();
        assert_eq!(reply.correlation_id, request.correlation_id);
        assert_ne!(Message::new("a", &0u8).unwrap().correlation_id, request.correlation_id);
    }

    #[test]
    fn decoding_the_wrong_shape_fails() {
        let msg = Message::new("stellwerk.test.ping", &"not a struct").unwrap();
        assert!(msg.decode::<Ping>().is_err());
    }
}
