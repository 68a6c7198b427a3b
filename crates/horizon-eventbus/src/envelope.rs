//! Event envelope and its binary wire format.
//!
//! One envelope is one broker message. The layout is a fixed header with
//! the routing fields followed by the opaque payload and optional context:
//!
//! ```text
//! magic "EH" | format u8 | flags u8 | version u64 | secs i64 | nanos u32
//! event_type   u16 len + utf8
//! aggregate_type u16 len + utf8
//! aggregate_id u16 len + utf8
//! payload      u32 len + bytes
//! context      u32 len + bytes   (only when flags bit 0 is set)
//! ```
//!
//! All integers are big-endian. Encoding is deterministic.

use crate::error::{BusError, DecodeError};
use crate::event::Event;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use chrono::{DateTime, Utc};

const MAGIC: [u8; 2] = *b"EH";
const FORMAT_V1: u8 = 1;
const FLAG_CONTEXT: u8 = 0b0000_0001;
const KNOWN_FLAGS: u8 = FLAG_CONTEXT;

/// magic + format + flags + version + secs + nanos
const FIXED_HEADER_LEN: usize = 2 + 1 + 1 + 8 + 8 + 4;

/// A domain event plus the routing metadata the bus needs.
///
/// Fields are private: once built, an envelope is never mutated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventEnvelope {
    event_type: String,
    aggregate_type: String,
    aggregate_id: String,
    version: u64,
    timestamp: DateTime<Utc>,
    payload: Bytes,
    context: Option<Bytes>,
}

impl EventEnvelope {
    /// Create a new envelope stamped with the current time.
    ///
    /// Fails if a routing field is empty or does not fit the wire format.
    pub fn new(
        event_type: impl Into<String>,
        aggregate_type: impl Into<String>,
        aggregate_id: impl Into<String>,
        version: u64,
        payload: impl Into<Bytes>,
    ) -> Result<Self, BusError> {
        let envelope = Self {
            event_type: event_type.into(),
            aggregate_type: aggregate_type.into(),
            aggregate_id: aggregate_id.into(),
            version,
            timestamp: Utc::now(),
            payload: payload.into(),
            context: None,
        };
        envelope.validate()?;
        Ok(envelope)
    }

    /// Create an envelope from a typed event, serializing it as JSON.
    pub fn from_event<E: Event>(
        event: &E,
        aggregate_id: impl Into<String>,
        version: u64,
    ) -> Result<Self, BusError> {
        let payload = serde_json::to_vec(event).map_err(|e| BusError::SerializationFailed {
            event_type: E::EVENT_TYPE.to_string(),
            cause: e.to_string(),
        })?;

        Self::new(
            E::EVENT_TYPE,
            E::AGGREGATE_TYPE,
            aggregate_id,
            version,
            payload,
        )
    }

    /// Attach opaque context (correlation ids and the like).
    pub fn with_context(mut self, context: impl Into<Bytes>) -> Result<Self, BusError> {
        let context = context.into();
        if context.len() > u32::MAX as usize {
            return Err(BusError::InvalidEnvelope {
                reason: "context exceeds 4 GiB".to_string(),
            });
        }
        self.context = Some(context);
        Ok(self)
    }

    /// Replace the creation timestamp.
    ///
    /// Useful for replaying stored events and for deterministic tests.
    #[must_use]
    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn aggregate_type(&self) -> &str {
        &self.aggregate_type
    }

    pub fn aggregate_id(&self) -> &str {
        &self.aggregate_id
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    pub fn context(&self) -> Option<&Bytes> {
        self.context.as_ref()
    }

    /// Get the partition key (the aggregate identifier).
    ///
    /// All events of one aggregate land on the same partition and keep
    /// their relative order.
    pub fn partition_key(&self) -> &[u8] {
        self.aggregate_id.as_bytes()
    }

    /// Deserialize the JSON payload into a typed event.
    pub fn decode_payload<E: Event>(&self) -> Result<E, BusError> {
        if self.event_type != E::EVENT_TYPE {
            return Err(BusError::DeserializationFailed {
                event_type: self.event_type.clone(),
                cause: format!("expected event type {}", E::EVENT_TYPE),
            });
        }

        serde_json::from_slice(&self.payload).map_err(|e| BusError::DeserializationFailed {
            event_type: self.event_type.clone(),
            cause: e.to_string(),
        })
    }

    /// Serialize the envelope to its wire format.
    pub fn encode(&self) -> Bytes {
        let context_len = self.context.as_ref().map_or(0, |c| 4 + c.len());
        let mut buf = BytesMut::with_capacity(
            FIXED_HEADER_LEN
                + 6
                + self.event_type.len()
                + self.aggregate_type.len()
                + self.aggregate_id.len()
                + 4
                + self.payload.len()
                + context_len,
        );

        let flags = if self.context.is_some() { FLAG_CONTEXT } else { 0 };

        buf.put_slice(&MAGIC);
        buf.put_u8(FORMAT_V1);
        buf.put_u8(flags);
        buf.put_u64(self.version);
        buf.put_i64(self.timestamp.timestamp());
        buf.put_u32(self.timestamp.timestamp_subsec_nanos());

        // Lengths were checked in validate().
        for field in [&self.event_type, &self.aggregate_type, &self.aggregate_id] {
            buf.put_u16(field.len() as u16);
            buf.put_slice(field.as_bytes());
        }

        buf.put_u32(self.payload.len() as u32);
        buf.put_slice(&self.payload);

        if let Some(context) = &self.context {
            buf.put_u32(context.len() as u32);
            buf.put_slice(context);
        }

        buf.freeze()
    }

    /// Parse an envelope from delivered bytes.
    ///
    /// Payload and context are zero-copy slices of `bytes`; the buffer
    /// itself is left untouched.
    pub fn decode(bytes: &Bytes) -> Result<Self, DecodeError> {
        let mut reader = Reader(bytes.clone());

        let magic = reader.take(2)?;
        if magic[..] != MAGIC {
            return Err(DecodeError::BadMagic);
        }

        let format = reader.u8()?;
        if format != FORMAT_V1 {
            return Err(DecodeError::UnsupportedFormat(format));
        }

        let flags = reader.u8()?;
        if flags & !KNOWN_FLAGS != 0 {
            return Err(DecodeError::UnknownFlags(flags));
        }

        let version = reader.u64()?;
        let secs = reader.i64()?;
        let nanos = reader.u32()?;
        let timestamp =
            DateTime::<Utc>::from_timestamp(secs, nanos).ok_or(DecodeError::InvalidTimestamp)?;

        let event_type = reader.string("event_type")?;
        let aggregate_type = reader.string("aggregate_type")?;
        let aggregate_id = reader.string("aggregate_id")?;

        let payload_len = reader.u32()? as usize;
        let payload = reader.take(payload_len)?;

        let context = if flags & FLAG_CONTEXT != 0 {
            let context_len = reader.u32()? as usize;
            Some(reader.take(context_len)?)
        } else {
            None
        };

        if reader.0.has_remaining() {
            return Err(DecodeError::TrailingBytes(reader.0.remaining()));
        }

        Ok(Self {
            event_type,
            aggregate_type,
            aggregate_id,
            version,
            timestamp,
            payload,
            context,
        })
    }

    fn validate(&self) -> Result<(), BusError> {
        for (name, value) in [
            ("event_type", &self.event_type),
            ("aggregate_type", &self.aggregate_type),
            ("aggregate_id", &self.aggregate_id),
        ] {
            if value.is_empty() {
                return Err(BusError::InvalidEnvelope {
                    reason: format!("{name} is empty"),
                });
            }
            if value.len() > u16::MAX as usize {
                return Err(BusError::InvalidEnvelope {
                    reason: format!("{name} exceeds {} bytes", u16::MAX),
                });
            }
        }

        if self.payload.len() > u32::MAX as usize {
            return Err(BusError::InvalidEnvelope {
                reason: "payload exceeds 4 GiB".to_string(),
            });
        }

        Ok(())
    }
}

/// Bounds-checked cursor over a delivered buffer.
struct Reader(Bytes);

impl Reader {
    fn ensure(&self, needed: usize) -> Result<(), DecodeError> {
        if self.0.remaining() < needed {
            return Err(DecodeError::Truncated {
                needed,
                remaining: self.0.remaining(),
            });
        }
        Ok(())
    }

    fn take(&mut self, len: usize) -> Result<Bytes, DecodeError> {
        self.ensure(len)?;
        Ok(self.0.split_to(len))
    }

    fn u8(&mut self) -> Result<u8, DecodeError> {
        self.ensure(1)?;
        Ok(self.0.get_u8())
    }

    fn u16(&mut self) -> Result<u16, DecodeError> {
        self.ensure(2)?;
        Ok(self.0.get_u16())
    }

    fn u32(&mut self) -> Result<u32, DecodeError> {
        self.ensure(4)?;
        Ok(self.0.get_u32())
    }

    fn u64(&mut self) -> Result<u64, DecodeError> {
        self.ensure(8)?;
        Ok(self.0.get_u64())
    }

    fn i64(&mut self) -> Result<i64, DecodeError> {
        self.ensure(8)?;
        Ok(self.0.get_i64())
    }

    fn string(&mut self, field: &'static str) -> Result<String, DecodeError> {
        let len = self.u16()? as usize;
        let raw = self.take(len)?;
        let value = std::str::from_utf8(&raw).map_err(|_| DecodeError::InvalidUtf8 { field })?;
        if value.is_empty() {
            return Err(DecodeError::MissingField { field });
        }
        Ok(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};

    #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
    struct OrderCreated {
        customer: String,
    }

    impl Event for OrderCreated {
        const EVENT_TYPE: &'static str = "OrderCreated";
        const AGGREGATE_TYPE: &'static str = "Order";
    }

    fn fixed_time() -> DateTime<Utc> {
        DateTime::<Utc>::from_timestamp(1_700_000_000, 123_456_789).unwrap()
    }

    fn sample() -> EventEnvelope {
        EventEnvelope::new("Created", "Order", "a1", 1, &b"{\"n\":1}"[..])
            .unwrap()
            .with_timestamp(fixed_time())
    }

    #[test]
    fn test_envelope_creation() {
        let envelope = sample();

        assert_eq!(envelope.event_type(), "Created");
        assert_eq!(envelope.aggregate_type(), "Order");
        assert_eq!(envelope.aggregate_id(), "a1");
        assert_eq!(envelope.version(), 1);
        assert_eq!(envelope.partition_key(), b"a1");
        assert!(envelope.context().is_none());
    }

    #[test]
    fn test_envelope_rejects_empty_routing_fields() {
        let result = EventEnvelope::new("", "Order", "a1", 1, Bytes::new());
        assert!(matches!(result, Err(BusError::InvalidEnvelope { .. })));

        let result = EventEnvelope::new("Created", "Order", "", 1, Bytes::new());
        assert!(matches!(result, Err(BusError::InvalidEnvelope { .. })));
    }

    #[test]
    fn test_encode_is_deterministic() {
        let envelope = sample().with_context(&b"corr-42"[..]).unwrap();
        assert_eq!(envelope.encode(), envelope.encode());
        assert_eq!(envelope.encode(), envelope.clone().encode());
    }

    #[test]
    fn test_decode_restores_all_fields() {
        let envelope = sample().with_context(&b"corr-42"[..]).unwrap();
        let bytes = envelope.encode();

        let decoded = EventEnvelope::decode(&bytes).unwrap();
        assert_eq!(decoded, envelope);
        assert_eq!(decoded.timestamp(), fixed_time());
        assert_eq!(decoded.context().unwrap(), &Bytes::from_static(b"corr-42"));
    }

    #[test]
    fn test_decode_leaves_buffer_untouched() {
        let bytes = sample().encode();
        let before = bytes.to_vec();

        let _ = EventEnvelope::decode(&bytes).unwrap();
        assert_eq!(bytes.to_vec(), before);
    }

    #[test]
    fn test_decode_truncated_header() {
        let bytes = sample().encode();
        let short = bytes.slice(..10);

        assert!(matches!(
            EventEnvelope::decode(&short),
            Err(DecodeError::Truncated { .. })
        ));
        assert!(matches!(
            EventEnvelope::decode(&Bytes::new()),
            Err(DecodeError::Truncated {
                needed: 2,
                remaining: 0
            })
        ));
    }

    #[test]
    fn test_decode_garbage() {
        let garbage = Bytes::from_static(b"{\"not\":\"an envelope\"}");
        assert_eq!(
            EventEnvelope::decode(&garbage),
            Err(DecodeError::BadMagic)
        );
    }

    #[test]
    fn test_decode_unknown_format_and_flags() {
        let mut raw = sample().encode().to_vec();
        raw[2] = 9;
        assert_eq!(
            EventEnvelope::decode(&Bytes::from(raw)),
            Err(DecodeError::UnsupportedFormat(9))
        );

        let mut raw = sample().encode().to_vec();
        raw[3] = 0b1000_0000;
        assert_eq!(
            EventEnvelope::decode(&Bytes::from(raw)),
            Err(DecodeError::UnknownFlags(0b1000_0000))
        );
    }

    #[test]
    fn test_decode_payload_length_mismatch() {
        let bytes = sample().encode();

        // Payload shorter than its declared length.
        let cut = bytes.slice(..bytes.len() - 1);
        assert!(matches!(
            EventEnvelope::decode(&cut),
            Err(DecodeError::Truncated { .. })
        ));

        // Extra bytes after the payload.
        let mut padded = bytes.to_vec();
        padded.extend_from_slice(b"xx");
        assert_eq!(
            EventEnvelope::decode(&Bytes::from(padded)),
            Err(DecodeError::TrailingBytes(2))
        );
    }

    #[test]
    fn test_decode_rejects_invalid_utf8() {
        let mut raw = sample().encode().to_vec();
        // First byte of event_type, right after the fixed header and its length.
        raw[FIXED_HEADER_LEN + 2] = 0xff;
        assert_eq!(
            EventEnvelope::decode(&Bytes::from(raw)),
            Err(DecodeError::InvalidUtf8 {
                field: "event_type"
            })
        );
    }

    #[test]
    fn test_typed_event_payload() {
        let event = OrderCreated {
            customer: "alice".to_string(),
        };

        let envelope = EventEnvelope::from_event(&event, "order-7", 3).unwrap();
        assert_eq!(envelope.event_type(), "OrderCreated");
        assert_eq!(envelope.aggregate_type(), "Order");

        let decoded = EventEnvelope::decode(&envelope.encode()).unwrap();
        let typed: OrderCreated = decoded.decode_payload().unwrap();
        assert_eq!(typed, event);
    }

    #[test]
    fn test_typed_payload_type_mismatch() {
        let envelope = sample();
        let result = envelope.decode_payload::<OrderCreated>();
        assert!(matches!(
            result,
            Err(BusError::DeserializationFailed { .. })
        ));
    }
}
