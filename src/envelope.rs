//! Canonical wire representation of a domain event.
//!
//! Every event crossing the bus is wrapped in an [`Envelope`]: a stable
//! identity, a per-stream ordering position, a producer timestamp, a schema
//! version, and a tagged payload. Redelivery produces multiple messages with
//! the same [`EventId`]; ordering holds only within one stream.
//!
//! Monetary amounts travel as exact decimal strings. Decoding never
//! best-effort-parses: an unknown schema version or unparseable bytes is a
//! terminal error for that message and is routed to the dead-letter path by
//! the subscription runner.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Wire schema version produced by this build. Decoding accepts exactly this
/// version; anything else is a deployment/version-skew signal.
pub const SCHEMA_VERSION: u32 = 1;

#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error("malformed envelope: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("unsupported schema version {found} (this build supports {supported})")]
    UnsupportedSchemaVersion { found: u32, supported: u32 },
}

/// Globally unique, stable identity of a logical event.
///
/// For chain-origin events this is derived from the transaction hash and log
/// index, so a republish after a failed publish attempt carries the same
/// identity and downstream idempotency holds.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(String);

impl EventId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn from_chain(tx_hash: &TxHash, log_index: u64) -> Self {
        Self(format!("{tx_hash}:{log_index}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Name of a producer stream, e.g. `escrow:base` or `prices:usd`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StreamId(String);

impl StreamId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Monotonic ordering token within one producer stream.
///
/// Ordered block-major, then by log index, matching how chain events are
/// totally ordered within a stream. Sequence-numbered sources use
/// [`StreamPosition::sequence`] with a zero log index.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct StreamPosition {
    pub block: u64,
    pub log_index: u64,
}

impl StreamPosition {
    pub const fn new(block: u64, log_index: u64) -> Self {
        Self { block, log_index }
    }

    pub const fn sequence(seq: u64) -> Self {
        Self {
            block: seq,
            log_index: 0,
        }
    }
}

impl fmt::Display for StreamPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.block, self.log_index)
    }
}

#[derive(Debug, thiserror::Error)]
#[error("invalid {kind}: {value} (expected 0x-prefixed lowercase hex of {expected} digits)")]
pub struct InvalidHexError {
    kind: &'static str,
    value: String,
    expected: usize,
}

fn validate_hex(kind: &'static str, value: &str, digits: usize) -> Result<(), InvalidHexError> {
    let invalid = || InvalidHexError {
        kind,
        value: value.to_string(),
        expected: digits,
    };

    let hex = value.strip_prefix("0x").ok_or_else(invalid)?;
    if hex.len() != digits || !hex.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase())
    {
        return Err(invalid());
    }
    Ok(())
}

/// Normalized lowercase hex account/contract address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Address(String);

impl TryFrom<String> for Address {
    type Error = InvalidHexError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        validate_hex("address", &value, 40)?;
        Ok(Self(value))
    }
}

impl From<Address> for String {
    fn from(addr: Address) -> Self {
        addr.0
    }
}

impl FromStr for Address {
    type Err = InvalidHexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::try_from(s.to_string())
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Normalized lowercase hex transaction hash.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct TxHash(String);

impl TryFrom<String> for TxHash {
    type Error = InvalidHexError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        validate_hex("transaction hash", &value, 64)?;
        Ok(Self(value))
    }
}

impl From<TxHash> for String {
    fn from(hash: TxHash) -> Self {
        hash.0
    }
}

impl FromStr for TxHash {
    type Err = InvalidHexError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::try_from(s.to_string())
    }
}

impl fmt::Display for TxHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Discriminator used for handler dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    EscrowDeployed,
    EscrowApproved,
    EscrowReleased,
    EscrowRefunded,
    PriceUpdated,
    MarginAlert,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::EscrowDeployed => "escrow_deployed",
            Self::EscrowApproved => "escrow_approved",
            Self::EscrowReleased => "escrow_released",
            Self::EscrowRefunded => "escrow_refunded",
            Self::PriceUpdated => "price_updated",
            Self::MarginAlert => "margin_alert",
        };
        f.write_str(name)
    }
}

/// Domain payload, tagged by kind. Amounts are serialized as exact decimal
/// strings so encode/decode round-trips byte-for-byte on monetary fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Payload {
    EscrowDeployed {
        escrow: Address,
        buyer: Address,
        seller: Address,
        asset: String,
        #[serde(with = "rust_decimal::serde::str")]
        amount: Decimal,
    },
    EscrowApproved {
        escrow: Address,
        approver: Address,
    },
    EscrowReleased {
        escrow: Address,
        recipient: Address,
        #[serde(with = "rust_decimal::serde::str")]
        amount: Decimal,
    },
    EscrowRefunded {
        escrow: Address,
        recipient: Address,
        #[serde(with = "rust_decimal::serde::str")]
        amount: Decimal,
    },
    PriceUpdated {
        pair: String,
        #[serde(with = "rust_decimal::serde::str")]
        price: Decimal,
    },
    MarginAlert {
        account: Address,
        #[serde(with = "rust_decimal::serde::str")]
        margin_ratio: Decimal,
        #[serde(with = "rust_decimal::serde::str")]
        threshold: Decimal,
    },
}

impl Payload {
    pub fn kind(&self) -> EventKind {
        match self {
            Self::EscrowDeployed { .. } => EventKind::EscrowDeployed,
            Self::EscrowApproved { .. } => EventKind::EscrowApproved,
            Self::EscrowReleased { .. } => EventKind::EscrowReleased,
            Self::EscrowRefunded { .. } => EventKind::EscrowRefunded,
            Self::PriceUpdated { .. } => EventKind::PriceUpdated,
            Self::MarginAlert { .. } => EventKind::MarginAlert,
        }
    }
}

/// Versioned wrapper for a domain event on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub schema_version: u32,
    pub event_id: EventId,
    pub stream_id: StreamId,
    pub position: StreamPosition,
    pub produced_at: DateTime<Utc>,
    pub payload: Payload,
}

/// Minimal parse used to reject version skew before attempting a full
/// decode, so a future schema never produces a half-parsed envelope.
#[derive(Deserialize)]
struct VersionProbe {
    schema_version: u32,
}

impl Envelope {
    pub fn new(
        event_id: EventId,
        stream_id: StreamId,
        position: StreamPosition,
        produced_at: DateTime<Utc>,
        payload: Payload,
    ) -> Self {
        Self {
            schema_version: SCHEMA_VERSION,
            event_id,
            stream_id,
            position,
            produced_at,
            payload,
        }
    }

    pub fn kind(&self) -> EventKind {
        self.payload.kind()
    }

    pub fn encode(&self) -> Result<Vec<u8>, EnvelopeError> {
        Ok(serde_json::to_vec(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, EnvelopeError> {
        let probe: VersionProbe = serde_json::from_slice(bytes)?;
        if probe.schema_version != SCHEMA_VERSION {
            return Err(EnvelopeError::UnsupportedSchemaVersion {
                found: probe.schema_version,
                supported: SCHEMA_VERSION,
            });
        }

        Ok(serde_json::from_slice(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{test_address, test_tx_hash};
    use rust_decimal_macros::dec;

    fn deployed_envelope() -> Envelope {
        Envelope::new(
            EventId::from_chain(&test_tx_hash('1'), 5),
            StreamId::new("escrow:base"),
            StreamPosition::new(100, 5),
            "2026-08-01T12:00:00Z".parse().unwrap(),
            Payload::EscrowDeployed {
                escrow: test_address('a'),
                buyer: test_address('b'),
                seller: test_address('c'),
                asset: "USDC".to_string(),
                amount: dec!(1500.250000000000000001),
            },
        )
    }

    #[test]
    fn round_trip_preserves_every_field() {
        let envelope = deployed_envelope();
        let bytes = envelope.encode().unwrap();
        let decoded = Envelope::decode(&bytes).unwrap();
        assert_eq!(decoded, envelope);
    }

    #[test]
    fn amounts_serialize_as_exact_strings() {
        let envelope = deployed_envelope();
        let json: serde_json::Value =
            serde_json::from_slice(&envelope.encode().unwrap()).unwrap();
        assert_eq!(
            json["payload"]["amount"],
            serde_json::Value::String("1500.250000000000000001".to_string())
        );
    }

    #[test]
    fn round_trip_preserves_decimal_precision() {
        let envelope = Envelope::new(
            EventId::new("price-42"),
            StreamId::new("prices:usd"),
            StreamPosition::sequence(42),
            Utc::now(),
            Payload::PriceUpdated {
                pair: "ETH/USD".to_string(),
                price: dec!(1999.990000000000000000),
            },
        );

        let decoded = Envelope::decode(&envelope.encode().unwrap()).unwrap();
        let Payload::PriceUpdated { price, .. } = decoded.payload else {
            panic!("expected PriceUpdated");
        };
        // Scale matters: 1999.99 != 1999.990000000000000000 byte-for-byte.
        assert_eq!(price.to_string(), "1999.990000000000000000");
    }

    #[test]
    fn unknown_schema_version_is_rejected_before_full_parse() {
        let mut json: serde_json::Value =
            serde_json::from_slice(&deployed_envelope().encode().unwrap()).unwrap();
        json["schema_version"] = serde_json::json!(2);
        // Remove a required field: the probe must still reject on version
        // alone, without reaching payload parsing.
        json["payload"] = serde_json::json!({});

        let err = Envelope::decode(&serde_json::to_vec(&json).unwrap()).unwrap_err();
        assert!(matches!(
            err,
            EnvelopeError::UnsupportedSchemaVersion {
                found: 2,
                supported: SCHEMA_VERSION
            }
        ));
    }

    #[test]
    fn malformed_bytes_are_rejected() {
        let err = Envelope::decode(b"not json at all").unwrap_err();
        assert!(matches!(err, EnvelopeError::Malformed(_)));
    }

    #[test]
    fn malformed_payload_is_rejected() {
        let bytes = br#"{"schema_version":1,"event_id":"e1","stream_id":"s","position":{"block":1,"log_index":0},"produced_at":"2026-08-01T12:00:00Z","payload":{"kind":"escrow_released"}}"#;
        let err = Envelope::decode(bytes).unwrap_err();
        assert!(matches!(err, EnvelopeError::Malformed(_)));
    }

    #[test]
    fn addresses_must_be_normalized_lowercase_hex() {
        assert!("0xABCDEF0000000000000000000000000000000000"
            .parse::<Address>()
            .is_err());
        assert!("abcdef0000000000000000000000000000000000"
            .parse::<Address>()
            .is_err());
        assert!("0xabcdef000000000000000000000000000000000"
            .parse::<Address>()
            .is_err());
        assert!("0xabcdef0000000000000000000000000000000000"
            .parse::<Address>()
            .is_ok());
    }

    #[test]
    fn chain_event_id_is_stable_across_republish() {
        let tx = test_tx_hash('9');
        assert_eq!(EventId::from_chain(&tx, 3), EventId::from_chain(&tx, 3));
        assert_ne!(EventId::from_chain(&tx, 3), EventId::from_chain(&tx, 4));
    }

    #[test]
    fn stream_positions_order_block_major() {
        assert!(StreamPosition::new(100, 9) < StreamPosition::new(101, 0));
        assert!(StreamPosition::new(100, 1) < StreamPosition::new(100, 2));
        assert_eq!(StreamPosition::new(7, 7), StreamPosition::new(7, 7));
    }
}
