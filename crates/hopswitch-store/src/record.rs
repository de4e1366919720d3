//! On-disk encoding of circuits.

use bytes::Bytes;
use chrono::{DateTime, TimeZone, Utc};
use hopswitch_core::{CircuitKey, ChannelId, FailureCode, FailureReason, PaymentHash, Preimage, Resolution};
use prost::Message;

use crate::circuit_map::Circuit;
use crate::error::StoreError;

#[derive(Clone, PartialEq, Message)]
pub struct KeyRecord {
    #[prost(uint64, tag = "1")]
    pub chan_id: u64,
    #[prost(uint64, tag = "2")]
    pub htlc_index: u64,
}

#[derive(Clone, PartialEq, Message)]
pub struct ResolutionRecord {
    /// Set for settlements, empty for failures.
    #[prost(bytes = "vec", tag = "1")]
    pub preimage: Vec<u8>,
    #[prost(uint32, tag = "2")]
    pub failure_code: u32,
    #[prost(string, optional, tag = "3")]
    pub failure_message: Option<String>,
}

#[derive(Clone, PartialEq, Message)]
pub struct CircuitRecord {
    #[prost(message, optional, tag = "1")]
    pub incoming: Option<KeyRecord>,
    /// Absent for exit-hop circuits.
    #[prost(message, optional, tag = "2")]
    pub outgoing: Option<KeyRecord>,
    #[prost(bytes = "vec", tag = "3")]
    pub payment_hash: Vec<u8>,
    #[prost(uint64, tag = "4")]
    pub incoming_amount_msat: u64,
    #[prost(uint64, tag = "5")]
    pub outgoing_amount_msat: u64,
    #[prost(bytes = "vec", tag = "6")]
    pub payload: Vec<u8>,
    #[prost(int64, tag = "7")]
    pub created_at_ms: i64,
    #[prost(message, optional, tag = "8")]
    pub resolution: Option<ResolutionRecord>,
}

impl From<CircuitKey> for KeyRecord {
    fn from(key: CircuitKey) -> Self {
        Self {
            chan_id: key.chan_id.as_u64(),
            htlc_index: key.htlc_index,
        }
    }
}

impl From<&KeyRecord> for CircuitKey {
    fn from(rec: &KeyRecord) -> Self {
        CircuitKey::new(ChannelId(rec.chan_id), rec.htlc_index)
    }
}

impl From<&Resolution> for ResolutionRecord {
    fn from(res: &Resolution) -> Self {
        match res {
            Resolution::Settle(p) => Self {
                preimage: p.as_bytes().to_vec(),
                failure_code: 0,
                failure_message: None,
            },
            Resolution::Fail(reason) => Self {
                preimage: Vec::new(),
                failure_code: u32::from(reason.code.to_wire()),
                failure_message: reason.message.clone(),
            },
        }
    }
}

impl TryFrom<&ResolutionRecord> for Resolution {
    type Error = StoreError;

    fn try_from(rec: &ResolutionRecord) -> Result<Self, Self::Error> {
        if !rec.preimage.is_empty() {
            return Ok(Resolution::Settle(Preimage::from_slice(&rec.preimage)?));
        }
        let code = u16::try_from(rec.failure_code)
            .map_err(|_| StoreError::Corrupt(format!("failure code {} out of range", rec.failure_code)))?;
        Ok(Resolution::Fail(FailureReason {
            code: FailureCode::from_wire(code)?,
            message: rec.failure_message.clone(),
        }))
    }
}

pub fn encode_circuit(circuit: &Circuit) -> Vec<u8> {
    CircuitRecord {
        incoming: Some(circuit.incoming.into()),
        outgoing: circuit.outgoing.map(KeyRecord::from),
        payment_hash: circuit.payment_hash.as_bytes().to_vec(),
        incoming_amount_msat: circuit.incoming_amount_msat,
        outgoing_amount_msat: circuit.outgoing_amount_msat,
        payload: circuit.payload.to_vec(),
        created_at_ms: circuit.created_at.timestamp_millis(),
        resolution: circuit.resolution.as_ref().map(ResolutionRecord::from),
    }
    .encode_to_vec()
}

pub fn decode_circuit(bytes: &[u8]) -> Result<Circuit, StoreError> {
    let rec = CircuitRecord::decode(bytes)?;
    let incoming = rec
        .incoming
        .as_ref()
        .map(CircuitKey::from)
        .ok_or_else(|| StoreError::Corrupt("circuit record without incoming key".into()))?;
    let created_at: DateTime<Utc> = Utc
        .timestamp_millis_opt(rec.created_at_ms)
        .single()
        .ok_or_else(|| StoreError::Corrupt(format!("bad timestamp {}", rec.created_at_ms)))?;

    Ok(Circuit {
        incoming,
        outgoing: rec.outgoing.as_ref().map(CircuitKey::from),
        payment_hash: PaymentHash::from_slice(&rec.payment_hash)?,
        incoming_amount_msat: rec.incoming_amount_msat,
        outgoing_amount_msat: rec.outgoing_amount_msat,
        payload: Bytes::from(rec.payload),
        created_at,
        resolution: rec.resolution.as_ref().map(Resolution::try_from).transpose()?,
    })
}
