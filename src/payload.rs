// Pulsemeter - Pulse capture and acknowledged upload
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Batch payload wire format
//!
//! One upload carries every pending record as a JSON array, in ledger order:
//!
//! ```json
//! [{"EnergyMeterID":"111","AccumulatedValue":1},
//!  {"EnergyMeterID":"222","AccumulatedValue":2}]
//! ```

use serde::{Deserialize, Serialize};

use crate::error::CollectorError;
use crate::meter::{LedgerRecord, MeterId};

/// Content type of an encoded batch
pub const CONTENT_TYPE: &str = "application/json";

#[derive(Serialize)]
struct EntryRef<'a> {
    #[serde(rename = "EnergyMeterID")]
    meter_id: &'a str,
    #[serde(rename = "AccumulatedValue")]
    accumulated_value: u64,
}

#[derive(Deserialize)]
struct Entry {
    #[serde(rename = "EnergyMeterID")]
    meter_id: String,
    #[serde(rename = "AccumulatedValue")]
    accumulated_value: u64,
}

/// Serialize records into one batch body
pub fn encode(records: &[LedgerRecord]) -> Result<Vec<u8>, CollectorError> {
    let entries: Vec<EntryRef<'_>> = records
        .iter()
        .map(|r| EntryRef {
            meter_id: r.meter_id.as_str(),
            accumulated_value: r.sequence,
        })
        .collect();
    Ok(serde_json::to_vec(&entries)?)
}

/// Parse a batch body back into records
///
/// Used on the receiving side (test collectors, replay tooling).
pub fn decode(body: &[u8]) -> Result<Vec<LedgerRecord>, PayloadError> {
    let entries: Vec<Entry> = serde_json::from_slice(body)?;
    entries
        .into_iter()
        .map(|e| -> Result<LedgerRecord, PayloadError> {
            Ok(LedgerRecord::new(
                MeterId::new(&e.meter_id)?,
                e.accumulated_value,
            ))
        })
        .collect()
}

/// Errors decoding a received batch
#[derive(Debug, thiserror::Error)]
pub enum PayloadError {
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid meter identity: {0}")]
    Meter(#[from] crate::error::MeterError),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::parse_ledger;

    fn record(id: &str, seq: u64) -> LedgerRecord {
        LedgerRecord::new(MeterId::new(id).unwrap(), seq)
    }

    #[test]
    fn test_encode_field_names() {
        let body = encode(&[record("111", 1)]).unwrap();
        assert_eq!(
            std::str::from_utf8(&body).unwrap(),
            r#"[{"EnergyMeterID":"111","AccumulatedValue":1}]"#
        );
    }

    #[test]
    fn test_encode_empty() {
        assert_eq!(encode(&[]).unwrap(), b"[]");
    }

    #[test]
    fn test_payload_matches_persisted_ledger() {
        let ledger = b"EnergyMeterID,AccumulatedValue\n111,1\n111,2\n222,3\n";
        let records = parse_ledger(ledger).unwrap();
        let body = encode(&records).unwrap();
        assert_eq!(decode(&body).unwrap(), records);
    }

    #[test]
    fn test_value_is_integer() {
        let body = encode(&[record("444", 12)]).unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert!(json[0]["AccumulatedValue"].is_u64());
        assert!(json[0]["EnergyMeterID"].is_string());
    }

    #[test]
    fn test_decode_rejects_bad_identity() {
        let body = br#"[{"EnergyMeterID":"","AccumulatedValue":1}]"#;
        assert!(matches!(decode(body), Err(PayloadError::Meter(_))));
    }
}
