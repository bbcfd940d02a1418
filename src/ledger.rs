// Pulsemeter - Pulse capture and acknowledged upload
// Copyright (c) 2025 David Martin Venti
//
// Dual-licensed under AGPL-3.0 and Commercial License.
// See LICENSE file for details.

//! Append-only pulse ledger
//!
//! A comma-separated text table on a [`Medium`]:
//!
//! ```text
//! EnergyMeterID,AccumulatedValue
//! 111,1
//! 111,2
//! 222,3
//! ```
//!
//! Every line is one record and ends with a line break. A line without its
//! break is the remains of an interrupted append and does not count as a
//! record. An empty ledger is the header line alone.
//!
//! The ledger itself does no locking; all access goes through the
//! [`AccessCoordinator`](crate::coordinator::AccessCoordinator).

use log::{debug, info, warn};

use crate::error::LedgerError;
use crate::medium::Medium;
use crate::meter::{LedgerRecord, MeterId};

/// Column names written on the first line
pub const LEDGER_HEADER: [&str; 2] = ["EnergyMeterID", "AccumulatedValue"];

/// Durable record store on top of a [`Medium`]
#[derive(Debug)]
pub struct Ledger<M: Medium> {
    medium: M,
    initialized: bool,
    /// Length to cut back to after an append that failed partway
    rollback_to: Option<u64>,
}

impl<M: Medium> Ledger<M> {
    /// Wrap a medium; call [`ensure_initialized`](Self::ensure_initialized)
    /// before use
    pub fn new(medium: M) -> Self {
        Self {
            medium,
            initialized: false,
            rollback_to: None,
        }
    }

    /// Create the store with its header if absent
    ///
    /// Safe to call on every start: existing records are kept. A torn final
    /// line left by a crash is cut off so the next append starts on a fresh
    /// line.
    pub fn ensure_initialized(&mut self) -> Result<(), LedgerError> {
        self.finish_rollback()?;
        if !self.medium.exists()? {
            self.medium.replace(&header_bytes()?)?;
            info!("Created ledger at {}", self.medium.describe());
            self.initialized = true;
            return Ok(());
        }

        let bytes = self.medium.read()?;
        let committed = committed_len(&bytes);

        if committed == 0 {
            // Not even the header made it to the medium.
            warn!(
                "Ledger at {} has no complete header, rewriting",
                self.medium.describe()
            );
            self.medium.replace(&header_bytes()?)?;
        } else {
            check_header(&bytes[..committed])?;
            if committed < bytes.len() {
                warn!(
                    "Discarding {} bytes of torn record at end of ledger",
                    bytes.len() - committed
                );
                self.medium.truncate(committed as u64)?;
            }
        }

        self.initialized = true;
        Ok(())
    }

    /// Whether [`ensure_initialized`](Self::ensure_initialized) has succeeded
    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Append one record; durable once this returns `Ok`
    ///
    /// On `Err` the ledger holds exactly the records it held before: bytes
    /// of the failed line are cut off, now or before the next access if the
    /// medium refuses the cut.
    pub fn append(&mut self, record: &LedgerRecord) -> Result<(), LedgerError> {
        self.finish_rollback()?;
        let line = encode_row(record.meter_id.as_str(), &record.sequence.to_string())?;
        let committed = self.medium.len()?;

        if let Err(e) = self.medium.append(&line) {
            self.rollback_to = Some(committed);
            if let Err(cut) = self.finish_rollback() {
                warn!(
                    "Could not cut failed append back to {} bytes, will retry: {}",
                    committed, cut
                );
            }
            return Err(e.into());
        }

        debug!("Appended {},{}", record.meter_id, record.sequence);
        Ok(())
    }

    /// All records in append order, header excluded
    pub fn read_all(&self) -> Result<Vec<LedgerRecord>, LedgerError> {
        let bytes = self.medium.read()?;
        match self.rollback_to {
            Some(len) => parse_ledger(&bytes[..bytes.len().min(len as usize)]),
            None => parse_ledger(&bytes),
        }
    }

    /// Discard every record, leaving only the header
    ///
    /// Only the uploader calls this, while holding the coordinator, after
    /// the collector accepted exactly the records `read_all` returned.
    pub fn reset_to_empty(&mut self) -> Result<(), LedgerError> {
        self.medium.replace(&header_bytes()?)?;
        self.rollback_to = None;
        debug!("Ledger reset to header only");
        Ok(())
    }

    /// Highest accumulated value still pending, if any
    pub fn last_sequence(&self) -> Result<Option<u64>, LedgerError> {
        Ok(self.read_all()?.iter().map(|r| r.sequence).max())
    }

    /// Borrow the medium
    pub fn medium(&self) -> &M {
        &self.medium
    }

    fn finish_rollback(&mut self) -> Result<(), LedgerError> {
        if let Some(len) = self.rollback_to {
            self.medium.truncate(len)?;
            self.rollback_to = None;
            warn!("Removed partial record, ledger back to {} bytes", len);
        }
        Ok(())
    }
}

/// Parse raw ledger bytes into records
///
/// Accepts both `\n` and `\r\n` line endings. A trailing unterminated line is
/// ignored; any other malformed line is reported with its line number.
pub fn parse_ledger(bytes: &[u8]) -> Result<Vec<LedgerRecord>, LedgerError> {
    let committed = committed_len(bytes);
    if committed < bytes.len() {
        warn!(
            "Ignoring {} bytes of torn record at end of ledger",
            bytes.len() - committed
        );
    }
    let body = &bytes[..committed];
    check_header(body)?;

    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(body);

    let mut records = Vec::new();
    for result in reader.records() {
        let row = result.map_err(|e| corrupt_from_csv(&e))?;
        let line = row.position().map(|p| p.line()).unwrap_or(0);

        if row.len() != 2 {
            return Err(LedgerError::Corrupt {
                line,
                reason: format!("expected 2 fields, found {}", row.len()),
            });
        }

        let meter_id = MeterId::new(&row[0]).map_err(|e| LedgerError::Corrupt {
            line,
            reason: e.to_string(),
        })?;
        let sequence = row[1]
            .trim()
            .parse::<u64>()
            .map_err(|e| LedgerError::Corrupt {
                line,
                reason: format!("accumulated value {:?}: {}", &row[1], e),
            })?;

        records.push(LedgerRecord::new(meter_id, sequence));
    }

    Ok(records)
}

/// Length of the prefix that ends with the last line break
fn committed_len(bytes: &[u8]) -> usize {
    bytes
        .iter()
        .rposition(|&b| b == b'\n')
        .map(|i| i + 1)
        .unwrap_or(0)
}

fn check_header(body: &[u8]) -> Result<(), LedgerError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(body);
    let headers = reader.headers().map_err(|e| corrupt_from_csv(&e))?;

    if headers.len() != LEDGER_HEADER.len()
        || headers.iter().zip(LEDGER_HEADER).any(|(a, b)| a.trim() != b)
    {
        return Err(LedgerError::Corrupt {
            line: 1,
            reason: format!("unexpected header {:?}", headers),
        });
    }
    Ok(())
}

fn header_bytes() -> Result<Vec<u8>, LedgerError> {
    encode_row(LEDGER_HEADER[0], LEDGER_HEADER[1])
}

fn encode_row(first: &str, second: &str) -> Result<Vec<u8>, LedgerError> {
    let mut writer = csv::WriterBuilder::new()
        .terminator(csv::Terminator::Any(b'\n'))
        .from_writer(Vec::with_capacity(first.len() + second.len() + 2));
    writer.write_record([first, second])?;
    writer.into_inner().map_err(|e| {
        LedgerError::Io(std::io::Error::new(e.error().kind(), e.error().to_string()))
    })
}

fn corrupt_from_csv(err: &csv::Error) -> LedgerError {
    LedgerError::Corrupt {
        line: err.position().map(|p| p.line()).unwrap_or(0),
        reason: err.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::medium::MemoryMedium;

    fn record(id: &str, seq: u64) -> LedgerRecord {
        LedgerRecord::new(MeterId::new(id).unwrap(), seq)
    }

    fn ledger() -> (Ledger<MemoryMedium>, MemoryMedium) {
        let store = MemoryMedium::new();
        let mut ledger = Ledger::new(store.clone());
        ledger.ensure_initialized().unwrap();
        (ledger, store)
    }

    #[test]
    fn test_initialize_writes_header() {
        let (ledger, store) = ledger();
        assert!(ledger.is_initialized());
        assert_eq!(
            store.contents().unwrap(),
            b"EnergyMeterID,AccumulatedValue\n"
        );
        assert!(ledger.read_all().unwrap().is_empty());
    }

    #[test]
    fn test_initialize_is_idempotent() {
        let (mut ledger, store) = ledger();
        ledger.append(&record("111", 1)).unwrap();
        ledger.ensure_initialized().unwrap();

        let mut again = Ledger::new(store.clone());
        again.ensure_initialized().unwrap();
        assert_eq!(again.read_all().unwrap(), vec![record("111", 1)]);
    }

    #[test]
    fn test_append_layout() {
        let (mut ledger, store) = ledger();
        ledger.append(&record("111", 1)).unwrap();
        ledger.append(&record("222", 2)).unwrap();
        assert_eq!(
            store.contents().unwrap(),
            b"EnergyMeterID,AccumulatedValue\n111,1\n222,2\n"
        );
    }

    #[test]
    fn test_reset_then_append() {
        let (mut ledger, _) = ledger();
        ledger.append(&record("111", 1)).unwrap();
        ledger.reset_to_empty().unwrap();
        assert!(ledger.read_all().unwrap().is_empty());

        ledger.append(&record("333", 2)).unwrap();
        assert_eq!(ledger.read_all().unwrap(), vec![record("333", 2)]);
    }

    #[test]
    fn test_torn_tail_ignored_and_repaired() {
        let store = MemoryMedium::with_contents(
            b"EnergyMeterID,AccumulatedValue\n111,1\n222,".to_vec(),
        );
        let mut ledger = Ledger::new(store.clone());
        assert_eq!(ledger.read_all().unwrap(), vec![record("111", 1)]);

        ledger.ensure_initialized().unwrap();
        assert_eq!(
            store.contents().unwrap(),
            b"EnergyMeterID,AccumulatedValue\n111,1\n"
        );
        ledger.append(&record("222", 2)).unwrap();
        assert_eq!(ledger.read_all().unwrap().len(), 2);
    }

    #[test]
    fn test_headerless_store_rewritten() {
        let store = MemoryMedium::with_contents(b"EnergyMet".to_vec());
        let mut ledger = Ledger::new(store.clone());
        ledger.ensure_initialized().unwrap();
        assert_eq!(
            store.contents().unwrap(),
            b"EnergyMeterID,AccumulatedValue\n"
        );
    }

    #[test]
    fn test_crlf_lines_accepted() {
        let bytes = b"EnergyMeterID,AccumulatedValue\r\n111,1\r\n222,2\r\n";
        let records = parse_ledger(bytes).unwrap();
        assert_eq!(records, vec![record("111", 1), record("222", 2)]);
    }

    #[test]
    fn test_corrupt_value_reported_with_line() {
        let bytes = b"EnergyMeterID,AccumulatedValue\n111,1\n222,abc\n";
        match parse_ledger(bytes) {
            Err(LedgerError::Corrupt { line, .. }) => assert_eq!(line, 3),
            other => panic!("expected corruption, got {:?}", other),
        }
    }

    #[test]
    fn test_missing_field_is_corrupt() {
        let bytes = b"EnergyMeterID,AccumulatedValue\n111\n";
        assert!(matches!(
            parse_ledger(bytes),
            Err(LedgerError::Corrupt { .. })
        ));
    }

    #[test]
    fn test_wrong_header_is_corrupt() {
        let store = MemoryMedium::with_contents(b"id,value\n111,1\n".to_vec());
        let mut ledger = Ledger::new(store);
        assert!(matches!(
            ledger.ensure_initialized(),
            Err(LedgerError::Corrupt { line: 1, .. })
        ));
    }

    #[test]
    fn test_last_sequence() {
        let (mut ledger, _) = ledger();
        assert_eq!(ledger.last_sequence().unwrap(), None);
        ledger.append(&record("111", 7)).unwrap();
        ledger.append(&record("111", 9)).unwrap();
        assert_eq!(ledger.last_sequence().unwrap(), Some(9));
    }

    #[test]
    fn test_torn_append_is_cut_back() {
        let (mut ledger, store) = ledger();
        ledger.append(&record("111", 1)).unwrap();

        store.tear_next_append(2);
        assert!(ledger.append(&record("111", 2)).unwrap_err().is_transient());
        assert_eq!(
            store.contents().unwrap(),
            b"EnergyMeterID,AccumulatedValue\n111,1\n"
        );

        ledger.append(&record("111", 2)).unwrap();
        assert_eq!(ledger.read_all().unwrap(), vec![record("111", 1), record("111", 2)]);
    }

    #[test]
    fn test_failed_full_line_is_not_kept() {
        let (mut ledger, store) = ledger();
        store.tear_next_append(usize::MAX);
        assert!(ledger.append(&record("222", 1)).is_err());

        ledger.append(&record("222", 1)).unwrap();
        assert_eq!(
            store.contents().unwrap(),
            b"EnergyMeterID,AccumulatedValue\n222,1\n"
        );
    }

    #[test]
    fn test_rollback_deferred_until_medium_allows_it() {
        let (mut ledger, store) = ledger();
        ledger.append(&record("111", 1)).unwrap();

        store.set_truncate_fails(true);
        store.tear_next_append(usize::MAX);
        assert!(ledger.append(&record("111", 2)).is_err());
        // The failed line is on the medium but is not a record.
        assert_eq!(ledger.read_all().unwrap(), vec![record("111", 1)]);
        assert!(ledger.append(&record("111", 2)).is_err());

        store.set_truncate_fails(false);
        ledger.append(&record("111", 2)).unwrap();
        assert_eq!(
            store.contents().unwrap(),
            b"EnergyMeterID,AccumulatedValue\n111,1\n111,2\n"
        );
    }

    #[test]
    fn test_unavailable_medium() {
        let (mut ledger, store) = ledger();
        store.set_available(false);
        let err = ledger.append(&record("111", 1)).unwrap_err();
        assert!(err.is_transient());
    }
}
