//! Stress tests for the pulse pipeline
//!
//! Run with: cargo test --release stress -- --ignored

use pulsemeter::*;
use std::sync::Arc;
use std::time::Instant;

#[test]
#[ignore] // Run manually with --ignored
fn stress_test_queue_throughput() {
    let (tx, rx) = EventQueue::bounded(1024, OverflowPolicy::DropNewest);
    let id = MeterId::new("111").unwrap();

    let iterations = 1_000_000;
    let start = Instant::now();

    for _ in 0..iterations {
        tx.push(id.clone()).unwrap();
        rx.pop().unwrap();
    }

    let elapsed = start.elapsed();
    let rate = iterations as f64 / elapsed.as_secs_f64();

    println!("Pushed and popped {} events in {:?}", iterations, elapsed);
    println!("Rate: {:.0} events/second", rate);

    assert!(
        rate > 1_000_000.0,
        "Should move at least 1M events/s, got {:.0}",
        rate
    );
}

#[test]
#[ignore]
fn stress_test_concurrent_edges() {
    let (tx, rx) = EventQueue::bounded(64, OverflowPolicy::DropNewest);
    let stats = Arc::new(PipelineStats::new());
    let channels: Vec<ChannelConfig> = (0..8)
        .map(|n| ChannelConfig::rising(format!("m{}", n), n as u8))
        .collect();
    let source = EdgeSource::new(&channels, 32, &tx, &stats).unwrap();

    let per_thread = 100_000u64;
    let start = Instant::now();

    let producers: Vec<_> = source
        .handlers()
        .iter()
        .cloned()
        .map(|handler| {
            std::thread::spawn(move || {
                for _ in 0..per_thread {
                    handler.on_edge();
                }
            })
        })
        .collect();

    let consumer = std::thread::spawn(move || {
        let mut popped = 0u64;
        let deadline = Instant::now() + std::time::Duration::from_secs(30);
        while Instant::now() < deadline {
            match rx.pop() {
                Some(_) => popped += 1,
                None if rx.dropped() + popped == per_thread * 8 => break,
                None => std::hint::spin_loop(),
            }
        }
        popped
    });

    for p in producers {
        p.join().unwrap();
    }
    let popped = consumer.join().unwrap();

    let snap = stats.snapshot();
    println!(
        "{} edges in {:?}: {} queued, {} dropped",
        per_thread * 8,
        start.elapsed(),
        snap.pulses_captured,
        snap.pulses_dropped
    );

    assert_eq!(snap.pulses_captured + snap.pulses_dropped, per_thread * 8);
    assert_eq!(popped, snap.pulses_captured);
}

#[test]
#[ignore]
fn stress_test_file_ledger_appends() {
    let dir = tempfile::tempdir().unwrap();
    let mut ledger = Ledger::new(FileMedium::new(dir.path().join("EnergyData.csv")));
    ledger.ensure_initialized().unwrap();
    let id = MeterId::new("CCC6C8C4-B9DB-4C8D-39D8-08DBEF4C21FB").unwrap();

    let iterations = 2_000;
    let start = Instant::now();
    for seq in 1..=iterations {
        ledger.append(&LedgerRecord::new(id.clone(), seq)).unwrap();
    }
    let elapsed = start.elapsed();

    println!(
        "{} durable appends in {:?} ({:.0}/s)",
        iterations,
        elapsed,
        iterations as f64 / elapsed.as_secs_f64()
    );

    let records = ledger.read_all().unwrap();
    assert_eq!(records.len(), iterations as usize);
    assert_eq!(records.last().map(|r| r.sequence), Some(iterations));

    ledger.reset_to_empty().unwrap();
    assert!(ledger.read_all().unwrap().is_empty());
}

#[test]
#[ignore]
fn stress_test_large_batch_payload() {
    let records: Vec<LedgerRecord> = (1..=100_000u64)
        .map(|seq| LedgerRecord::new(MeterId::new(format!("{}", 111 * (seq % 4 + 1))).unwrap(), seq))
        .collect();

    let start = Instant::now();
    let body = payload::encode(&records).unwrap();
    let decoded = payload::decode(&body).unwrap();

    println!(
        "Encoded and decoded {} records ({} bytes) in {:?}",
        records.len(),
        body.len(),
        start.elapsed()
    );
    assert_eq!(decoded, records);
}
