use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use bites_core::{ManualClock, PollOutcome, SensorTable, SimulatedHardware, Technology};

const CHANNELS: u8 = 8;
const POLLS: u16 = 400;

#[test]
fn readers_never_see_a_partial_poll() {
    let hardware = SimulatedHardware::new();
    let handle = hardware.handle();
    let table = Arc::new(SensorTable::new(
        Box::new(hardware),
        Arc::new(ManualClock::new()),
    ));
    for id in 0..CHANNELS {
        table
            .register_channel(Technology::Contact, id, 14 + id)
            .unwrap();
        // Every poll consumes one value per pin, so a completed poll leaves
        // all channels holding the same raw count.
        handle.queue_analog(14 + id, 1..=POLLS);
    }

    let done = Arc::new(AtomicBool::new(false));
    let readers: Vec<_> = (0..4)
        .map(|_| {
            let table = Arc::clone(&table);
            let done = Arc::clone(&done);
            thread::spawn(move || {
                let mut checked = 0u64;
                while !done.load(Ordering::Acquire) {
                    let snapshot = table.snapshot();
                    let first = snapshot[0];
                    for sample in &snapshot {
                        assert_eq!(sample.value, first.value, "mixed poll observed");
                        assert_eq!(sample.timestamp, first.timestamp);
                    }
                    checked += 1;
                }
                checked
            })
        })
        .collect();

    let mut completed = 0;
    while completed < POLLS {
        if let PollOutcome::Completed(summary) = table.poll() {
            assert_eq!(summary.channels, usize::from(CHANNELS));
            completed += 1;
        }
    }
    done.store(true, Ordering::Release);

    for reader in readers {
        assert!(reader.join().unwrap() > 0);
    }
    let last = table.get_sample(CHANNELS - 1);
    assert_eq!(last.value, table.get_sample(0).value);
}
