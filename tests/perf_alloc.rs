use std::alloc::System;
use std::hint::black_box;
use std::io;

use cemond::config::{PageConfig, ThresholdConfig};
use cemond::event::{CeEvent, CpuModel, MCI_STATUS_ADDRV};
use cemond::offline::SysfsWriter;
use cemond::page::PageTracker;
use cemond::trigger::{TriggerRequest, TriggerSpawner};
use serial_test::serial;
use stats_alloc::{Region, StatsAlloc, INSTRUMENTED_SYSTEM};

#[global_allocator]
static GLOBAL: &StatsAlloc<System> = &INSTRUMENTED_SYSTEM;

struct NullSysfs;

impl SysfsWriter for NullSysfs {
    fn write(&self, _path: &'static str, _value: &str) -> io::Result<()> {
        Ok(())
    }

    fn writable(&self, _path: &'static str) -> bool {
        true
    }
}

struct NullSpawner;

impl TriggerSpawner for NullSpawner {
    fn run(&self, _req: TriggerRequest) -> anyhow::Result<()> {
        Ok(())
    }
}

fn measure_alloc_counts<T>(f: impl FnOnce() -> T) -> (T, usize, usize) {
    // Calibrate for ambient allocator activity in the test harness process.
    let idle_region = Region::new(&GLOBAL);
    black_box(());
    let idle = idle_region.change();

    let region = Region::new(&GLOBAL);
    let output = f();
    let used = region.change();

    let allocations = used.allocations.saturating_sub(idle.allocations);
    let deallocations = used.deallocations.saturating_sub(idle.deallocations);
    (output, allocations, deallocations)
}

fn tracker(max: usize) -> PageTracker {
    let cfg = PageConfig {
        memory_ce: ThresholdConfig {
            threshold: Some("100000 / 24h".to_string()),
            trigger: None,
            log: false,
        },
        memory_ce_action: "account".to_string(),
        max_corr_err_counters: max,
        ..PageConfig::default()
    };
    PageTracker::new(&cfg, CpuModel::Generic, Box::new(NullSysfs), Box::new(NullSpawner))
        .expect("tracker setup")
}

fn ce(addr: u64, time: i64) -> CeEvent {
    CeEvent {
        addr,
        status: MCI_STATUS_ADDRV,
        time,
        cpu: 1,
        ext_cpu: 0,
        bank: 0,
        socket_id: 0,
        channel: 0,
        dimm: 0,
    }
}

#[test]
#[serial]
fn repeat_page_accounting_allocates_zero() {
    let mut tracker = tracker(1024);
    // Warm up: the record and its cluster exist before measuring.
    tracker.account(&ce(0x10000, 0));

    let (_out, allocations, deallocations) = measure_alloc_counts(|| {
        for t in 1..=4096 {
            black_box(tracker.account(&ce(0x10000, t)));
        }
    });

    assert!(
        allocations <= 8,
        "steady-state accounting allocation budget exceeded: {}",
        allocations
    );
    assert!(
        deallocations <= 8,
        "steady-state accounting deallocation budget exceeded: {}",
        deallocations
    );
}

#[test]
#[serial]
fn filtered_event_allocates_zero() {
    let mut tracker = tracker(1024);
    let mut ev = ce(0x10000, 0);
    ev.status = 0; // no valid address

    let (_out, allocations, _deallocations) = measure_alloc_counts(|| {
        for _ in 0..4096 {
            black_box(tracker.account(&ev));
        }
    });

    assert!(
        allocations <= 8,
        "filter path allocation budget exceeded: {}",
        allocations
    );
}

#[test]
#[serial]
fn replacement_churn_allocation_budget() {
    let mut tracker = tracker(1);
    let max = tracker.max_corr_err_counters();
    // Reach capacity so every further distinct address is a replacement.
    for i in 0..max {
        tracker.account(&ce(((i + 1) as u64) << 12, i as i64));
    }

    let (_out, allocations, _deallocations) = measure_alloc_counts(|| {
        for i in 0..512u64 {
            let addr = (max as u64 + i + 1) << 12;
            black_box(tracker.account(&ce(addr, i as i64)));
        }
    });

    // Replacements rebind index keys but never grow the arena.
    assert!(
        allocations <= 4 * 512,
        "replacement churn allocation budget exceeded: {}",
        allocations
    );
}
