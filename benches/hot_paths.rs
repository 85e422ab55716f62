use std::io;

use cemond::config::{PageConfig, ThresholdConfig};
use cemond::event::{CeEvent, CpuModel, MCI_STATUS_ADDRV};
use cemond::offline::SysfsWriter;
use cemond::page::PageTracker;
use cemond::trigger::{TriggerRequest, TriggerSpawner};
use criterion::{black_box, criterion_group, criterion_main, Criterion};

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

fn bench_account_hit(c: &mut Criterion) {
    let mut tracker = tracker(8192);
    tracker.account(&ce(0x10000, 0));
    let mut t = 0i64;

    c.bench_function("account_repeat_page", |b| {
        b.iter(|| {
            t += 1;
            black_box(tracker.account(&ce(0x10000, t)));
        })
    });
}

fn bench_account_churn(c: &mut Criterion) {
    let mut tracker = tracker(1);
    let max = tracker.max_corr_err_counters();
    for i in 0..max {
        tracker.account(&ce(((i + 1) as u64) << 12, i as i64));
    }
    let mut i = max as u64;

    c.bench_function("account_replacement_churn", |b| {
        b.iter(|| {
            i += 1;
            black_box(tracker.account(&ce((i + 1) << 12, i as i64)));
        })
    });
}

fn bench_filtered_event(c: &mut Criterion) {
    let mut tracker = tracker(8192);
    let mut ev = ce(0x10000, 0);
    ev.status = 0;

    c.bench_function("account_filtered_event", |b| {
        b.iter(|| {
            black_box(tracker.account(&ev));
        })
    });
}

fn bench_dump(c: &mut Criterion) {
    let mut tracker = tracker(8192);
    for i in 0..1024u64 {
        tracker.account(&ce((i + 1) << 12, i as i64));
    }

    c.bench_function("dump_1k_pages", |b| {
        b.iter(|| {
            let mut out = Vec::with_capacity(64 * 1024);
            tracker.dump(&mut out).expect("dump");
            black_box(out.len());
        })
    });
}

criterion_group!(
    benches,
    bench_account_hit,
    bench_account_churn,
    bench_filtered_event,
    bench_dump
);
criterion_main!(benches);
