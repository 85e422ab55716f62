pub mod cluster;
pub mod index;
pub mod record;

use std::io::{self, Write};
use std::path::PathBuf;

use anyhow::{Context, Result};
use tracing::{debug, info, warn};

use crate::bucket::{BucketConfig, LeakyBucket};
use crate::config::PageConfig;
use crate::event::{page_align, CeEvent, CpuModel};
use crate::memdb::DimmDb;
use crate::offline::{OfflineMode, Offliner, SysfsWriter};
use crate::trigger::{self, TriggerRequest, TriggerSpawner};

pub use cluster::{ClusterPool, RecordId, SLOTS_PER_CLUSTER};
pub use index::AddrIndex;
pub use record::{OfflineStatus, PageRecord};

/// What one `account` call did, for callers that export statistics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AccountOutcome {
    /// The event survived the pre-filters and was counted.
    pub accounted: bool,
    /// A tracked-page slot was recycled for this event's address.
    pub replaced: bool,
    /// The per-page threshold fired and the trigger/offline path ran.
    pub threshold_fired: bool,
    /// Outcome of an offline attempt, when one was made.
    pub offline_result: Option<bool>,
}

/// Rate of table-slot replacements. Crossing its threshold means the table
/// is undersized for the error rate.
#[derive(Debug, Default)]
struct ReplacementMonitor {
    bucket: LeakyBucket,
    count: u64,
}

/// Threshold state shared by the page trigger and its soft wrappers.
struct ThresholdCtx<'a> {
    summary: &'a str,
    total_count: u64,
    threshold_count: u64,
    t: i64,
    location: &'a str,
}

/// Owner of all per-page CE accounting state: the cluster arena, the address
/// index, the replacement monitor and the resolved policies. One event at a
/// time; nothing here is shared across threads.
pub struct PageTracker {
    cpu_model: CpuModel,
    page_trigger_conf: BucketConfig,
    replacement_trigger_conf: BucketConfig,
    pre_soft_trigger: Option<PathBuf>,
    post_soft_trigger: Option<PathBuf>,
    max_corr_err_counters: usize,
    /// Live records; never exceeds `max_corr_err_counters`.
    tracked: usize,
    pool: ClusterPool,
    index: AddrIndex,
    monitor: ReplacementMonitor,
    dimms: DimmDb,
    offliner: Offliner,
    spawner: Box<dyn TriggerSpawner>,
}

impl PageTracker {
    /// Resolve configuration and build the tracker.
    ///
    /// Fatal when a configured pre/post-soft trigger is missing or not
    /// executable. A requested offline mode whose kernel interface is not
    /// writable is demoted to `account` with a notice.
    pub fn new(
        cfg: &PageConfig,
        cpu_model: CpuModel,
        sysfs: Box<dyn SysfsWriter>,
        spawner: Box<dyn TriggerSpawner>,
    ) -> Result<Self> {
        let page_trigger_conf = cfg
            .memory_ce
            .resolve()
            .context("resolving memory-ce threshold")?;
        let replacement_trigger_conf = cfg
            .memory_ce_counter_replacement
            .resolve()
            .context("resolving memory-ce-counter-replacement threshold")?;

        let requested = cfg
            .resolved_action()
            .with_context(|| format!("unknown memory-ce-action: {}", cfg.memory_ce_action))?;
        let offliner = Offliner::new(requested, cfg.row_offline_pages, sysfs);

        if let Some(path) = &cfg.memory_pre_sync_soft_ce_trigger {
            trigger::check_executable(path).context("pre-sync soft CE trigger")?;
        }
        if let Some(path) = &cfg.memory_post_sync_soft_ce_trigger {
            trigger::check_executable(path).context("post-sync soft CE trigger")?;
        }

        let max_corr_err_counters =
            cfg.max_corr_err_counters.div_ceil(SLOTS_PER_CLUSTER) * SLOTS_PER_CLUSTER;
        if max_corr_err_counters != cfg.max_corr_err_counters {
            info!(
                from = cfg.max_corr_err_counters,
                to = max_corr_err_counters,
                "rounding max-corr-err-counters up to a multiple of the cluster size",
            );
        }

        Ok(Self {
            cpu_model,
            page_trigger_conf,
            replacement_trigger_conf,
            pre_soft_trigger: cfg.memory_pre_sync_soft_ce_trigger.clone(),
            post_soft_trigger: cfg.memory_post_sync_soft_ce_trigger.clone(),
            max_corr_err_counters,
            tracked: 0,
            pool: ClusterPool::new(),
            index: AddrIndex::new(),
            monitor: ReplacementMonitor::default(),
            dimms: DimmDb::new(),
            offliner,
            spawner,
        })
    }

    /// Effective offline mode after setup demotion.
    pub fn mode(&self) -> OfflineMode {
        self.offliner.mode()
    }

    /// Capacity bound after setup rounding.
    pub fn max_corr_err_counters(&self) -> usize {
        self.max_corr_err_counters
    }

    /// Number of pages currently tracked.
    pub fn tracked(&self) -> usize {
        self.tracked
    }

    /// Total counter replacements since startup.
    pub fn replacement_count(&self) -> u64 {
        self.monitor.count
    }

    /// Number of live entries in the address index.
    pub fn index_len(&self) -> usize {
        self.index.len()
    }

    /// The record tracked for a page-aligned address, if any.
    pub fn record_for(&self, addr: u64) -> Option<&PageRecord> {
        self.index.lookup(addr).map(|id| self.pool.record(id))
    }

    /// Account one decoded corrected-error event: the daemon entry point.
    pub fn account(&mut self, ev: &CeEvent) -> AccountOutcome {
        let mut outcome = AccountOutcome::default();

        if self.offliner.mode() == OfflineMode::Off {
            return outcome;
        }
        if !ev.addr_valid() || ev.uncorrected() {
            return outcome;
        }
        // SNB-EP reports corrected errors twice: once from the hardware bank
        // and once as a firmware-first record faked from CPU 0 bank 1. Drop
        // the duplicate.
        if self.cpu_model == CpuModel::SandyBridgeEp && ev.bank == 1 && ev.effective_cpu() == 0 {
            return outcome;
        }

        let addr = page_align(ev.addr);
        let t = ev.time;
        outcome.accounted = true;

        let id = match self.index.lookup(addr) {
            Some(id) => {
                self.pool.touch(id);
                id
            }
            None if self.tracked < self.max_corr_err_counters => {
                let id = self.pool.alloc();
                self.pool.record_mut(id).address = addr;
                self.index.insert(addr, id);
                self.pool.touch(id);
                self.tracked += 1;
                id
            }
            None => {
                let (id, stale) = self.pool.replace();
                self.pool.record_mut(id).address = addr;
                self.index.rebind(stale, addr, id);
                self.pool.touch(id);
                outcome.replaced = true;
                self.monitor.count += 1;
                if self
                    .monitor
                    .bucket
                    .account(&self.replacement_trigger_conf, 1, t)
                {
                    self.replacement_trigger(t);
                }
                id
            }
        };

        let crossed = {
            let rec = self.pool.record_mut(id);
            rec.ce_count += 1;
            rec.bucket.account(&self.page_trigger_conf, 1, t)
        };
        if !crossed {
            return outcome;
        }
        // Only trigger and offline pages that are still online.
        if self.pool.record(id).status != OfflineStatus::Online {
            return outcome;
        }
        outcome.threshold_fired = true;

        let (summary, total_count, threshold_count) = {
            let rec = self.pool.record(id);
            (
                rec.bucket.summary(&self.page_trigger_conf),
                rec.ce_count,
                rec.bucket.total_seen(),
            )
        };

        let location = self
            .dimms
            .get_or_create(ev.socket_id, ev.channel, ev.dimm)
            .location();
        let ctx = ThresholdCtx {
            summary: &summary,
            total_count,
            threshold_count,
            t,
            location: &location,
        };
        let msg =
            format!("Corrected memory errors on page {addr:x} exceed threshold {summary}");
        self.threshold_message(&self.page_trigger_conf, &msg);
        self.run_page_trigger(&msg, &ctx);
        self.pool.record_mut(id).triggered = true;

        outcome.offline_result = match self.offliner.mode() {
            OfflineMode::Soft | OfflineMode::SoftThenHard => {
                self.run_soft_wrapper(self.pre_soft_trigger.clone(), "page-pre-soft", addr, &ctx);
                let res = self.offline_action(id, addr);
                self.run_soft_wrapper(
                    self.post_soft_trigger.clone(),
                    "page-post-soft",
                    addr,
                    &ctx,
                );
                res
            }
            _ => self.offline_action(id, addr),
        };

        outcome
    }

    /// Ask the kernel to offline the page and record the result. Pages in
    /// `off`/`account` modes are left untouched.
    fn offline_action(&mut self, id: RecordId, addr: u64) -> Option<bool> {
        if self.offliner.mode() <= OfflineMode::Account {
            return None;
        }
        info!("offlining page {addr:x}");
        match self.offliner.offline(addr) {
            Ok(()) => {
                self.pool.record_mut(id).status = OfflineStatus::Offline;
                Some(true)
            }
            Err(e) => {
                warn!("offlining page {addr:x} failed: {e}");
                self.pool.record_mut(id).status = OfflineStatus::OfflineFailed;
                Some(false)
            }
        }
    }

    /// Emit a threshold message through the log when the bucket asks for it.
    fn threshold_message(&self, conf: &BucketConfig, msg: &str) {
        if conf.log {
            info!("{msg}");
        }
    }

    /// Asynchronous per-page threshold trigger.
    fn run_page_trigger(&self, msg: &str, ctx: &ThresholdCtx<'_>) {
        let Some(path) = &self.page_trigger_conf.trigger else {
            return;
        };
        let env = trigger::env_block(&trigger::ThresholdEnv {
            threshold: ctx.summary,
            total_count: ctx.total_count,
            last_event: ctx.t,
            agetime_secs: self.page_trigger_conf.agetime.as_secs(),
            message: msg,
            threshold_count: ctx.threshold_count,
            location: Some(ctx.location),
        });
        self.dispatch(TriggerRequest {
            path: path.clone(),
            argv: Vec::new(),
            env,
            sync: false,
            kind: "page",
        });
    }

    /// Synchronous pre/post-soft wrapper trigger with the page address as
    /// its only positional argument.
    fn run_soft_wrapper(
        &self,
        path: Option<PathBuf>,
        kind: &'static str,
        addr: u64,
        ctx: &ThresholdCtx<'_>,
    ) {
        let Some(path) = path else {
            return;
        };
        let msg = format!("{kind} trigger run for page {addr}");
        self.threshold_message(&self.page_trigger_conf, &msg);
        let env = trigger::env_block(&trigger::ThresholdEnv {
            threshold: ctx.summary,
            total_count: ctx.total_count,
            last_event: ctx.t,
            agetime_secs: self.page_trigger_conf.agetime.as_secs(),
            message: &msg,
            threshold_count: ctx.threshold_count,
            location: Some(ctx.location),
        });
        self.dispatch(TriggerRequest {
            path,
            argv: vec![addr.to_string()],
            env,
            sync: true,
            kind,
        });
    }

    /// Asynchronous trigger for the replacement-rate threshold.
    fn replacement_trigger(&self, t: i64) {
        let summary = self.monitor.bucket.summary(&self.replacement_trigger_conf);
        let msg = format!(
            "Replacements of page correctable error counter exceed threshold {summary}"
        );
        self.threshold_message(&self.replacement_trigger_conf, &msg);
        let Some(path) = &self.replacement_trigger_conf.trigger else {
            return;
        };
        let env = trigger::env_block(&trigger::ThresholdEnv {
            threshold: &summary,
            total_count: self.monitor.count,
            last_event: t,
            agetime_secs: self.replacement_trigger_conf.agetime.as_secs(),
            message: &msg,
            threshold_count: self.monitor.bucket.total_seen(),
            location: None,
        });
        self.dispatch(TriggerRequest {
            path: path.clone(),
            argv: Vec::new(),
            env,
            sync: false,
            kind: "page-error-counter",
        });
    }

    fn dispatch(&self, req: TriggerRequest) {
        let kind = req.kind;
        if let Err(e) = self.spawner.run(req) {
            warn!(kind, error = %e, "trigger dispatch failed");
        }
    }

    /// Write the per-page statistics report: one entry per tracked page in
    /// ascending address order, nothing when the table is empty.
    pub fn dump(&self, out: &mut dyn Write) -> io::Result<()> {
        let mut first = true;
        for (addr, id) in self.index.iter_ascending() {
            if first {
                writeln!(out, "Per page corrected memory statistics:")?;
                first = false;
            }
            let rec = self.pool.record(id);
            debug_assert_eq!(rec.address, addr);
            writeln!(
                out,
                "{addr:x}: total {} seen \"{}\" {}{}",
                rec.ce_count,
                rec.bucket.summary(&self.page_trigger_conf),
                rec.status,
                if rec.triggered { " triggered" } else { "" },
            )?;
            writeln!(out)?;
        }
        debug!(pages = self.index.len(), "dumped page statistics");
        Ok(())
    }
}
