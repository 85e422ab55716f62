use std::fmt;
use std::fs::OpenOptions;
use std::io::{self, Write};

use tracing::warn;

use crate::event::PAGE_SIZE;

/// Kernel control files for page offlining.
pub const SOFT_OFFLINE_PATH: &str = "/sys/devices/system/memory/soft_offline_page";
pub const HARD_OFFLINE_PATH: &str = "/sys/devices/system/memory/hard_offline_page";

/// Page offlining policy. Variant order matters: everything above `Account`
/// needs a writable kernel interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum OfflineMode {
    #[default]
    Off,
    /// Track counters and fire triggers, never touch the kernel.
    Account,
    Soft,
    Hard,
    SoftThenHard,
}

impl OfflineMode {
    /// Returns the canonical config name.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Off => "off",
            Self::Account => "account",
            Self::Soft => "soft",
            Self::Hard => "hard",
            Self::SoftThenHard => "soft-then-hard",
        }
    }

    /// Convert from the canonical config name.
    pub fn from_str(name: &str) -> Option<Self> {
        match name {
            "off" => Some(Self::Off),
            "account" => Some(Self::Account),
            "soft" => Some(Self::Soft),
            "hard" => Some(Self::Hard),
            "soft-then-hard" => Some(Self::SoftThenHard),
            _ => None,
        }
    }

    /// The kernel control file this mode writes first, if any.
    pub const fn kernel_path(self) -> Option<&'static str> {
        match self {
            Self::Soft | Self::SoftThenHard => Some(SOFT_OFFLINE_PATH),
            Self::Hard => Some(HARD_OFFLINE_PATH),
            Self::Off | Self::Account => None,
        }
    }
}

impl fmt::Display for OfflineMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failed offline attempt, carrying the kernel path and OS error.
#[derive(Debug, thiserror::Error)]
#[error("writing {addr:#x} to {path}: {source}")]
pub struct OfflineError {
    pub path: &'static str,
    pub addr: u64,
    #[source]
    pub source: io::Error,
}

/// Write access to kernel sysfs control files. Abstract so tests can observe
/// writes and inject failures.
pub trait SysfsWriter: Send {
    fn write(&self, path: &'static str, value: &str) -> io::Result<()>;
    fn writable(&self, path: &'static str) -> bool;
}

/// The real sysfs interface.
pub struct KernelSysfs;

impl SysfsWriter for KernelSysfs {
    fn write(&self, path: &'static str, value: &str) -> io::Result<()> {
        let mut f = OpenOptions::new().write(true).open(path)?;
        f.write_all(value.as_bytes())
    }

    fn writable(&self, path: &'static str) -> bool {
        OpenOptions::new().write(true).open(path).is_ok()
    }
}

/// Maps offline-mode policy to kernel sysfs writes.
pub struct Offliner {
    mode: OfflineMode,
    /// Neighbour pages to offline on each side of the target.
    row_pages: u32,
    sysfs: Box<dyn SysfsWriter>,
}

impl Offliner {
    /// Build the offliner, demoting any mode above `Account` to `Account`
    /// when its kernel interface is not writable.
    pub fn new(requested: OfflineMode, row_pages: u32, sysfs: Box<dyn SysfsWriter>) -> Self {
        let mode = match requested.kernel_path() {
            Some(path) if !sysfs.writable(path) => {
                warn!(requested = %requested, "kernel does not support page offline interface");
                OfflineMode::Account
            }
            _ => requested,
        };
        Self {
            mode,
            row_pages,
            sysfs,
        }
    }

    /// The effective mode after any setup demotion.
    pub fn mode(&self) -> OfflineMode {
        self.mode
    }

    fn write_page(&self, path: &'static str, addr: u64) -> Result<(), OfflineError> {
        self.sysfs
            .write(path, &format!("{addr:#x}"))
            .map_err(|source| OfflineError { path, addr, source })
    }

    /// Offline the target page per the effective mode. `Off` and `Account`
    /// are no-ops.
    pub fn offline(&self, addr: u64) -> Result<(), OfflineError> {
        match self.mode {
            OfflineMode::Off | OfflineMode::Account => Ok(()),
            OfflineMode::SoftThenHard => match self.write_page(SOFT_OFFLINE_PATH, addr) {
                Ok(()) => Ok(()),
                Err(e) => {
                    warn!("soft offlining of page {addr:#x} failed, trying hard offlining: {e}");
                    self.write_page(HARD_OFFLINE_PATH, addr)
                }
            },
            OfflineMode::Soft => self.offline_row(SOFT_OFFLINE_PATH, addr),
            OfflineMode::Hard => self.offline_row(HARD_OFFLINE_PATH, addr),
        }
    }

    /// Offline the target page plus `row_pages` consecutive neighbours on
    /// each side. Every page in the row is attempted; the first failure is
    /// surfaced after the rest have been tried.
    fn offline_row(&self, path: &'static str, addr: u64) -> Result<(), OfflineError> {
        let mut first_err = self.write_page(path, addr).err();
        for i in 1..=u64::from(self.row_pages) {
            if let Some(above) = addr.checked_add(i * PAGE_SIZE) {
                if let Err(e) = self.write_page(path, above) {
                    warn!("offlining neighbour page {above:#x} failed: {e}");
                    first_err.get_or_insert(e);
                }
            }
            if let Some(below) = addr.checked_sub(i * PAGE_SIZE) {
                if let Err(e) = self.write_page(path, below) {
                    warn!("offlining neighbour page {below:#x} failed: {e}");
                    first_err.get_or_insert(e);
                }
            }
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}
