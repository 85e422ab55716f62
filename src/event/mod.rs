use std::fmt;

use serde::Deserialize;

/// Machine-check bank status: error address register is valid.
pub const MCI_STATUS_ADDRV: u64 = 1 << 58;
/// Machine-check bank status: error was not corrected by hardware.
pub const MCI_STATUS_UC: u64 = 1 << 61;

/// 4 KiB physical page geometry.
pub const PAGE_SHIFT: u32 = 12;
pub const PAGE_SIZE: u64 = 1 << PAGE_SHIFT;

/// Align a physical address down to its page boundary.
pub const fn page_align(addr: u64) -> u64 {
    addr & !(PAGE_SIZE - 1)
}

/// CPU model, as far as accounting cares about it.
///
/// Only `SandyBridgeEP` carries special-case behaviour (a duplicate
/// firmware-first report that must be suppressed); the rest exist so the
/// config value round-trips cleanly.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CpuModel {
    #[default]
    Generic,
    SandyBridgeEp,
    IvyBridgeEp,
    HaswellEp,
    BroadwellEp,
    SkylakeServer,
}

impl CpuModel {
    /// Returns the canonical config/log name.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Generic => "generic",
            Self::SandyBridgeEp => "sandy-bridge-ep",
            Self::IvyBridgeEp => "ivy-bridge-ep",
            Self::HaswellEp => "haswell-ep",
            Self::BroadwellEp => "broadwell-ep",
            Self::SkylakeServer => "skylake-server",
        }
    }

    /// Convert from the canonical config name.
    pub fn from_str(name: &str) -> Option<Self> {
        match name {
            "generic" => Some(Self::Generic),
            "sandy-bridge-ep" => Some(Self::SandyBridgeEp),
            "ivy-bridge-ep" => Some(Self::IvyBridgeEp),
            "haswell-ep" => Some(Self::HaswellEp),
            "broadwell-ep" => Some(Self::BroadwellEp),
            "skylake-server" => Some(Self::SkylakeServer),
            _ => None,
        }
    }
}

impl fmt::Display for CpuModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One decoded corrected-memory-error record, as delivered by the ingestion
/// layer. Raw machine-check parsing happens upstream; this is the wire form
/// accepted on the control socket as a JSON line.
#[derive(Debug, Clone, Copy, Deserialize)]
pub struct CeEvent {
    /// Physical address the error was reported at.
    pub addr: u64,
    /// MCi_STATUS bank status word.
    pub status: u64,
    /// Event time, unix seconds.
    #[serde(default)]
    pub time: i64,
    /// Reporting CPU.
    #[serde(default)]
    pub cpu: u32,
    /// Extended CPU id; preferred over `cpu` when non-zero.
    #[serde(default)]
    pub ext_cpu: u32,
    /// Machine-check bank.
    #[serde(default)]
    pub bank: u8,
    /// Memory topology location. Negative channel/dimm mean unknown.
    #[serde(default)]
    pub socket_id: i32,
    #[serde(default = "unknown_slot")]
    pub channel: i32,
    #[serde(default = "unknown_slot")]
    pub dimm: i32,
}

fn unknown_slot() -> i32 {
    -1
}

impl CeEvent {
    /// The CPU id the error is attributed to: `ext_cpu` when non-zero,
    /// otherwise `cpu`.
    pub fn effective_cpu(&self) -> u32 {
        if self.ext_cpu != 0 {
            self.ext_cpu
        } else {
            self.cpu
        }
    }

    /// Whether the record carries a valid error address.
    pub fn addr_valid(&self) -> bool {
        self.status & MCI_STATUS_ADDRV != 0
    }

    /// Whether the error was left uncorrected by hardware.
    pub fn uncorrected(&self) -> bool {
        self.status & MCI_STATUS_UC != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_page_align() {
        assert_eq!(page_align(0x12345), 0x12000);
        assert_eq!(page_align(0x12000), 0x12000);
        assert_eq!(page_align(0xfff), 0);
    }

    #[test]
    fn test_cpu_model_roundtrip() {
        for m in [
            CpuModel::Generic,
            CpuModel::SandyBridgeEp,
            CpuModel::IvyBridgeEp,
            CpuModel::HaswellEp,
            CpuModel::BroadwellEp,
            CpuModel::SkylakeServer,
        ] {
            assert_eq!(CpuModel::from_str(m.as_str()), Some(m));
        }
        assert_eq!(CpuModel::from_str("pentium"), None);
    }

    #[test]
    fn test_effective_cpu_prefers_ext() {
        let mut ev = sample_event();
        ev.cpu = 3;
        ev.ext_cpu = 0;
        assert_eq!(ev.effective_cpu(), 3);
        ev.ext_cpu = 17;
        assert_eq!(ev.effective_cpu(), 17);
    }

    #[test]
    fn test_status_bits() {
        let mut ev = sample_event();
        ev.status = MCI_STATUS_ADDRV;
        assert!(ev.addr_valid());
        assert!(!ev.uncorrected());
        ev.status |= MCI_STATUS_UC;
        assert!(ev.uncorrected());
    }

    #[test]
    fn test_deserialize_json_line() {
        let line = r#"{"addr": 65536, "status": 288230376151711744, "time": 1700000000}"#;
        let ev: CeEvent = serde_json::from_str(line).expect("valid event");
        assert_eq!(ev.addr, 0x10000);
        assert!(ev.addr_valid());
        assert_eq!(ev.channel, -1);
        assert_eq!(ev.dimm, -1);
    }

    fn sample_event() -> CeEvent {
        CeEvent {
            addr: 0x10000,
            status: MCI_STATUS_ADDRV,
            time: 0,
            cpu: 0,
            ext_cpu: 0,
            bank: 0,
            socket_id: 0,
            channel: -1,
            dimm: -1,
        }
    }
}
