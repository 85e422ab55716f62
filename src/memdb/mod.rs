use std::collections::HashSet;

/// Identity of one DIMM slot. Negative channel/dimm values mean the decoder
/// could not attribute the error to a slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DimmKey {
    pub socket: i32,
    pub channel: i32,
    pub dimm: i32,
}

impl DimmKey {
    /// Location string attached to outgoing trigger messages.
    pub fn location(&self) -> String {
        let mut out = format!("SOCKET:{} ", self.socket);
        match self.channel {
            c if c < 0 => out.push_str("CHANNEL:? "),
            c => {
                out.push_str("CHANNEL:");
                out.push_str(&c.to_string());
                out.push(' ');
            }
        }
        match self.dimm {
            d if d < 0 => out.push_str("DIMM:?"),
            d => {
                out.push_str("DIMM:");
                out.push_str(&d.to_string());
            }
        }
        out
    }
}

/// In-memory map of DIMM handles, created on first reference.
///
/// The topology database proper lives outside this daemon; this map only
/// interns the locations seen in events so messages can name them.
#[derive(Debug, Default)]
pub struct DimmDb {
    dimms: HashSet<DimmKey>,
}

impl DimmDb {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up the handle for `(socket, channel, dimm)`, creating it on
    /// first sight.
    pub fn get_or_create(&mut self, socket: i32, channel: i32, dimm: i32) -> DimmKey {
        let key = DimmKey {
            socket,
            channel,
            dimm,
        };
        self.dimms.insert(key);
        key
    }

    /// Number of distinct locations seen.
    pub fn len(&self) -> usize {
        self.dimms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dimms.is_empty()
    }
}
