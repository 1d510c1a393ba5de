//! Filesystem event model shared by the watch engine and every subscriber.
//!
//! Event names are always relative to the watched root and `/`-separated;
//! the watch engine normalizes them before fan-out so consumers never trim
//! prefixes themselves.

use std::fmt;

use bitflags::bitflags;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Name carried by the synthetic terminal event broadcast on shutdown.
pub const EXIT_NAME: &str = "exit";

/// Substrings marking editor swap and temporary files.
const SWAP_MARKERS: [&str; 3] = [".swp", ".swx", ".goutputstream"];

/// Suffix of editor backup files and of in-flight downloads.
const BACKUP_SUFFIX: char = '~';

bitflags! {
    /// Set of operations carried by one [`Event`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Op: u32 {
        const CREATE = 1 << 0;
        const WRITE = 1 << 1;
        const REMOVE = 1 << 2;
        const RENAME = 1 << 3;
        const CHMOD = 1 << 4;
        /// Synthetic terminal marker; never produced by the OS.
        const EXIT = 1 << 5;
    }
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let labels = [
            (Op::EXIT, "EXIT_DAEMON"),
            (Op::CREATE, "CREATE"),
            (Op::REMOVE, "REMOVE"),
            (Op::WRITE, "WRITE"),
            (Op::RENAME, "RENAME"),
            (Op::CHMOD, "CHMOD"),
        ];
        let active: Vec<&str> = labels
            .iter()
            .filter(|(flag, _)| self.contains(*flag))
            .map(|(_, label)| *label)
            .collect();
        if active.is_empty() {
            return f.write_str("[no events]");
        }
        f.write_str(&active.join("|"))
    }
}

// Ops travel as their raw bitmask on the wire.
impl Serialize for Op {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u32(self.bits())
    }
}

impl<'de> Deserialize<'de> for Op {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        u32::deserialize(deserializer).map(Op::from_bits_retain)
    }
}

/// One filesystem change: a root-relative path plus the operations observed.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Event {
    pub name: String,
    pub op: Op,
}

impl Event {
    pub fn new(name: impl Into<String>, op: Op) -> Self {
        Self {
            name: name.into(),
            op,
        }
    }

    /// The terminal event every subscriber receives exactly once on shutdown.
    pub fn exit() -> Self {
        Self::new(EXIT_NAME, Op::EXIT)
    }

    pub fn is_exit(&self) -> bool {
        self.op.contains(Op::EXIT)
    }

    /// Editor swap/backup files and permission-only changes carry nothing
    /// worth mirroring.
    pub fn is_noise(&self) -> bool {
        SWAP_MARKERS.iter().any(|marker| self.name.contains(marker))
            || self.name.ends_with(BACKUP_SUFFIX)
            || self.op == Op::CHMOD
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:<13} {:?}", self.op.to_string(), self.name)
    }
}
