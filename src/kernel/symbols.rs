//! # Kernel symbols
//!
//! Name <-> address relationship of the running kernel's function symbols,
//! parsed from /proc/kallsyms. The table answers both directions: the
//! selection walk resolves names to addresses, consumers resolve captured
//! instruction pointers back to names.

use std::path::Path;

use anyhow::{anyhow, bail, Result};
use bimap::BiHashMap;

use super::read_table;

pub(crate) const KALLSYMS: &str = "/proc/kallsyms";

/// Function symbols of the running kernel.
pub struct KsymTable {
    /// Symbols bi-directional map (addr<>name).
    syms: BiHashMap<u64, String>,
}

impl KsymTable {
    /// Load and parse /proc/kallsyms.
    pub fn load() -> Result<KsymTable> {
        Self::from_file(KALLSYMS)
    }

    /// Load and parse a kallsyms-formatted file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<KsymTable> {
        Self::parse(&read_table(path)?)
    }

    /// Parse kallsyms-formatted content. Only function symbols (types `t`,
    /// `T`, `w` and `W`) are retained.
    pub fn parse(content: &str) -> Result<KsymTable> {
        let mut syms = BiHashMap::new();

        for line in content.lines() {
            let data: Vec<&str> = line.split(' ').collect();
            if data.len() < 3 {
                bail!("Invalid kallsyms line: {}", line);
            }

            if !matches!(data[1], "t" | "T" | "w" | "W") {
                continue;
            }

            let symbol: &str = data[2]
                .split('\t')
                .next()
                .ok_or_else(|| anyhow!("Couldn't get symbol name for {}", data[0]))?;

            syms.insert(u64::from_str_radix(data[0], 16)?, String::from(symbol));
        }

        Ok(KsymTable { syms })
    }

    /// Return a symbol address given its name, if a relationship is found.
    pub fn addr(&self, name: &str) -> Option<u64> {
        self.syms.get_by_right(name).copied()
    }

    /// Return a symbol name given its address, if a relationship is found.
    pub fn name(&self, addr: u64) -> Option<&str> {
        self.syms.get_by_left(&addr).map(|s| s.as_str())
    }

    /// Number of function symbols in the table.
    pub fn len(&self) -> usize {
        self.syms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.syms.is_empty()
    }
}
