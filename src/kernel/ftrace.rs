//! # Traceable functions
//!
//! The set of kernel functions the tracing subsystem accepts probes on,
//! parsed from /sys/kernel/tracing/available_filter_functions. A function
//! missing from this set cannot be attached to, whatever BTF says.

use std::path::Path;

use anyhow::Result;

use super::read_table;

pub(crate) const AVAILABLE_FILTER_FUNCTIONS: &str =
    "/sys/kernel/tracing/available_filter_functions";

/// Sorted set of attachable function names.
pub struct KprobeSet {
    names: Vec<String>,
}

impl KprobeSet {
    /// Load and parse the tracing subsystem's filter-function list.
    pub fn load() -> Result<KprobeSet> {
        Self::from_file(AVAILABLE_FILTER_FUNCTIONS)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<KprobeSet> {
        Ok(Self::parse(&read_table(path)?))
    }

    /// Parse filter-function content. Each line's first whitespace-delimited
    /// token is the name; trailing tokens (module annotations) are ignored,
    /// so modular symbols sharing a base name collapse to one entry.
    pub fn parse(content: &str) -> KprobeSet {
        let mut names: Vec<String> = content
            .lines()
            .filter_map(|line| line.split_whitespace().next())
            .map(String::from)
            .collect();

        names.sort_unstable();
        names.dedup();

        KprobeSet { names }
    }

    /// Whether the tracing subsystem can attach to `name`. O(log n).
    pub fn contains(&self, name: &str) -> bool {
        self.names
            .binary_search_by(|probe| probe.as_str().cmp(name))
            .is_ok()
    }

    /// Number of attachable functions.
    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}
