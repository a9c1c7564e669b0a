//! # Resource limits
//!
//! The pipeline locks memory for every cloned program and holds four fds
//! per selected function; both limits are raised before the load phase.

use anyhow::Result;
use nix::sys::resource::{setrlimit, Resource, RLIM_INFINITY};

use crate::Error;

pub(super) const DEFAULT_NOFILE: u64 = 300_000;

/// Let the BPF subsystem lock as much memory as it needs.
pub(super) fn bump_memlock() -> Result<()> {
    setrlimit(Resource::RLIMIT_MEMLOCK, RLIM_INFINITY, RLIM_INFINITY)
        .map_err(|e| Error::Resource(format!("can't raise RLIMIT_MEMLOCK: {e}")).into())
}

/// Allow holding program and link fds for thousands of attach points.
pub(super) fn bump_nofile(limit: u64) -> Result<()> {
    setrlimit(Resource::RLIMIT_NOFILE, limit, limit)
        .map_err(|e| Error::Resource(format!("can't raise RLIMIT_NOFILE to {limit}: {e}")).into())
}
