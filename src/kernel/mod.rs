//! # Kernel
//!
//! Read-side interfaces to the running kernel: the symbol table, the set
//! of functions the tracing subsystem accepts probes on, and the
//! function-type universe drawn from BTF.

use std::{fs, io, path::Path};

use anyhow::Result;

use crate::Error;

pub mod btf;
pub mod ftrace;
pub mod symbols;

/// Read a kernel-provided table, classifying a missing file distinctly
/// from other i/o failures.
pub(crate) fn read_table<P: AsRef<Path>>(path: P) -> Result<String> {
    let path = path.as_ref();

    fs::read_to_string(path).map_err(|e| classify_io(e, path))
}

/// Binary variant of [`read_table`], for tables that aren't text.
pub(crate) fn read_table_raw<P: AsRef<Path>>(path: P) -> Result<Vec<u8>> {
    let path = path.as_ref();

    fs::read(path).map_err(|e| classify_io(e, path))
}

fn classify_io(e: io::Error, path: &Path) -> anyhow::Error {
    let err = match e.kind() {
        io::ErrorKind::NotFound => Error::NotFound(path.display().to_string()),
        _ => Error::Io(e),
    };
    err.into()
}
