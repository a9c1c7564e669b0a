//! # Options
//!
//! Knobs of the attachment pipeline, fixed at construction time.

use crate::kernel::btf::FuncTypes;

/// Caller-supplied predicate, the last gate of the selection pipeline.
/// Receives the function-type universe, the candidate's BTF id and name,
/// and the index the function would be selected at.
pub type FuncFilter = Box<dyn Fn(&dyn FuncTypes, u32, &str, usize) -> bool>;

/// Attachment options.
#[derive(Default)]
pub struct AttachOpts {
    /// Hard cap on the number of selected functions. 0 means unlimited.
    pub max_func_cnt: usize,
    /// Target open-file limit; each selected function costs two program
    /// and two link fds. 0 selects the 300000 default.
    pub max_fileno_rlimit: u64,
    /// Report selection and attachment summaries.
    pub verbose: bool,
    /// Report per-class diagnostics. Also surfaces verifier logs when the
    /// prototype programs are loaded. Implies `verbose`.
    pub debug: bool,
    /// Report per-candidate selection decisions.
    pub debug_extra: bool,
    /// Last gate of the selection pipeline.
    pub func_filter: Option<FuncFilter>,
}
