//! # probefan
//!
//! Mass fentry/fexit attachment over the running kernel's function
//! universe. The crate walks kernel BTF, narrows the function set through
//! allow/deny globs and attachability oracles, then clones a pre-compiled
//! prototype tracing program pair per surviving function, each copy bound
//! to its own target's BTF id.
//!
//! The pipeline is a one-shot builder: configure, then [`Attacher::prepare`],
//! [`Attacher::load`], [`Attacher::attach`] and [`Attacher::activate`], then
//! hand control to whatever consumes the per-function event stream.

pub mod attach;
mod error;
pub mod glob;
pub mod kernel;

pub use attach::{AttachOpts, Attacher, BpfSkel, FuncFilter, FuncInfo, ProbeKind, ProtoSkel};
pub use error::Error;
pub use glob::Glob;
pub use kernel::btf::{ArgKind, FuncSig, FuncTypes, KernelBtf, RetKind};

/// Highest argument count the attach mechanism supports. One prototype
/// program pair exists per count, from zero up to this value.
pub const MAX_FUNC_ARG_CNT: usize = 11;
