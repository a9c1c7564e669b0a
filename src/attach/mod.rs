//! # Attach
//!
//! The attachment pipeline: selection of target functions, prototype
//! instruction capture, per-function program cloning and attachment.

mod attacher;
mod bpf;
mod options;
mod rlimit;
mod select;
mod skel;

pub use attacher::Attacher;
pub use bpf::BpfSkel;
pub use options::{AttachOpts, FuncFilter};
pub use select::FuncInfo;
pub use skel::{ProbeKind, ProtoSkel};
