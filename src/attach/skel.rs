//! # Prototype skeleton
//!
//! Seam between the attacher and the BPF tracing runtime. The runtime owns
//! the prototype program set (one fentry and one fexit per argument
//! count), the shared `ip_to_id` map and the activation flag; the attacher
//! drives it through this trait, which also lets the pipeline run without
//! a kernel.

use std::fmt;
use std::os::unix::io::RawFd;

use anyhow::Result;
use libbpf_sys::bpf_insn;

use crate::MAX_FUNC_ARG_CNT;

/// One prototype slot per argument count.
pub(crate) const ARITY_SLOTS: usize = MAX_FUNC_ARG_CNT + 1;

/// Direction of a tracing probe.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ProbeKind {
    /// Runs at function entry.
    Fentry,
    /// Runs at function exit.
    Fexit,
}

impl fmt::Display for ProbeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProbeKind::Fentry => write!(f, "fentry"),
            ProbeKind::Fexit => write!(f, "fexit"),
        }
    }
}

/// Captured instruction streams for one argument count, filled while the
/// prototype set is loaded and cloned once per selected function with that
/// count.
#[derive(Default)]
pub(crate) struct ProtoSlot {
    pub(crate) fentry_insns: Vec<bpf_insn>,
    pub(crate) fexit_insns: Vec<bpf_insn>,
}

impl ProtoSlot {
    pub(crate) fn set(&mut self, kind: ProbeKind, insns: Vec<bpf_insn>) {
        match kind {
            ProbeKind::Fentry => self.fentry_insns = insns,
            ProbeKind::Fexit => self.fexit_insns = insns,
        }
    }

    pub(crate) fn get(&self, kind: ProbeKind) -> &[bpf_insn] {
        match kind {
            ProbeKind::Fentry => &self.fentry_insns,
            ProbeKind::Fexit => &self.fexit_insns,
        }
    }
}

/// Interface to the tracing runtime holding the prototype program set.
///
/// All calls are made from the thread owning the attacher; `load` must not
/// be entered twice.
pub trait ProtoSkel {
    /// Point the prototype for `(kind, arity)` at a concrete attach target
    /// before load. The verifier demands one even though every clone
    /// retargets.
    fn set_attach_target(&mut self, kind: ProbeKind, arity: usize, func_name: &str)
        -> Result<()>;

    /// Keep the prototype for `(kind, arity)` out of the kernel load.
    fn disable_autoload(&mut self, kind: ProbeKind, arity: usize) -> Result<()>;

    /// Size the shared instruction-pointer lookup map, before load.
    fn resize_ip_map(&mut self, entries: u32) -> Result<()>;

    /// Run the loader over the prototype set. For every prototype still
    /// enabled, `capture` receives the relocated instruction stream the
    /// loader produced for it. With `debug` set, verifier diagnostics are
    /// surfaced for each prototype load.
    fn load(
        &mut self,
        debug: bool,
        capture: &mut dyn FnMut(ProbeKind, usize, Vec<bpf_insn>),
    ) -> Result<()>;

    /// Submit a copy of the prototype for `(kind, arity)` to the kernel,
    /// bound to `attach_btf_id`. Returns the new program's fd.
    fn clone_prog(
        &mut self,
        kind: ProbeKind,
        arity: usize,
        insns: &[bpf_insn],
        attach_btf_id: u32,
    ) -> Result<RawFd>;

    /// Open a raw-tracepoint style attachment on a cloned program. The
    /// handle is owned by the skeleton.
    fn attach_prog(&mut self, prog_fd: RawFd) -> Result<()>;

    /// Insert an `addr -> index` entry into the shared lookup map.
    fn map_ip(&mut self, addr: u64, index: u32) -> Result<()>;

    /// Flip the activation flag shared with the probe programs.
    fn set_ready(&mut self, on: bool) -> Result<()>;
}
