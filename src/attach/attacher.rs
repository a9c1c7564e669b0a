//! # Attacher
//!
//! Orchestrates the pipeline: prepare (limits, oracles, BTF walk,
//! selection), load (prototype capture and per-function cloning), attach
//! (one raw-tracepoint handle per clone) and activate (flip the shared
//! flag). The attacher owns every intermediate resource; dropping it
//! tears the pipeline down.

use anyhow::Result;
use log::{debug, info, warn};

use super::options::AttachOpts;
use super::rlimit;
use super::select::{select_funcs, FuncInfo};
use super::skel::{ProbeKind, ProtoSkel, ProtoSlot, ARITY_SLOTS};
use crate::glob::Glob;
use crate::kernel::btf::{FuncTypes, KernelBtf};
use crate::kernel::ftrace::KprobeSet;
use crate::kernel::symbols::KsymTable;
use crate::Error;

/// Functions that must never be traced, whatever the caller configures:
/// recursion protection for the probe side, trampoline internals, and
/// long-sleeping syscalls the fexit trampoline faults on (kernels without
/// e21aa341785c "bpf: Fix fexit trampoline.").
const ENFORCED_DENY_GLOBS: &[&str] = &[
    // Used by the probes themselves for recursion protection.
    "bpf_get_smp_processor_id",
    // Low-level delicate functions.
    "migrate_enable",
    "migrate_disable",
    "rcu_read_lock*",
    "rcu_read_unlock*",
    "__bpf_prog_enter*",
    "__bpf_prog_exit*",
    // Long-sleeping syscalls.
    "*_sys_select",
    "*_sys_epoll_wait",
    "*_sys_ppoll",
];

/// One-shot builder attaching a fentry/fexit program pair to every kernel
/// function surviving selection.
pub struct Attacher {
    skel: Box<dyn ProtoSkel>,
    opts: AttachOpts,

    ksyms: Option<KsymTable>,
    kprobes: Option<KprobeSet>,
    types: Option<Box<dyn FuncTypes>>,

    allow_globs: Vec<Glob>,
    deny_globs: Vec<Glob>,

    funcs: Vec<FuncInfo>,
    slots: [ProtoSlot; ARITY_SLOTS],
}

impl Attacher {
    /// Build an attacher over an unloaded prototype set. The enforced deny
    /// globs are installed here and cannot be removed.
    pub fn new(skel: Box<dyn ProtoSkel>, mut opts: AttachOpts) -> Result<Attacher> {
        if opts.debug {
            opts.verbose = true;
        }

        let mut att = Attacher {
            skel,
            opts,
            ksyms: None,
            kprobes: None,
            types: None,
            allow_globs: Vec::new(),
            deny_globs: Vec::new(),
            funcs: Vec::new(),
            slots: Default::default(),
        };

        for glob in ENFORCED_DENY_GLOBS {
            att.deny_glob(glob)?;
        }

        Ok(att)
    }

    /// Add an allow glob. Once at least one is configured, only functions
    /// matching one of them are selected. Invalid patterns fail without
    /// committing state.
    pub fn allow_glob(&mut self, pattern: &str) -> Result<()> {
        self.allow_globs.push(Glob::new(pattern)?);
        Ok(())
    }

    /// Exclude functions matching `pattern` from selection.
    pub fn deny_glob(&mut self, pattern: &str) -> Result<()> {
        self.deny_globs.push(Glob::new(pattern)?);
        Ok(())
    }

    /// Raise process limits, parse the kernel tables and build the
    /// attachment plan.
    pub fn prepare(&mut self) -> Result<()> {
        let ksyms = KsymTable::load()?;

        // The BPF subsystem locks memory for every program and map.
        rlimit::bump_memlock()?;

        // Two program and two link fds per selected function.
        let nofile = match self.opts.max_fileno_rlimit {
            0 => rlimit::DEFAULT_NOFILE,
            n => n,
        };
        rlimit::bump_nofile(nofile)?;

        let kprobes = KprobeSet::load()?;
        if self.opts.verbose {
            info!("discovered {} available kprobes", kprobes.len());
        }

        let types = KernelBtf::load()?;
        self.prepare_with(ksyms, kprobes, Box::new(types))
    }

    /// Prepare against caller-provided tables. Split out of [`Self::prepare`]
    /// so the pipeline can run over synthetic universes.
    pub(crate) fn prepare_with(
        &mut self,
        ksyms: KsymTable,
        kprobes: KprobeSet,
        types: Box<dyn FuncTypes>,
    ) -> Result<()> {
        let sel = select_funcs(
            types.as_ref(),
            &ksyms,
            &kprobes,
            &mut self.deny_globs,
            &mut self.allow_globs,
            &self.opts,
        )?;

        // Each arity with consumers gets its prototype pair pointed at a
        // valid concrete target; prototypes nobody will clone must not
        // load.
        for arity in 0..ARITY_SLOTS {
            match sel.template_by_arity[arity] {
                Some(template) => {
                    let name = sel.funcs[template].name.as_str();
                    self.skel.set_attach_target(ProbeKind::Fentry, arity, name)?;
                    self.skel.set_attach_target(ProbeKind::Fexit, arity, name)?;

                    if self.opts.debug {
                        debug!(
                            "found {} functions with {} arguments",
                            sel.cnt_by_arity[arity], arity
                        );
                    }
                }
                None => {
                    self.skel.disable_autoload(ProbeKind::Fentry, arity)?;
                    self.skel.disable_autoload(ProbeKind::Fexit, arity)?;
                }
            }
        }

        self.skel.resize_ip_map(sel.funcs.len() as u32)?;

        if self.opts.verbose {
            info!("found {} attachable functions in total", sel.funcs.len());
            info!("skipped {} functions in total", sel.skipped);
        }
        if self.opts.debug {
            for glob in self.deny_globs.iter() {
                debug!(
                    "deny glob '{}' matched {} functions",
                    glob.pattern(),
                    glob.match_count()
                );
            }
            for glob in self.allow_globs.iter() {
                debug!(
                    "allow glob '{}' matched {} functions",
                    glob.pattern(),
                    glob.match_count()
                );
            }
        }

        self.funcs = sel.funcs;
        self.ksyms = Some(ksyms);
        self.kprobes = Some(kprobes);
        self.types = Some(types);

        Ok(())
    }

    /// Capture the prototype instruction streams and submit one retargeted
    /// clone per selected function and direction.
    pub fn load(&mut self) -> Result<()> {
        let slots = &mut self.slots;
        self.skel.load(self.opts.debug, &mut |kind, arity, insns| {
            slots[arity].set(kind, insns);
        })?;

        if self.opts.debug {
            debug!("preparing {} BPF program copies", self.funcs.len() * 2);
        }

        for (i, fi) in self.funcs.iter_mut().enumerate() {
            self.skel.map_ip(fi.addr, i as u32).map_err(|e| {
                e.context(format!(
                    "failed to add {:#x} -> '{}' lookup entry",
                    fi.addr, fi.name
                ))
            })?;

            fi.fentry_fd = self
                .skel
                .clone_prog(
                    ProbeKind::Fentry,
                    fi.arg_cnt,
                    self.slots[fi.arg_cnt].get(ProbeKind::Fentry),
                    fi.btf_id,
                )
                .map_err(|e| e.context(format!("failed to clone fentry program for '{}'", fi.name)))?;

            fi.fexit_fd = self
                .skel
                .clone_prog(
                    ProbeKind::Fexit,
                    fi.arg_cnt,
                    self.slots[fi.arg_cnt].get(ProbeKind::Fexit),
                    fi.btf_id,
                )
                .map_err(|e| e.context(format!("failed to clone fexit program for '{}'", fi.name)))?;
        }

        Ok(())
    }

    /// Attach every clone. A per-function failure is logged and skipped,
    /// because the kernel function set can drift between prepare and
    /// attach; only attaching nothing at all is an error.
    pub fn attach(&mut self) -> Result<()> {
        let mut attached = 0;

        for (i, fi) in self.funcs.iter().enumerate() {
            if self.opts.debug {
                debug!("attaching function '{}' (#{} at {:#x})", fi.name, i + 1, fi.addr);
            }

            match self.skel.attach_prog(fi.fentry_fd) {
                Ok(()) => attached += 1,
                Err(e) => warn!(
                    "failed to attach fentry prog (fd {}) for function '{}', skipping: {e}",
                    fi.fentry_fd, fi.name
                ),
            }
            match self.skel.attach_prog(fi.fexit_fd) {
                Ok(()) => attached += 1,
                Err(e) => warn!(
                    "failed to attach fexit prog (fd {}) for function '{}', skipping: {e}",
                    fi.fexit_fd, fi.name
                ),
            }
        }

        if attached == 0 && !self.funcs.is_empty() {
            return Err(Error::Kernel("no program could be attached".to_string()).into());
        }

        if self.opts.verbose {
            info!("attached {attached} of {} BPF programs", self.funcs.len() * 2);
        }

        Ok(())
    }

    /// Let the probes start acting. They read the flag on entry and treat
    /// everything before this point as a no-op.
    pub fn activate(&mut self) -> Result<()> {
        self.skel.set_ready(true)
    }

    /// Number of selected functions.
    pub fn func_count(&self) -> usize {
        self.funcs.len()
    }

    /// Borrow the `i`-th selected function, in selection order.
    pub fn func(&self, i: usize) -> Option<&FuncInfo> {
        self.funcs.get(i)
    }

    /// The function-type universe, available after prepare.
    pub fn btf(&self) -> Option<&dyn FuncTypes> {
        self.types.as_deref()
    }

    /// The kernel symbol table, available after prepare.
    pub fn ksyms(&self) -> Option<&KsymTable> {
        self.ksyms.as_ref()
    }

    /// The attachable-kprobe oracle, available after prepare.
    pub fn kprobes(&self) -> Option<&KprobeSet> {
        self.kprobes.as_ref()
    }

    /// The underlying prototype skeleton.
    pub fn skel(&self) -> &dyn ProtoSkel {
        self.skel.as_ref()
    }

    pub fn skel_mut(&mut self) -> &mut dyn ProtoSkel {
        self.skel.as_mut()
    }
}

impl Drop for Attacher {
    fn drop(&mut self) {
        // Quiesce the probes; buffers, tables and the skeleton are
        // released by their own drops.
        let _ = self.skel.set_ready(false);
    }
}
