//! # Selection
//!
//! Walk of the kernel function universe. Candidates are pulled from BTF in
//! id order and run through the gates: symbol resolution, deny globs,
//! allow globs, the kprobe oracle, signature admissibility, the selection
//! cap and the caller's filter. Survivors form the attachment plan.

use std::os::unix::io::RawFd;

use anyhow::Result;
use log::{debug, info, trace};

use super::options::AttachOpts;
use super::skel::ARITY_SLOTS;
use crate::glob::Glob;
use crate::kernel::btf::FuncTypes;
use crate::kernel::ftrace::KprobeSet;
use crate::kernel::symbols::KsymTable;
use crate::Error;

/// One selected kernel function.
#[derive(Clone, Debug)]
pub struct FuncInfo {
    /// Kernel virtual address of the function.
    pub addr: u64,
    /// Function name, as found in kallsyms.
    pub name: String,
    /// Id of the function's `FUNC` entry in kernel BTF.
    pub btf_id: u32,
    /// Number of parameters, at most [`crate::MAX_FUNC_ARG_CNT`].
    pub arg_cnt: usize,
    /// Fd of the fentry clone, set during load. -1 before.
    pub fentry_fd: RawFd,
    /// Fd of the fexit clone, set during load. -1 before.
    pub fexit_fd: RawFd,
}

/// Attachment plan produced by the selection walk.
pub(super) struct Selection {
    pub(super) funcs: Vec<FuncInfo>,
    /// Selected function count per argument count.
    pub(super) cnt_by_arity: [usize; ARITY_SLOTS],
    /// Index of the first selected function at each argument count, used
    /// as the prototype attach-target template.
    pub(super) template_by_arity: [Option<usize>; ARITY_SLOTS],
    /// Candidates dismissed by one of the gates.
    pub(super) skipped: usize,
}

pub(super) fn select_funcs(
    types: &dyn FuncTypes,
    ksyms: &KsymTable,
    kprobes: &KprobeSet,
    deny: &mut [Glob],
    allow: &mut [Glob],
    opts: &AttachOpts,
) -> Result<Selection> {
    let mut sel = Selection {
        funcs: Vec::new(),
        cnt_by_arity: [0; ARITY_SLOTS],
        template_by_arity: [None; ARITY_SLOTS],
        skipped: 0,
    };

    'walk: for (btf_id, name) in types.funcs() {
        let Some(addr) = ksyms.addr(&name) else {
            if opts.debug_extra {
                trace!("function '{name}' not found in kallsyms, skipping");
            }
            sel.skipped += 1;
            continue;
        };

        // Any matching deny glob forces a skip.
        let mut denied = false;
        for glob in deny.iter_mut() {
            if glob.matches(&name) {
                glob.hit();
                if opts.debug_extra {
                    trace!("function '{name}' is denied by '{}' glob", glob.pattern());
                }
                denied = true;
                break;
            }
        }
        if denied {
            sel.skipped += 1;
            continue;
        }

        // With allow globs configured, the function has to match one.
        if !allow.is_empty() {
            let mut allowed = false;
            for glob in allow.iter_mut() {
                if glob.matches(&name) {
                    glob.hit();
                    if opts.debug_extra {
                        trace!("function '{name}' is allowed by '{}' glob", glob.pattern());
                    }
                    allowed = true;
                    break;
                }
            }
            if !allowed {
                if opts.debug_extra {
                    trace!("function '{name}' doesn't match any allow glob, skipping");
                }
                sel.skipped += 1;
                continue;
            }
        }

        if !kprobes.contains(&name) {
            if opts.debug_extra {
                trace!("function '{name}' is not an attachable kprobe, skipping");
            }
            sel.skipped += 1;
            continue;
        }

        let sig = match types.sig(btf_id) {
            Ok(sig) => sig,
            Err(e) => {
                if opts.debug {
                    debug!("can't resolve prototype of '{name}': {e}, skipping");
                }
                sel.skipped += 1;
                continue;
            }
        };
        if !sig.attach_compatible() {
            if opts.debug {
                debug!("function '{name}' has a prototype incompatible with fentry/fexit, skipping");
            }
            sel.skipped += 1;
            continue;
        }

        if opts.max_func_cnt > 0 && sel.funcs.len() >= opts.max_func_cnt {
            if opts.verbose {
                info!(
                    "maximum allowed number of functions ({}) reached, skipping the rest",
                    opts.max_func_cnt
                );
            }
            break 'walk;
        }

        if let Some(filter) = opts.func_filter.as_ref() {
            if !filter(types, btf_id, &name, sel.funcs.len()) {
                if opts.debug {
                    debug!("function '{name}' skipped by the custom filter");
                }
                sel.skipped += 1;
                continue;
            }
        }

        let arg_cnt = sig.arg_cnt();
        sel.cnt_by_arity[arg_cnt] += 1;
        if sel.template_by_arity[arg_cnt].is_none() {
            sel.template_by_arity[arg_cnt] = Some(sel.funcs.len());
        }

        if opts.debug_extra {
            trace!("found function '{name}' at address {addr:#x}");
        }
        sel.funcs.push(FuncInfo {
            addr,
            name,
            btf_id,
            arg_cnt,
            fentry_fd: -1,
            fexit_fd: -1,
        });
    }

    if sel.funcs.is_empty() {
        return Err(Error::NotFound("no matching functions".to_string()).into());
    }

    Ok(sel)
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::kernel::btf::testing::{int_sig, void_sig, FakeTypes};
    use crate::kernel::btf::{ArgKind, FuncSig, RetKind};

    const KALLSYMS_SAMPLE: &str = "\
ffffffff81000000 T sys_open
ffffffff81000010 T sys_close
ffffffff81000020 T vfs_read
ffffffff81000030 T vfs_write
ffffffff81000040 T tcp_sendmsg
";

    const KPROBES_SAMPLE: &str = "\
sys_open
sys_close
vfs_read
vfs_write
tcp_sendmsg
";

    fn tables() -> (KsymTable, KprobeSet) {
        (
            KsymTable::parse(KALLSYMS_SAMPLE).unwrap(),
            KprobeSet::parse(KPROBES_SAMPLE),
        )
    }

    fn globs(patterns: &[&str]) -> Vec<Glob> {
        patterns.iter().map(|p| Glob::new(p).unwrap()).collect()
    }

    #[test]
    fn deny_only() {
        let types = FakeTypes::new(&[
            ("sys_open", int_sig(2)),
            ("sys_close", int_sig(1)),
            ("vfs_read", int_sig(4)),
        ]);
        let (ksyms, kprobes) = tables();
        let mut deny = globs(&["sys_*"]);

        let sel = select_funcs(
            &types,
            &ksyms,
            &kprobes,
            &mut deny,
            &mut [],
            &AttachOpts::default(),
        )
        .unwrap();

        assert!(sel.funcs.len() == 1);
        assert!(sel.funcs[0].name == "vfs_read");
        assert!(sel.funcs[0].addr == 0xffffffff81000020);
        assert!(sel.skipped == 2);
        assert!(deny[0].match_count() == 2);
    }

    #[test]
    fn allow_only() {
        let types = FakeTypes::new(&[
            ("vfs_read", int_sig(4)),
            ("vfs_write", int_sig(4)),
            ("tcp_sendmsg", int_sig(3)),
        ]);
        let (ksyms, kprobes) = tables();
        let mut allow = globs(&["vfs_*"]);

        let sel = select_funcs(
            &types,
            &ksyms,
            &kprobes,
            &mut [],
            &mut allow,
            &AttachOpts::default(),
        )
        .unwrap();

        assert!(sel.funcs.len() == 2);
        assert!(sel.funcs[0].name == "vfs_read");
        assert!(sel.funcs[1].name == "vfs_write");
        assert!(allow[0].match_count() == 2);
    }

    #[test]
    fn missing_symbol_or_kprobe() {
        // Present in BTF but in neither kallsyms nor the kprobe set.
        let types = FakeTypes::new(&[
            ("not_a_symbol", int_sig(1)),
            ("vfs_read", int_sig(4)),
        ]);
        let (ksyms, _) = tables();
        let kprobes = KprobeSet::parse("vfs_write\n");

        let res = select_funcs(
            &types,
            &ksyms,
            &kprobes,
            &mut [],
            &mut [],
            &AttachOpts::default(),
        );
        assert!(res.is_err());
    }

    #[test]
    fn inadmissible_prototypes() {
        let types = FakeTypes::new(&[
            ("sys_open", void_sig()),
            ("sys_close", int_sig(12)),
            (
                "vfs_read",
                FuncSig {
                    ret: RetKind::Int,
                    args: vec![ArgKind::Other],
                },
            ),
            ("vfs_write", int_sig(4)),
        ]);
        let (ksyms, kprobes) = tables();

        let sel = select_funcs(
            &types,
            &ksyms,
            &kprobes,
            &mut [],
            &mut [],
            &AttachOpts::default(),
        )
        .unwrap();

        assert!(sel.funcs.len() == 1);
        assert!(sel.funcs[0].name == "vfs_write");
        assert!(sel.skipped == 3);
    }

    #[test]
    fn max_func_cnt() {
        let types = FakeTypes::new(&[
            ("sys_open", int_sig(2)),
            ("sys_close", int_sig(1)),
            ("vfs_read", int_sig(4)),
        ]);
        let (ksyms, kprobes) = tables();
        let opts = AttachOpts {
            max_func_cnt: 2,
            ..Default::default()
        };

        let sel = select_funcs(&types, &ksyms, &kprobes, &mut [], &mut [], &opts).unwrap();

        // The walk terminates, it does not skip.
        assert!(sel.funcs.len() == 2);
        assert!(sel.skipped == 0);
    }

    #[test]
    fn func_filter() {
        let types = FakeTypes::new(&[
            ("sys_open", int_sig(2)),
            ("sys_close", int_sig(1)),
            ("vfs_read", int_sig(4)),
        ]);
        let (ksyms, kprobes) = tables();
        let opts = AttachOpts {
            func_filter: Some(Box::new(|_, _, name, _| name.starts_with("sys_"))),
            ..Default::default()
        };

        let sel = select_funcs(&types, &ksyms, &kprobes, &mut [], &mut [], &opts).unwrap();

        assert!(sel.funcs.len() == 2);
        assert!(sel.funcs.iter().all(|f| f.name.starts_with("sys_")));
    }

    #[test]
    fn arity_accounting() {
        let types = FakeTypes::new(&[
            ("sys_open", int_sig(2)),
            ("sys_close", int_sig(1)),
            ("vfs_read", int_sig(4)),
            ("vfs_write", int_sig(4)),
        ]);
        let (ksyms, kprobes) = tables();

        let sel = select_funcs(
            &types,
            &ksyms,
            &kprobes,
            &mut [],
            &mut [],
            &AttachOpts::default(),
        )
        .unwrap();

        assert!(sel.cnt_by_arity[1] == 1);
        assert!(sel.cnt_by_arity[2] == 1);
        assert!(sel.cnt_by_arity[4] == 2);
        assert!(sel.cnt_by_arity[0] == 0);

        // The template is the first selected function of each arity.
        assert!(sel.template_by_arity[4] == Some(2));
        assert!(sel.funcs[sel.template_by_arity[4].unwrap()].name == "vfs_read");
        assert!(sel.template_by_arity[0].is_none());
    }

    #[test]
    fn duplicate_globs() {
        let types = FakeTypes::new(&[("vfs_read", int_sig(4)), ("vfs_write", int_sig(4))]);
        let (ksyms, kprobes) = tables();
        let mut allow = globs(&["vfs_*", "vfs_*"]);

        let sel = select_funcs(
            &types,
            &ksyms,
            &kprobes,
            &mut [],
            &mut allow,
            &AttachOpts::default(),
        )
        .unwrap();

        // Same selection outcome, first glob takes the hits.
        assert!(sel.funcs.len() == 2);
        assert!(allow[0].match_count() == 2);
        assert!(allow[1].match_count() == 0);
    }

    #[test]
    fn empty_selection() {
        let types = FakeTypes::new(&[("vfs_read", int_sig(4))]);
        let (ksyms, kprobes) = tables();
        let mut deny = globs(&["*"]);

        let res = select_funcs(
            &types,
            &ksyms,
            &kprobes,
            &mut deny,
            &mut [],
            &AttachOpts::default(),
        );
        assert!(res.is_err());
    }
}
