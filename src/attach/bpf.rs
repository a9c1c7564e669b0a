//! # BPF skeleton backend
//!
//! [`ProtoSkel`] over a real libbpf object. The object must follow the
//! prototype-set conventions: one tracing program per direction and
//! argument count, named `fentry0`..`fentry11` and `fexit0`..`fexit11`, a
//! hash map `ip_to_id` keyed by instruction pointer, and the activation
//! flag as the first byte of `.bss`.

use std::ffi::CString;
use std::mem;
use std::os::unix::io::RawFd;
use std::path::Path;
use std::ptr;

use anyhow::{anyhow, bail, Result};
use libbpf_sys::bpf_insn;
use nix::unistd::close;

use super::skel::{ProbeKind, ProtoSkel, ARITY_SLOTS};
use crate::Error;

const IP_MAP: &str = "ip_to_id";

fn prog_name(kind: ProbeKind, arity: usize) -> String {
    format!("{kind}{arity}")
}

/// Prototype set backed by an open libbpf object.
pub struct BpfSkel {
    open: Option<libbpf_rs::OpenObject>,
    obj: Option<libbpf_rs::Object>,
    /// Prototypes withheld from the load because no selected function has
    /// their argument count.
    autoload_off: [[bool; ARITY_SLOTS]; 2],
    /// Clone and attachment fds, closed on drop.
    prog_fds: Vec<RawFd>,
    link_fds: Vec<RawFd>,
}

impl BpfSkel {
    /// Wrap an open, not yet loaded, object. Skeleton users pass their
    /// builder's `open()?.obj`.
    pub fn new(open: libbpf_rs::OpenObject) -> BpfSkel {
        BpfSkel {
            open: Some(open),
            obj: None,
            autoload_off: [[false; ARITY_SLOTS]; 2],
            prog_fds: Vec::new(),
            link_fds: Vec::new(),
        }
    }

    /// Open a compiled prototype object file.
    pub fn open_file<P: AsRef<Path>>(path: P) -> Result<BpfSkel> {
        Ok(Self::new(
            libbpf_rs::ObjectBuilder::default().open_file(path)?,
        ))
    }

    fn open_mut(&mut self) -> Result<&mut libbpf_rs::OpenObject> {
        self.open
            .as_mut()
            .ok_or_else(|| anyhow!("prototype set is already loaded"))
    }

    fn obj(&self) -> Result<&libbpf_rs::Object> {
        self.obj
            .as_ref()
            .ok_or_else(|| anyhow!("prototype set is not loaded"))
    }

    fn kind_idx(kind: ProbeKind) -> usize {
        match kind {
            ProbeKind::Fentry => 0,
            ProbeKind::Fexit => 1,
        }
    }
}

impl ProtoSkel for BpfSkel {
    fn set_attach_target(
        &mut self,
        kind: ProbeKind,
        arity: usize,
        func_name: &str,
    ) -> Result<()> {
        let name = prog_name(kind, arity);

        self.open_mut()?
            .prog_mut(&name)
            .ok_or_else(|| anyhow!("couldn't get program {name}"))?
            .set_attach_target(0, Some(func_name.to_string()))?;
        Ok(())
    }

    fn disable_autoload(&mut self, kind: ProbeKind, arity: usize) -> Result<()> {
        self.autoload_off[Self::kind_idx(kind)][arity] = true;

        let name = prog_name(kind, arity);
        self.open_mut()?
            .prog_mut(&name)
            .ok_or_else(|| anyhow!("couldn't get program {name}"))?
            .set_autoload(false)?;
        Ok(())
    }

    fn resize_ip_map(&mut self, entries: u32) -> Result<()> {
        self.open_mut()?
            .map_mut(IP_MAP)
            .ok_or_else(|| anyhow!("couldn't get map {IP_MAP}"))?
            .set_max_entries(entries)?;
        Ok(())
    }

    fn load(
        &mut self,
        debug: bool,
        capture: &mut dyn FnMut(ProbeKind, usize, Vec<bpf_insn>),
    ) -> Result<()> {
        let autoload_off = self.autoload_off;

        // In debug mode ask the verifier for its log on every prototype
        // load, so rejections are diagnosable.
        if debug {
            let open = self.open_mut()?;
            for arity in 0..ARITY_SLOTS {
                for kind in [ProbeKind::Fentry, ProbeKind::Fexit] {
                    if autoload_off[Self::kind_idx(kind)][arity] {
                        continue;
                    }

                    let name = prog_name(kind, arity);
                    open.prog_mut(&name)
                        .ok_or_else(|| anyhow!("couldn't get program {name}"))?
                        .set_log_level(1)?;
                }
            }
        }

        let obj = match self.open.take() {
            Some(open) => open
                .load()
                .map_err(|e| Error::Verifier(e.to_string()))?,
            None => bail!("prototype set is already loaded"),
        };

        // Map fds and CO-RE references are only relocated into the
        // instruction buffers inside the object load. libbpf dropped
        // per-program instruction-preparation hooks, so each enabled
        // prototype goes through a real load and its relocated stream is
        // read back from the loaded program; clones then carry working
        // map references.
        for arity in 0..ARITY_SLOTS {
            for kind in [ProbeKind::Fentry, ProbeKind::Fexit] {
                if autoload_off[Self::kind_idx(kind)][arity] {
                    continue;
                }

                let name = prog_name(kind, arity);
                let prog = obj
                    .prog(&name)
                    .ok_or_else(|| anyhow!("couldn't get program {name}"))?;

                capture(kind, arity, prog.insns().to_vec());
            }
        }

        self.obj = Some(obj);
        Ok(())
    }

    fn clone_prog(
        &mut self,
        kind: ProbeKind,
        arity: usize,
        insns: &[bpf_insn],
        attach_btf_id: u32,
    ) -> Result<RawFd> {
        let name = CString::new(prog_name(kind, arity))?;
        let license = CString::new("Dual BSD/GPL")?;

        let attach_type = match kind {
            ProbeKind::Fentry => libbpf_rs::ProgramAttachType::TraceFentry,
            ProbeKind::Fexit => libbpf_rs::ProgramAttachType::TraceFexit,
        };

        let mut opts = libbpf_sys::bpf_prog_load_opts {
            sz: mem::size_of::<libbpf_sys::bpf_prog_load_opts>() as libbpf_sys::size_t,
            expected_attach_type: attach_type as u32,
            attach_btf_id,
            ..Default::default()
        };

        let fd = unsafe {
            libbpf_sys::bpf_prog_load(
                libbpf_rs::ProgramType::Tracing as u32,
                name.as_ptr(),
                license.as_ptr(),
                insns.as_ptr(),
                insns.len() as libbpf_sys::size_t,
                &mut opts,
            )
        };
        if fd < 0 {
            return Err(Error::Verifier(format!(
                "program load failed: {}",
                std::io::Error::from_raw_os_error(-fd)
            ))
            .into());
        }

        self.prog_fds.push(fd);
        Ok(fd)
    }

    fn attach_prog(&mut self, prog_fd: RawFd) -> Result<()> {
        let fd = unsafe { libbpf_sys::bpf_raw_tracepoint_open(ptr::null(), prog_fd) };
        if fd < 0 {
            return Err(Error::Kernel(format!(
                "raw tracepoint open failed: {}",
                std::io::Error::from_raw_os_error(-fd)
            ))
            .into());
        }

        self.link_fds.push(fd);
        Ok(())
    }

    fn map_ip(&mut self, addr: u64, index: u32) -> Result<()> {
        self.obj()?
            .map(IP_MAP)
            .ok_or_else(|| anyhow!("couldn't get map {IP_MAP}"))?
            .update(
                &addr.to_ne_bytes(),
                &index.to_ne_bytes(),
                libbpf_rs::MapFlags::ANY,
            )?;
        Ok(())
    }

    fn set_ready(&mut self, on: bool) -> Result<()> {
        let obj = self.obj()?;
        let bss = obj
            .maps_iter()
            .find(|m| m.name().ends_with(".bss"))
            .ok_or_else(|| anyhow!("prototype set has no .bss"))?;

        // The activation flag is the first byte of the bss view; rewrite
        // the single-entry array value as a whole.
        let key = 0u32.to_ne_bytes();
        let mut val = bss
            .lookup(&key, libbpf_rs::MapFlags::ANY)?
            .ok_or_else(|| anyhow!("couldn't read the .bss map"))?;
        if val.is_empty() {
            bail!("empty .bss map value");
        }

        val[0] = on as u8;
        bss.update(&key, &val, libbpf_rs::MapFlags::ANY)?;
        Ok(())
    }
}

impl Drop for BpfSkel {
    fn drop(&mut self) {
        for fd in self.link_fds.drain(..).chain(self.prog_fds.drain(..)) {
            let _ = close(fd);
        }
    }
}
