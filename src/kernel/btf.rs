//! # BTF
//!
//! Function-type universe of the running kernel. The attach mechanism only
//! supports certain function shapes, and only one verifier template exists
//! per argument count; this module resolves each `FUNC` entry's prototype
//! into a small signature summary and decides admissibility.

use std::path::Path;

use anyhow::{bail, Result};
use btf_rs::{Btf, Type};

use crate::MAX_FUNC_ARG_CNT;

pub(crate) const VMLINUX_BTF: &str = "/sys/kernel/btf/vmlinux";

/// Classification of a parameter type, after modifiers and typedefs are
/// stripped.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ArgKind {
    Int,
    Ptr,
    Enum,
    /// Type id zero, the variadic marker.
    Variadic,
    Other,
}

/// Classification of a return type, after modifiers and typedefs are
/// stripped.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RetKind {
    Int,
    Enum,
    /// `void *`.
    VoidPtr,
    /// Pointer to a struct or union.
    CompositePtr,
    Void,
    Other,
}

/// Resolved summary of a function prototype.
#[derive(Clone, Debug)]
pub struct FuncSig {
    pub ret: RetKind,
    pub args: Vec<ArgKind>,
}

impl FuncSig {
    pub fn arg_cnt(&self) -> usize {
        self.args.len()
    }

    /// Whether fentry/fexit programs can attach to a function of this
    /// shape. Functions returning void are rejected: consumers capture the
    /// return value.
    pub fn attach_compatible(&self) -> bool {
        if self.args.len() > MAX_FUNC_ARG_CNT {
            return false;
        }

        if !matches!(
            self.ret,
            RetKind::Int | RetKind::Enum | RetKind::VoidPtr | RetKind::CompositePtr
        ) {
            return false;
        }

        self.args
            .iter()
            .all(|arg| matches!(arg, ArgKind::Int | ArgKind::Ptr | ArgKind::Enum))
    }
}

/// View over the kernel function-type universe. The production
/// implementation reads the running kernel's BTF; tests substitute
/// synthetic universes.
pub trait FuncTypes {
    /// Iterate `FUNC` entries as `(btf_id, name)`, in ascending id order.
    fn funcs(&self) -> Box<dyn Iterator<Item = (u32, String)> + '_>;

    /// Resolve the signature summary of the `FUNC` entry `btf_id`.
    fn sig(&self, btf_id: u32) -> Result<FuncSig>;
}

/// The running kernel's type database.
pub struct KernelBtf {
    btf: Btf,
}

impl KernelBtf {
    /// Parse the system-wide BTF of the running kernel.
    pub fn load() -> Result<KernelBtf> {
        Self::from_file(VMLINUX_BTF)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<KernelBtf> {
        // Kernels built without CONFIG_DEBUG_INFO_BTF don't expose the
        // table at all; classify that as a missing table, like the other
        // kernel-provided inputs.
        let bytes = super::read_table_raw(path)?;

        Ok(KernelBtf {
            btf: Btf::from_bytes(&bytes)?,
        })
    }

    /// Access the underlying BTF object, e.g. for custom function filters.
    pub fn btf(&self) -> &Btf {
        &self.btf
    }

    /// Strip modifiers and typedefs; alias chains can be arbitrarily deep.
    fn strip_aliases(&self, mut t: Type) -> Result<Type> {
        loop {
            t = match t {
                Type::Typedef(ref x) => self.btf.resolve_chained_type(x)?,
                Type::Const(ref x) => self.btf.resolve_chained_type(x)?,
                Type::Volatile(ref x) => self.btf.resolve_chained_type(x)?,
                Type::Restrict(ref x) => self.btf.resolve_chained_type(x)?,
                _ => return Ok(t),
            };
        }
    }

    fn arg_kind(&self, param: &btf_rs::Parameter) -> Result<ArgKind> {
        let t = self.strip_aliases(self.btf.resolve_chained_type(param)?)?;

        Ok(match t {
            Type::Int(_) => ArgKind::Int,
            Type::Ptr(_) => ArgKind::Ptr,
            Type::Enum(_) | Type::Enum64(_) => ArgKind::Enum,
            Type::Void => ArgKind::Variadic,
            _ => ArgKind::Other,
        })
    }

    fn ret_kind(&self, proto: &btf_rs::FuncProto) -> Result<RetKind> {
        let t = self.strip_aliases(self.btf.resolve_type_by_id(proto.return_type_id())?)?;

        Ok(match t {
            Type::Void => RetKind::Void,
            Type::Int(_) => RetKind::Int,
            Type::Enum(_) | Type::Enum64(_) => RetKind::Enum,
            // The pointee is examined as-is: a modifier-qualified composite
            // does not qualify.
            Type::Ptr(ref p) => match self.btf.resolve_chained_type(p)? {
                Type::Void => RetKind::VoidPtr,
                Type::Struct(_) | Type::Union(_) => RetKind::CompositePtr,
                _ => RetKind::Other,
            },
            _ => RetKind::Other,
        })
    }
}

impl FuncTypes for KernelBtf {
    fn funcs(&self) -> Box<dyn Iterator<Item = (u32, String)> + '_> {
        // Type ids are contiguous from 1; the walk ends at the first
        // unresolvable id.
        Box::new(
            (1u32..)
                .map_while(|id| self.btf.resolve_type_by_id(id).ok().map(|t| (id, t)))
                .filter_map(|(id, t)| match t {
                    Type::Func(ref func) => {
                        self.btf.resolve_name(func).ok().map(|name| (id, name))
                    }
                    _ => None,
                }),
        )
    }

    fn sig(&self, btf_id: u32) -> Result<FuncSig> {
        let func = match self.btf.resolve_type_by_id(btf_id)? {
            Type::Func(func) => func,
            _ => bail!("BTF id {} is not a function", btf_id),
        };

        let proto = match self.btf.resolve_chained_type(&func)? {
            Type::FuncProto(proto) => proto,
            _ => bail!("Function at BTF id {} does not have a prototype", btf_id),
        };

        let mut args = Vec::with_capacity(proto.parameters.len());
        for param in proto.parameters.iter() {
            args.push(self.arg_kind(param)?);
        }

        Ok(FuncSig {
            ret: self.ret_kind(&proto)?,
            args,
        })
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// Synthetic function universe for pipeline tests.
    pub(crate) struct FakeTypes {
        funcs: Vec<(u32, String, FuncSig)>,
    }

    impl FakeTypes {
        pub(crate) fn new(funcs: &[(&str, FuncSig)]) -> FakeTypes {
            FakeTypes {
                funcs: funcs
                    .iter()
                    .enumerate()
                    .map(|(i, (name, sig))| ((i + 1) as u32, name.to_string(), sig.clone()))
                    .collect(),
            }
        }
    }

    impl FuncTypes for FakeTypes {
        fn funcs(&self) -> Box<dyn Iterator<Item = (u32, String)> + '_> {
            Box::new(self.funcs.iter().map(|(id, name, _)| (*id, name.clone())))
        }

        fn sig(&self, btf_id: u32) -> Result<FuncSig> {
            self.funcs
                .iter()
                .find(|(id, _, _)| *id == btf_id)
                .map(|(_, _, sig)| sig.clone())
                .ok_or_else(|| anyhow::anyhow!("no function with BTF id {}", btf_id))
        }
    }

    /// `int f(int, ...)` with `args` parameters.
    pub(crate) fn int_sig(args: usize) -> FuncSig {
        FuncSig {
            ret: RetKind::Int,
            args: vec![ArgKind::Int; args],
        }
    }

    /// `void f(void)`, always inadmissible.
    pub(crate) fn void_sig() -> FuncSig {
        FuncSig {
            ret: RetKind::Void,
            args: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sig(ret: RetKind, args: &[ArgKind]) -> FuncSig {
        FuncSig {
            ret,
            args: args.to_vec(),
        }
    }

    #[test]
    fn compatible_shapes() {
        assert!(sig(RetKind::Int, &[]).attach_compatible());
        assert!(sig(RetKind::Enum, &[ArgKind::Int]).attach_compatible());
        assert!(sig(RetKind::VoidPtr, &[ArgKind::Ptr, ArgKind::Enum]).attach_compatible());
        assert!(sig(RetKind::CompositePtr, &[ArgKind::Ptr; 11]).attach_compatible());
    }

    #[test]
    fn arity_cap() {
        assert!(sig(RetKind::Int, &[ArgKind::Int; 11]).attach_compatible());
        assert!(!sig(RetKind::Int, &[ArgKind::Int; 12]).attach_compatible());
    }

    #[test]
    fn void_return_rejected() {
        assert!(!sig(RetKind::Void, &[]).attach_compatible());
        assert!(!sig(RetKind::Void, &[ArgKind::Ptr]).attach_compatible());
    }

    #[test]
    fn return_kinds() {
        // Pointers qualify only towards void or a composite.
        assert!(!sig(RetKind::Other, &[]).attach_compatible());
        assert!(sig(RetKind::VoidPtr, &[]).attach_compatible());
        assert!(sig(RetKind::CompositePtr, &[]).attach_compatible());
    }

    #[test]
    fn arg_kinds() {
        assert!(!sig(RetKind::Int, &[ArgKind::Other]).attach_compatible());
        assert!(!sig(RetKind::Int, &[ArgKind::Int, ArgKind::Variadic]).attach_compatible());
        assert!(sig(RetKind::Int, &[ArgKind::Int, ArgKind::Ptr, ArgKind::Enum]).attach_compatible());
    }
}
