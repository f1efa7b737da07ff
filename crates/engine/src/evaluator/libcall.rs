//! Heap and memory intrinsics evaluated on the emulated memory.
use debloat_ir::{BlockId, FuncRef, InstId, Type, ValueId};

use super::{inst::Clobber, Engine, ProcResult};
use crate::{
    memory::MAX_ALLOC,
    trace::{trace_at, TraceCategory},
};

/// Strips the intrinsic prefix and any type suffix,
/// `llvm.memcpy.p0.p0.i64` becomes `memcpy`.
pub(super) fn base_name(name: &str) -> &str {
    let name = name.strip_prefix("llvm.").unwrap_or(name);
    name.split_once('.').map_or(name, |(base, _)| base)
}

impl Engine {
    /// Evaluates a call of a declared function. Returns `None` if the
    /// function has no rule here.
    pub(super) fn process_libcall(
        &mut self,
        func: FuncRef,
        block: BlockId,
        inst: InstId,
        callee: FuncRef,
    ) -> Option<ProcResult> {
        let name = base_name(self.body(callee).name()).to_string();
        let args = self.call_args(func, inst);
        let res = match (name.as_str(), args.as_slice()) {
            ("malloc", &[size]) => self.lib_alloc(func, block, inst, None, size),
            ("calloc", &[num, size]) => self.lib_alloc(func, block, inst, Some(num), size),
            ("realloc", &[ptr, size]) => self.lib_realloc(func, block, inst, ptr, size),
            ("free", _) => Some(ProcResult::NotFolded),
            ("memcpy" | "memmove", &[dst, src, len, ..]) => {
                Some(self.lib_memcpy(func, block, inst, dst, src, len))
            }
            ("memset", &[dst, val, len, ..]) => Some(self.lib_memset(func, block, inst, dst, val, len)),
            _ => return None,
        };

        trace_at!(self.config.trace, TraceCategory::Call, "{inst}: {name} gives {res:?}");
        res
    }

    fn known_size(&self, func: FuncRef, value: ValueId) -> Option<u64> {
        self.fact(func, value).filter(|&size| size <= MAX_ALLOC)
    }

    /// `malloc(size)`, or `calloc(num, size)` when `num` is given.
    fn lib_alloc(
        &mut self,
        func: FuncRef,
        block: BlockId,
        inst: InstId,
        num: Option<ValueId>,
        size: ValueId,
    ) -> Option<ProcResult> {
        let count = match num {
            Some(num) => self.known_size(func, num)?,
            None => 1,
        };
        let size = self
            .known_size(func, size)?
            .checked_mul(count)
            .filter(|&size| size <= MAX_ALLOC)?;
        let addr = self.heap_alloc(func, block, inst, size)?;
        if num.is_some() {
            let memory = self.memory_mut(func, block)?;
            memory.set_constant(addr, size, true).ok()?;
        }
        Some(ProcResult::NotFolded)
    }

    /// `realloc(ptr, size)`. The constant prefix of the old block moves.
    fn lib_realloc(
        &mut self,
        func: FuncRef,
        block: BlockId,
        inst: InstId,
        ptr: ValueId,
        size: ValueId,
    ) -> Option<ProcResult> {
        let size = self.known_size(func, size)?;
        let old = self.fact(func, ptr)?;
        let addr = self.heap_alloc(func, block, inst, size)?;
        if old != 0 {
            let memory = self.memory_mut(func, block)?;
            let len = memory.size_contiguous(old).min(size);
            memory.copy_within(addr, old, len).ok()?;
        }
        Some(ProcResult::NotFolded)
    }

    /// Allocates on the heap of `block` and binds the result of `inst`.
    /// The new bytes are zero and not constant.
    fn heap_alloc(&mut self, func: FuncRef, block: BlockId, inst: InstId, size: u64) -> Option<u64> {
        let addr = self.memory_mut(func, block)?.allocate_heap(size).ok()?;
        if let Some(id) = self.body(func).meta.alloc_site(inst) {
            trace_at!(
                self.config.trace,
                TraceCategory::Mem,
                "context object {id} at {addr:#x}, {size} bytes"
            );
            self.state.track.add_context_object(id, addr, size);
        }
        self.set_register(func, inst, addr, false);
        Some(addr)
    }

    fn lib_memcpy(
        &mut self,
        func: FuncRef,
        block: BlockId,
        inst: InstId,
        dst: ValueId,
        src: ValueId,
        len: ValueId,
    ) -> ProcResult {
        let dst_addr = self.fact(func, dst);
        let copied = match (dst_addr, self.fact(func, src), self.known_size(func, len)) {
            (Some(dst), Some(src), Some(len)) => self
                .memory_mut(func, block)
                .is_some_and(|memory| memory.copy_within(dst, src, len).is_ok()),
            _ => false,
        };
        self.finish_mem_write(func, block, inst, dst, len, copied)
    }

    fn lib_memset(
        &mut self,
        func: FuncRef,
        block: BlockId,
        inst: InstId,
        dst: ValueId,
        val: ValueId,
        len: ValueId,
    ) -> ProcResult {
        let written = match (self.fact(func, dst), self.fact(func, val), self.known_size(func, len)) {
            (Some(dst), Some(val), Some(len)) => {
                self.memory_mut(func, block).is_some_and(|memory| {
                    let bytes = vec![val as u8; len as usize];
                    memory.write_bytes(dst, &bytes).is_ok()
                        && memory.set_constant(dst, len, true).is_ok()
                })
            }
            _ => false,
        };
        self.finish_mem_write(func, block, inst, dst, len, written)
    }

    /// Binds the returned destination, or invalidates it if the write could
    /// not be emulated.
    fn finish_mem_write(
        &mut self,
        func: FuncRef,
        block: BlockId,
        inst: InstId,
        dst: ValueId,
        len: ValueId,
        done: bool,
    ) -> ProcResult {
        let dst_addr = self.fact(func, dst);
        if let Some(addr) = dst_addr {
            let tracked = self.state.regs.is_tracked(func, dst);
            self.set_register(func, inst, addr, tracked);
        }
        if done {
            return ProcResult::NotFolded;
        }

        let clobbers = match (dst_addr, self.fact(func, len)) {
            (Some(addr), Some(len)) => vec![Clobber::Range { addr, len }],
            (Some(addr), None) => {
                let ty = self.body(func).dfg.value_ty(dst).pointee().cloned();
                vec![Clobber::Pointee {
                    ty: ty.unwrap_or(Type::I8),
                    addr,
                }]
            }
            (None, _) => self.root_clobber(func, dst),
        };
        self.apply_clobbers(func, block, clobbers);
        ProcResult::Undecided
    }
}
