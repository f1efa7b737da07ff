//! Context objects and per call site constancy baselines.
use debloat_ir::{FuncRef, InstData, InstId, Module};
use rustc_hash::FxHashMap;
use smallvec::SmallVec;

use crate::memory::Memory;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextObject {
    pub id: u32,
    pub addr: u64,
    pub size: u64,
}

impl ContextObject {
    pub fn contains(&self, addr: u64) -> bool {
        addr >= self.addr && addr < self.addr + self.size.max(1)
    }
}

pub type ConstBits = SmallVec<[bool; 8]>;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TrackInfo {
    objects: FxHashMap<u32, ContextObject>,
    /// Constancy of call arguments as written in the input program.
    baselines: FxHashMap<(FuncRef, InstId), ConstBits>,
}

impl TrackInfo {
    pub fn new(module: &Module) -> Self {
        let mut baselines = FxHashMap::default();
        for func in module.iter_functions() {
            let body = &module.funcs[func];
            for block in body.layout.iter_block() {
                for inst in body.layout.iter_inst(block) {
                    let args = match body.dfg.inst(inst) {
                        InstData::Call { args, .. } => &args[..],
                        InstData::CallIndirect { args, .. } => &args[1..],
                        _ => continue,
                    };
                    let bits = args
                        .iter()
                        .map(|&arg| body.dfg.value(arg).is_constant())
                        .collect();
                    baselines.insert((func, inst), bits);
                }
            }
        }

        Self {
            objects: FxHashMap::default(),
            baselines,
        }
    }

    /// Registers the object allocated for `id`. A later allocation of the
    /// same id replaces the earlier one.
    pub fn add_context_object(&mut self, id: u32, addr: u64, size: u64) {
        self.objects.insert(id, ContextObject { id, addr, size });
    }

    /// Returns the object whose bytes hold `addr`.
    pub fn context_object_at(&self, addr: u64) -> Option<&ContextObject> {
        self.objects.values().find(|obj| obj.contains(addr))
    }

    /// Returns `true` if object `id` is unknown or some of its bytes are
    /// still constant in `memory`.
    pub fn remain_constant(&self, id: u32, memory: &Memory) -> bool {
        let Some(obj) = self.objects.get(&id) else {
            return true;
        };
        (0..obj.size).any(|off| memory.check_constant(obj.addr + off, 1))
    }

    pub fn baseline(&self, func: FuncRef, inst: InstId) -> Option<&ConstBits> {
        self.baselines.get(&(func, inst))
    }

    /// Returns `true` if the constancy of any of the first `fixed` arguments
    /// differs from the baseline of the call site.
    pub fn const_bits_changed(
        &self,
        func: FuncRef,
        inst: InstId,
        bits: &[bool],
        fixed: usize,
    ) -> bool {
        let Some(baseline) = self.baseline(func, inst) else {
            return bits.iter().take(fixed).any(|bit| *bit);
        };
        bits.iter()
            .zip(baseline.iter())
            .take(fixed)
            .any(|(now, then)| now ^ then)
    }
}
