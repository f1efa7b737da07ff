//! Byte-level emulation of program memory.
//!
//! A [`Memory`] holds two bump-allocated arenas, one for the stack and one for
//! the heap. Every byte carries a constancy flag. A set flag means the byte's
//! value is the same on every path reaching the current point.
//!
//! The arenas live at disjoint emulated addresses, so an address alone tells
//! which arena it belongs to. Function addresses are not backed by memory,
//! they are encoded above [`FUNC_BASE`].
use byteorder::{ByteOrder, LittleEndian};
use cranelift_entity::EntityRef;
use debloat_ir::FuncRef;

use crate::error::OutOfBounds;

pub const STACK_BASE: u64 = 0x1000;
pub const HEAP_BASE: u64 = 1 << 32;
pub const FUNC_BASE: u64 = 1 << 48;
const FUNC_ALIGN: u64 = 16;
/// Largest single allocation the arenas back with host memory.
pub const MAX_ALLOC: u64 = 1 << 28;

/// Returns the emulated address of `func`.
pub fn func_addr(func: FuncRef) -> u64 {
    FUNC_BASE + func.index() as u64 * FUNC_ALIGN
}

/// Decodes an address produced by [`func_addr`].
pub fn addr_func(addr: u64) -> Option<FuncRef> {
    if addr < FUNC_BASE || (addr - FUNC_BASE) % FUNC_ALIGN != 0 {
        return None;
    }
    let idx = (addr - FUNC_BASE) / FUNC_ALIGN;
    usize::try_from(idx).ok().map(FuncRef::new)
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Arena {
    base: u64,
    limit: u64,
    bytes: Vec<u8>,
    consts: Vec<bool>,
}

impl Arena {
    fn new(base: u64, limit: u64) -> Self {
        Self {
            base,
            limit,
            bytes: Vec::new(),
            consts: Vec::new(),
        }
    }

    fn contains(&self, addr: u64) -> bool {
        addr >= self.base && addr < self.limit
    }

    fn allocate(&mut self, size: u64) -> Result<u64, OutOfBounds> {
        let addr = self.base + self.bytes.len() as u64;
        let oob = OutOfBounds { addr, size };
        if size > MAX_ALLOC || addr.checked_add(size).map_or(true, |end| end > self.limit) {
            return Err(oob);
        }
        // Zero sized objects still get a distinct address.
        let size = size.max(1) as usize;
        self.bytes.resize(self.bytes.len() + size, 0);
        self.consts.resize(self.consts.len() + size, false);
        Ok(addr)
    }

    fn range(&self, addr: u64, size: u64) -> Result<std::ops::Range<usize>, OutOfBounds> {
        let oob = OutOfBounds { addr, size };
        let end = addr.checked_add(size).ok_or(oob)?;
        if addr < self.base || end > self.base + self.bytes.len() as u64 {
            return Err(oob);
        }
        let start = (addr - self.base) as usize;
        Ok(start..start + size as usize)
    }

    fn offset(&self, addr: u64) -> Option<usize> {
        let off = addr.checked_sub(self.base)? as usize;
        (off < self.bytes.len()).then_some(off)
    }

    fn same_facts(&self, other: &Arena) -> bool {
        self.consts == other.consts
            && self
                .bytes
                .iter()
                .zip(&other.bytes)
                .zip(&self.consts)
                .all(|((a, b), &constant)| !constant || a == b)
    }

    /// Merges `other` into `self`. Bytes that disagree in value or constancy
    /// lose their constancy, bytes allocated on one side only become non-const.
    fn unify(&mut self, other: &Arena) {
        let common = self.bytes.len().min(other.bytes.len());
        for i in 0..common {
            if !(self.consts[i] && other.consts[i] && self.bytes[i] == other.bytes[i]) {
                self.consts[i] = false;
            }
        }

        for flag in &mut self.consts[common..] {
            *flag = false;
        }
        if other.bytes.len() > common {
            self.bytes.extend_from_slice(&other.bytes[common..]);
            self.consts.resize(other.bytes.len(), false);
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Memory {
    stack: Arena,
    heap: Arena,
}

impl Default for Memory {
    fn default() -> Self {
        Self::new()
    }
}

impl Memory {
    pub fn new() -> Self {
        Self {
            stack: Arena::new(STACK_BASE, HEAP_BASE),
            heap: Arena::new(HEAP_BASE, FUNC_BASE),
        }
    }

    /// Reserves `size` bytes on the stack. New bytes are zero and non-const.
    /// Fails for requests above [`MAX_ALLOC`] or past the end of the arena.
    pub fn allocate_stack(&mut self, size: u64) -> Result<u64, OutOfBounds> {
        self.stack.allocate(size)
    }

    /// Reserves `size` bytes on the heap, see [`Self::allocate_stack`].
    pub fn allocate_heap(&mut self, size: u64) -> Result<u64, OutOfBounds> {
        self.heap.allocate(size)
    }

    pub fn stack_index(&self) -> u64 {
        self.stack.bytes.len() as u64
    }

    pub fn heap_index(&self) -> u64 {
        self.heap.bytes.len() as u64
    }

    pub fn is_allocated(&self, addr: u64) -> bool {
        self.arena(addr).and_then(|arena| arena.offset(addr)).is_some()
    }

    fn arena(&self, addr: u64) -> Option<&Arena> {
        if self.stack.contains(addr) {
            Some(&self.stack)
        } else if self.heap.contains(addr) {
            Some(&self.heap)
        } else {
            None
        }
    }

    fn arena_mut(&mut self, addr: u64) -> Option<&mut Arena> {
        if self.stack.contains(addr) {
            Some(&mut self.stack)
        } else if self.heap.contains(addr) {
            Some(&mut self.heap)
        } else {
            None
        }
    }

    /// Reads a little endian integer of `size` bytes, `1 <= size <= 8`.
    pub fn load(&self, addr: u64, size: u64) -> Result<u64, OutOfBounds> {
        if !(1..=8).contains(&size) {
            return Err(OutOfBounds { addr, size });
        }
        let arena = self.arena(addr).ok_or(OutOfBounds { addr, size })?;
        let range = arena.range(addr, size)?;
        Ok(LittleEndian::read_uint(&arena.bytes[range], size as usize))
    }

    /// Writes the low `size` bytes of `value`. Constancy is left untouched.
    pub fn store(&mut self, addr: u64, size: u64, value: u64) -> Result<(), OutOfBounds> {
        if !(1..=8).contains(&size) {
            return Err(OutOfBounds { addr, size });
        }
        let arena = self.arena_mut(addr).ok_or(OutOfBounds { addr, size })?;
        let range = arena.range(addr, size)?;
        let value = if size == 8 {
            value
        } else {
            value & ((1u64 << (size * 8)) - 1)
        };
        LittleEndian::write_uint(&mut arena.bytes[range], value, size as usize);
        Ok(())
    }

    pub fn read_bytes(&self, addr: u64, len: u64) -> Result<&[u8], OutOfBounds> {
        let arena = self.arena(addr).ok_or(OutOfBounds { addr, size: len })?;
        let range = arena.range(addr, len)?;
        Ok(&arena.bytes[range])
    }

    pub fn write_bytes(&mut self, addr: u64, data: &[u8]) -> Result<(), OutOfBounds> {
        let size = data.len() as u64;
        let arena = self.arena_mut(addr).ok_or(OutOfBounds { addr, size })?;
        let range = arena.range(addr, size)?;
        arena.bytes[range].copy_from_slice(data);
        Ok(())
    }

    pub fn set_constant(&mut self, addr: u64, size: u64, val: bool) -> Result<(), OutOfBounds> {
        if size == 0 {
            return Ok(());
        }
        let arena = self.arena_mut(addr).ok_or(OutOfBounds { addr, size })?;
        let range = arena.range(addr, size)?;
        arena.consts[range].fill(val);
        Ok(())
    }

    /// Clears the constancy of up to `len` bytes from `addr`. The range is cut
    /// at the end of the allocated part of the arena.
    pub fn clear_constant(&mut self, addr: u64, len: u64) {
        let Some(arena) = self.arena_mut(addr) else {
            return;
        };
        let Some(off) = arena.offset(addr) else {
            return;
        };
        let end = off
            .saturating_add(usize::try_from(len).unwrap_or(usize::MAX))
            .min(arena.consts.len());
        arena.consts[off..end].fill(false);
    }

    /// Returns `true` if every byte of the range is constant. Ranges outside
    /// the arenas are never constant.
    pub fn check_constant(&self, addr: u64, size: u64) -> bool {
        let Some(arena) = self.arena(addr) else {
            return false;
        };
        match arena.range(addr, size) {
            Ok(range) => size > 0 && arena.consts[range].iter().all(|c| *c),
            Err(_) => false,
        }
    }

    /// Copies `len` bytes together with their constancy from `src` to `dst`.
    pub fn copy_within(&mut self, dst: u64, src: u64, len: u64) -> Result<(), OutOfBounds> {
        if len == 0 {
            return Ok(());
        }
        let bytes = self.read_bytes(src, len)?.to_vec();
        let consts = {
            let arena = self.arena(src).ok_or(OutOfBounds { addr: src, size: len })?;
            arena.consts[arena.range(src, len)?].to_vec()
        };
        let arena = self.arena_mut(dst).ok_or(OutOfBounds { addr: dst, size: len })?;
        let range = arena.range(dst, len)?;
        arena.bytes[range.clone()].copy_from_slice(&bytes);
        arena.consts[range].copy_from_slice(&consts);
        Ok(())
    }

    /// Number of consecutive constant bytes starting at `addr`.
    pub fn size_contiguous(&self, addr: u64) -> u64 {
        let Some((arena, off)) = self.arena(addr).and_then(|a| Some((a, a.offset(addr)?))) else {
            return 0;
        };
        arena.consts[off..].iter().take_while(|c| **c).count() as u64
    }

    /// With `val == false`, clears the run of constant bytes starting at
    /// `addr`. With `val == true`, marks bytes constant up to and including
    /// the first zero byte.
    pub fn set_const_contiguous(&mut self, addr: u64, val: bool) {
        let Some(arena) = self.arena_mut(addr) else {
            return;
        };
        let Some(off) = arena.offset(addr) else {
            return;
        };

        for i in off..arena.bytes.len() {
            if val {
                arena.consts[i] = true;
                if arena.bytes[i] == 0 {
                    break;
                }
            } else {
                if !arena.consts[i] {
                    break;
                }
                arena.consts[i] = false;
            }
        }
    }

    /// Returns `true` if the constant run starting at `addr` reaches a zero
    /// byte, i.e. `addr` holds a fully known C string.
    pub fn check_const_contiguous(&self, addr: u64) -> bool {
        let Some((arena, off)) = self.arena(addr).and_then(|a| Some((a, a.offset(addr)?))) else {
            return false;
        };
        for i in off..arena.bytes.len() {
            if !arena.consts[i] {
                return false;
            }
            if arena.bytes[i] == 0 {
                return true;
            }
        }
        false
    }

    /// Unifies `self` with the memory of another path reaching the same point.
    pub fn compare_with(&mut self, other: &Memory) {
        self.stack.unify(&other.stack);
        self.heap.unify(&other.heap);
    }

    /// Replaces the whole state with `other`.
    pub fn copy_from(&mut self, other: &Memory) {
        self.clone_from(other);
    }

    /// Returns `true` if both memories have the same bump indices and agree on
    /// the constancy and value of every constant byte. Values of non-constant
    /// bytes are not facts and never count.
    pub fn context_match(&self, other: &Memory) -> bool {
        self.stack_index() == other.stack_index()
            && self.heap_index() == other.heap_index()
            && self.stack.same_facts(&other.stack)
            && self.heap.same_facts(&other.heap)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn store_load_little_endian() {
        let mut mem = Memory::new();
        let addr = mem.allocate_stack(8).unwrap();
        assert_eq!(addr, STACK_BASE);

        mem.store(addr, 4, 0x1122_3344_5566).unwrap();
        assert_eq!(mem.read_bytes(addr, 4).unwrap(), &[0x66, 0x55, 0x44, 0x33]);
        assert_eq!(mem.load(addr, 2).unwrap(), 0x5566);
        assert_eq!(mem.load(addr + 2, 2).unwrap(), 0x3344);
        assert!(!mem.check_constant(addr, 4));

        mem.set_constant(addr, 4, true).unwrap();
        assert!(mem.check_constant(addr, 4));
        assert!(!mem.check_constant(addr, 5));
    }

    #[test]
    fn out_of_bounds() {
        let mut mem = Memory::new();
        let addr = mem.allocate_heap(4).unwrap();
        assert_eq!(addr, HEAP_BASE);
        assert_eq!(
            mem.load(addr + 2, 4),
            Err(OutOfBounds {
                addr: addr + 2,
                size: 4
            })
        );
        assert!(mem.store(0, 1, 1).is_err());
        assert!(mem.load(u64::MAX - 1, 4).is_err());
        assert!(!mem.check_constant(addr + 4, 1));
        assert!(mem.set_constant(STACK_BASE, 1, true).is_err());
    }

    #[test]
    fn contiguous_runs() {
        let mut mem = Memory::new();
        let addr = mem.allocate_heap(8).unwrap();
        mem.write_bytes(addr, b"abc\0xyz\0").unwrap();

        mem.set_const_contiguous(addr, true);
        assert_eq!(mem.size_contiguous(addr), 4);
        assert!(mem.check_const_contiguous(addr));
        assert!(!mem.check_const_contiguous(addr + 4));

        mem.set_constant(addr + 4, 4, true).unwrap();
        assert_eq!(mem.size_contiguous(addr), 8);
        mem.set_constant(addr + 2, 1, false).unwrap();
        mem.set_const_contiguous(addr + 3, false);
        assert_eq!(mem.size_contiguous(addr), 2);
        assert_eq!(mem.size_contiguous(addr + 3), 0);
    }

    #[test]
    fn unify_is_byte_wise() {
        let mut a = Memory::new();
        let slot = a.allocate_stack(4).unwrap();
        a.store(slot, 4, 0x0403_0201).unwrap();
        a.set_constant(slot, 4, true).unwrap();

        let mut b = a.clone();
        b.store(slot + 1, 1, 0xff).unwrap();
        let extra = b.allocate_stack(2).unwrap();

        let mut ab = a.clone();
        ab.compare_with(&b);
        let mut ba = b.clone();
        ba.compare_with(&a);
        assert!(ab.context_match(&ba));
        assert!(!ab.context_match(&a));

        assert!(ab.check_constant(slot, 1));
        assert!(!ab.check_constant(slot + 1, 1));
        assert!(ab.check_constant(slot + 2, 2));
        assert!(ab.is_allocated(extra));
        assert!(!ab.check_constant(extra, 2));
    }

    #[test]
    fn copy_within_moves_constancy() {
        let mut mem = Memory::new();
        let src = mem.allocate_heap(4).unwrap();
        let dst = mem.allocate_heap(4).unwrap();
        mem.write_bytes(src, &[1, 2, 3, 4]).unwrap();
        mem.set_constant(src, 2, true).unwrap();

        mem.copy_within(dst, src, 4).unwrap();
        assert_eq!(mem.read_bytes(dst, 4).unwrap(), &[1, 2, 3, 4]);
        assert!(mem.check_constant(dst, 2));
        assert!(!mem.check_constant(dst + 2, 1));

        mem.clear_constant(dst, u64::MAX);
        assert!(!mem.check_constant(dst, 1));
        assert!(mem.check_constant(src, 2));
    }

    #[test]
    fn oversized_allocations_fail() {
        let mut mem = Memory::new();
        assert!(mem.allocate_stack(1 << 40).is_err());
        assert!(mem.allocate_heap(MAX_ALLOC + 1).is_err());
        assert_eq!(mem.stack_index(), 0);

        assert_eq!(mem.allocate_stack(8), Ok(STACK_BASE));
        assert!(mem.allocate_heap(8).is_ok());
    }

    #[test]
    fn stack_stays_below_heap() {
        let mut stack = Arena::new(STACK_BASE, STACK_BASE + 16);
        assert_eq!(stack.allocate(8), Ok(STACK_BASE));
        assert_eq!(stack.allocate(8), Ok(STACK_BASE + 8));
        assert!(stack.allocate(1).is_err());
    }

    #[test]
    fn func_addresses() {
        let f = FuncRef::new(5);
        let addr = func_addr(f);
        assert_eq!(addr_func(addr), Some(f));
        assert_eq!(addr_func(addr + 1), None);
        assert_eq!(addr_func(HEAP_BASE), None);
    }
}
