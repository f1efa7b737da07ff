//! Facts attached to functions and call sites by upstream passes.
//!
//! The engine treats everything here as input data. Context-object ids are
//! assigned by an allocation-site analysis that runs before the engine.
use rustc_hash::{FxHashMap, FxHashSet};
use smallvec::SmallVec;

use crate::{BlockId, InstId};

/// How a call site touches a context object.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallSiteEffect {
    pub ctx_id: u32,
    pub is_read: bool,
    pub is_write: bool,
    pub is_malloc: bool,
}

impl CallSiteEffect {
    pub fn read(ctx_id: u32) -> Self {
        Self {
            ctx_id,
            is_read: true,
            is_write: false,
            is_malloc: false,
        }
    }

    pub fn write(ctx_id: u32) -> Self {
        Self {
            ctx_id,
            is_read: false,
            is_write: true,
            is_malloc: false,
        }
    }

    pub fn malloc(ctx_id: u32) -> Self {
        Self {
            ctx_id,
            is_read: false,
            is_write: false,
            is_malloc: true,
        }
    }
}

/// Byte range of a context object a function may modify.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ModRange {
    pub ctx_id: u32,
    pub start: u64,
    pub end: u64,
}

impl ModRange {
    pub fn untouched(ctx_id: u32) -> Self {
        Self {
            ctx_id,
            start: u64::MAX,
            end: 0,
        }
    }

    pub fn whole(ctx_id: u32) -> Self {
        Self {
            ctx_id,
            start: 0,
            end: u64::MAX,
        }
    }

    pub fn is_untouched(&self) -> bool {
        self.start == u64::MAX && self.end == 0
    }

    pub fn is_unbounded(&self) -> bool {
        self.start == 0 && self.end == u64::MAX
    }
}

#[derive(Debug, Clone, Default)]
pub struct FuncMeta {
    pub call_effects: FxHashMap<InstId, SmallVec<[CallSiteEffect; 4]>>,
    /// Allocation calls that create a context object.
    pub alloc_sites: FxHashMap<InstId, u32>,
    pub mod_ranges: Vec<ModRange>,
    /// Loop headers flagged for forced unrolling.
    pub unroll_hints: FxHashSet<BlockId>,
    /// Call sites copied by unrolling, mapped to the site they were copied from.
    pub site_origin: FxHashMap<InstId, InstId>,
}

impl FuncMeta {
    pub fn call_effects(&self, inst: InstId) -> &[CallSiteEffect] {
        self.call_effects
            .get(&inst)
            .map(|effects| effects.as_slice())
            .unwrap_or(&[])
    }

    pub fn alloc_site(&self, inst: InstId) -> Option<u32> {
        self.alloc_sites.get(&inst).copied()
    }

    pub fn mod_range(&self, ctx_id: u32) -> Option<ModRange> {
        self.mod_ranges.iter().find(|r| r.ctx_id == ctx_id).copied()
    }

    pub fn writes_ctx_object(&self, ctx_id: u32) -> bool {
        self.mod_range(ctx_id).is_some_and(|r| !r.is_untouched())
    }

    /// Follows copy links back to the call site that existed before unrolling.
    pub fn origin_site(&self, inst: InstId) -> InstId {
        let mut cur = inst;
        while let Some(&prev) = self.site_origin.get(&cur) {
            cur = prev;
        }
        cur
    }

    /// Makes `to` carry the same call-site facts as `from`.
    pub fn copy_site(&mut self, from: InstId, to: InstId) {
        if let Some(effects) = self.call_effects.get(&from).cloned() {
            self.call_effects.insert(to, effects);
        }
        if let Some(id) = self.alloc_site(from) {
            self.alloc_sites.insert(to, id);
        }
        self.site_origin.insert(to, from);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mod_range_kinds() {
        assert!(ModRange::untouched(1).is_untouched());
        assert!(!ModRange::untouched(1).is_unbounded());
        assert!(ModRange::whole(1).is_unbounded());

        let mut meta = FuncMeta::default();
        meta.mod_ranges.push(ModRange::untouched(3));
        meta.mod_ranges.push(ModRange {
            ctx_id: 4,
            start: 8,
            end: 16,
        });
        assert!(!meta.writes_ctx_object(3));
        assert!(meta.writes_ctx_object(4));
        assert!(!meta.writes_ctx_object(5));
    }

    #[test]
    fn copied_sites_resolve_to_origin() {
        let mut meta = FuncMeta::default();
        let site = InstId(3);
        meta.call_effects
            .insert(site, [CallSiteEffect::read(7)].into_iter().collect());

        meta.copy_site(site, InstId(10));
        meta.copy_site(InstId(10), InstId(20));
        assert_eq!(meta.origin_site(InstId(20)), site);
        assert_eq!(meta.call_effects(InstId(20)), &[CallSiteEffect::read(7)]);
        assert!(meta.call_effects(InstId(4)).is_empty());
    }
}
