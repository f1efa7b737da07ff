//! Debug trace categories.
//!
//! Every category logs to its own target at `trace` level, e.g. `debloat::ctx`.
//! A category is only emitted when it is enabled in [`TraceCategories`].
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TraceCategory {
    Mem,
    Ctx,
    Eval,
    Call,
    Loop,
    ModRef,
}

impl TraceCategory {
    pub const ALL: [TraceCategory; 6] = [
        Self::Mem,
        Self::Ctx,
        Self::Eval,
        Self::Call,
        Self::Loop,
        Self::ModRef,
    ];

    pub fn target(self) -> &'static str {
        match self {
            Self::Mem => "debloat::mem",
            Self::Ctx => "debloat::ctx",
            Self::Eval => "debloat::eval",
            Self::Call => "debloat::call",
            Self::Loop => "debloat::loop",
            Self::ModRef => "debloat::modref",
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Mem => "mem",
            Self::Ctx => "ctx",
            Self::Eval => "eval",
            Self::Call => "call",
            Self::Loop => "loop",
            Self::ModRef => "modref",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|cat| cat.name() == name)
    }

    fn bit(self) -> u8 {
        1 << self as u8
    }
}

impl fmt::Display for TraceCategory {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A set of enabled trace categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct TraceCategories(u8);

impl TraceCategories {
    pub const NONE: Self = Self(0);
    pub const ALL: Self = Self(0b11_1111);

    pub fn with(self, cat: TraceCategory) -> Self {
        Self(self.0 | cat.bit())
    }

    pub fn contains(self, cat: TraceCategory) -> bool {
        self.0 & cat.bit() != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    /// Parses a `+` separated list such as `ctx+loop`. `all` enables every
    /// category, unknown names are ignored.
    pub fn parse(spec: &str) -> Self {
        let mut cats = Self::NONE;
        for name in spec.split('+').map(str::trim) {
            if name == "all" {
                return Self::ALL;
            }
            if let Some(cat) = TraceCategory::from_name(name) {
                cats = cats.with(cat);
            }
        }
        cats
    }
}

/// Emits a `trace` record on the category's target if the category is enabled.
macro_rules! trace_at {
    ($cats:expr, $cat:expr, $($arg:tt)+) => {{
        let cat: $crate::trace::TraceCategory = $cat;
        if $cats.contains(cat) {
            log::trace!(target: cat.target(), $($arg)+);
        }
    }};
}

pub(crate) use trace_at;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_categories() {
        let cats = TraceCategories::parse("ctx+loop+bogus");
        assert!(cats.contains(TraceCategory::Ctx));
        assert!(cats.contains(TraceCategory::Loop));
        assert!(!cats.contains(TraceCategory::Mem));

        assert_eq!(TraceCategories::parse("mem+all"), TraceCategories::ALL);
        assert!(TraceCategories::parse("").is_empty());
        for cat in TraceCategory::ALL {
            assert!(TraceCategories::ALL.contains(cat));
        }
    }
}
