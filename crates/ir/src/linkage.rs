use std::{fmt, str::FromStr};

/// Linkage of functions and globals.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Linkage {
    /// Defined in the module and visible outside of it.
    Public,

    /// Defined in the module and only reachable from inside it.
    #[default]
    Private,

    /// Defined outside of the module, e.g. a library function.
    External,
}

impl Linkage {
    pub fn is_external(self) -> bool {
        matches!(self, Self::External)
    }
}

impl fmt::Display for Linkage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(match self {
            Self::Public => "public",
            Self::Private => "private",
            Self::External => "external",
        })
    }
}

impl FromStr for Linkage {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "public" => Ok(Self::Public),
            "private" => Ok(Self::Private),
            "external" => Ok(Self::External),
            _ => Err(()),
        }
    }
}
