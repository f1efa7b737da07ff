use std::{env, fs, path::PathBuf, time::Duration};

use rustc_hash::FxHashSet;

use crate::{
    error::{EngineError, Result},
    trace::TraceCategories,
};

/// Environment variable holding `+` separated trace categories.
pub const DEBUG_ENV: &str = "DEBLOAT_DEBUG";

/// Environment variable pointing at the installation holding
/// `data/readOnlyFuncs.txt`.
pub const HOME_ENV: &str = "DEBLOAT_HOME";

const READ_ONLY_LIST: &str = "data/readOnlyFuncs.txt";

#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Maximum number of clones made from one function. `None` is unlimited.
    pub clone_limit: Option<u32>,
    /// Calls nested deeper than this are treated opaquely.
    pub max_call_depth: usize,

    pub unroll_loops: bool,
    /// Number of loop body copies made by one unroll test.
    pub unroll_factor: u32,
    /// Wall-clock budget of one unroll test.
    pub unroll_time_budget: Duration,
    /// Loops without an unroll hint are only tried if the unrolled body stays
    /// below this many instructions.
    pub max_unrolled_insts: usize,

    pub simplify_indirect_calls: bool,
    /// Stop specializing at the first `fork` or `pthread*` call.
    pub abort_on_fork: bool,
    /// Treat the initializers of mutable globals as known at entry.
    pub trust_global_initializers: bool,

    /// File listing library functions that never write through their
    /// arguments, one name per line.
    pub read_only_list: Option<PathBuf>,
    pub trace: TraceCategories,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            clone_limit: None,
            max_call_depth: 64,

            unroll_loops: true,
            unroll_factor: 64,
            unroll_time_budget: Duration::from_secs(10),
            max_unrolled_insts: 16384,

            simplify_indirect_calls: true,
            abort_on_fork: true,
            trust_global_initializers: false,

            read_only_list: None,
            trace: TraceCategories::NONE,
        }
    }
}

impl EngineConfig {
    /// Layers `DEBLOAT_DEBUG` and `DEBLOAT_HOME` over the defaults.
    pub fn from_env() -> Self {
        let debug = env::var(DEBUG_ENV).ok();
        let home = env::var(HOME_ENV).ok();
        Self::default().with_vars(debug.as_deref(), home.as_deref())
    }

    pub fn with_vars(mut self, debug: Option<&str>, home: Option<&str>) -> Self {
        if let Some(debug) = debug {
            self.trace = TraceCategories::parse(debug);
        }
        if let Some(home) = home {
            self.read_only_list = Some(PathBuf::from(home).join(READ_ONLY_LIST));
        }
        self
    }

    /// Reads the read-only function list. No configured list is an empty set.
    pub fn load_read_only_list(&self) -> Result<FxHashSet<String>> {
        let Some(path) = &self.read_only_list else {
            return Ok(FxHashSet::default());
        };

        let text = fs::read_to_string(path).map_err(|source| EngineError::ReadOnlyList {
            path: path.clone(),
            source,
        })?;
        Ok(text
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(String::from)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use super::*;
    use crate::trace::TraceCategory;

    #[test]
    fn vars_override_defaults() {
        let config = EngineConfig::default().with_vars(Some("call+modref"), Some("/opt/debloat"));
        assert!(config.trace.contains(TraceCategory::Call));
        assert!(config.trace.contains(TraceCategory::ModRef));
        assert!(!config.trace.contains(TraceCategory::Ctx));
        assert_eq!(
            config.read_only_list.as_deref(),
            Some(Path::new("/opt/debloat/data/readOnlyFuncs.txt"))
        );

        let config = EngineConfig::default().with_vars(None, None);
        assert!(config.trace.is_empty());
        assert!(config.read_only_list.is_none());
    }

    #[test]
    fn read_only_list() {
        let dir = env::temp_dir().join(format!("debloat-ro-{}", std::process::id()));
        fs::create_dir_all(dir.join("data")).unwrap();
        fs::write(dir.join(READ_ONLY_LIST), "strlen\n\n  puts \nprintf\n").unwrap();

        let config = EngineConfig::default().with_vars(None, dir.to_str());
        let names = config.load_read_only_list().unwrap();
        assert_eq!(names.len(), 3);
        assert!(names.contains("puts"));

        let config = EngineConfig {
            read_only_list: Some(dir.join("missing.txt")),
            ..EngineConfig::default()
        };
        assert!(matches!(
            config.load_read_only_list(),
            Err(EngineError::ReadOnlyList { .. })
        ));
        fs::remove_dir_all(dir).unwrap();
    }
}
