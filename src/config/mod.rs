//! Analysis configuration.
//!
//! Which callees allocate or release heap memory, plus the bounds used by
//! the fixpoints. Loadable from TOML:
//!
//! ```toml
//! allocators = ["malloc", "calloc", "realloc", "xmalloc"]
//! deallocators = ["free"]
//! deallocator_patterns = ["^g_free$", "_destroy$"]
//! trace_depth = 4
//! ```

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Deserialize;
use std::collections::HashSet;
use std::path::Path;

use crate::error::{AnalysisError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HeapApi {
    Alloc,
    Dealloc,
}

/// `@free`, `free@GLIBC_2.2.5`, `free.3` all name `free`.
static CALLEE_NAME_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^@?([^@]+?)(?:@.*|\.\d+)?$").unwrap());

/// Symbol name with frontend decorations removed.
pub fn undecorate(callee: &str) -> &str {
    CALLEE_NAME_REGEX
        .captures(callee)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str())
        .unwrap_or(callee)
}

pub const DEFAULT_CONFIG_FILE_NAME: &str = "free-detector.toml";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AnalysisConfig {
    pub allocators: Vec<String>,
    pub deallocators: Vec<String>,
    pub allocator_patterns: Vec<String>,
    pub deallocator_patterns: Vec<String>,
    /// Steps walked through casts, indexed addresses and phis when resolving a pointer.
    pub trace_depth: usize,
    /// Worklist pops per function before the allocation-state analysis gives up.
    pub max_iterations: usize,
    pub max_points_to_passes: usize,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            allocators: vec!["malloc".into(), "calloc".into(), "realloc".into()],
            deallocators: vec!["free".into()],
            allocator_patterns: Vec::new(),
            deallocator_patterns: Vec::new(),
            trace_depth: 4,
            max_iterations: 100000,
            max_points_to_passes: 1000,
        }
    }
}

impl AnalysisConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        toml::from_str(raw).map_err(|e| AnalysisError::config(e.to_string()))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_toml_str(&raw)
    }

    pub fn classifier(&self) -> Result<CallClassifier> {
        CallClassifier::new(self)
    }
}

/// Decides whether a callee name is a known allocator or deallocator.
#[derive(Debug, Clone)]
pub struct CallClassifier {
    allocators: HashSet<String>,
    deallocators: HashSet<String>,
    allocator_patterns: Vec<Regex>,
    deallocator_patterns: Vec<Regex>,
}

impl CallClassifier {
    pub fn new(config: &AnalysisConfig) -> Result<Self> {
        let compile = |patterns: &[String]| -> Result<Vec<Regex>> {
            patterns
                .iter()
                .map(|p| {
                    Regex::new(p)
                        .map_err(|e| AnalysisError::config(format!("bad pattern `{}`: {}", p, e)))
                })
                .collect()
        };
        Ok(Self {
            allocators: config.allocators.iter().cloned().collect(),
            deallocators: config.deallocators.iter().cloned().collect(),
            allocator_patterns: compile(&config.allocator_patterns)?,
            deallocator_patterns: compile(&config.deallocator_patterns)?,
        })
    }

    pub fn classify(&self, callee: &str) -> Option<HeapApi> {
        let callee = undecorate(callee);
        if self.is_deallocator(callee) {
            Some(HeapApi::Dealloc)
        } else if self.is_allocator(callee) {
            Some(HeapApi::Alloc)
        } else {
            None
        }
    }

    pub fn is_allocator(&self, callee: &str) -> bool {
        let callee = undecorate(callee);
        self.allocators.contains(callee)
            || self.allocator_patterns.iter().any(|re| re.is_match(callee))
    }

    pub fn is_deallocator(&self, callee: &str) -> bool {
        let callee = undecorate(callee);
        self.deallocators.contains(callee)
            || self.deallocator_patterns.iter().any(|re| re.is_match(callee))
    }
}

#[cfg(test)]
mod tests {
    use test_log::test;

    use super::*;

    #[test]
    fn test_default_names() {
        let classifier = AnalysisConfig::default().classifier().unwrap();
        assert_eq!(classifier.classify("malloc"), Some(HeapApi::Alloc));
        assert_eq!(classifier.classify("realloc"), Some(HeapApi::Alloc));
        assert_eq!(classifier.classify("free"), Some(HeapApi::Dealloc));
        assert_eq!(classifier.classify("freeze"), None);
        assert_eq!(classifier.classify("printf"), None);

        assert!(classifier.is_deallocator("@free"));
        assert!(classifier.is_deallocator("free@GLIBC_2.2.5"));
        assert!(classifier.is_allocator("malloc.1"));
        assert!(!classifier.is_allocator("xmalloc"));
    }

    #[test]
    fn test_undecorate() {
        assert_eq!(undecorate("@malloc"), "malloc");
        assert_eq!(undecorate("free@PLT"), "free");
        assert_eq!(undecorate("foo.12"), "foo");
        assert_eq!(undecorate("foo.bar"), "foo.bar");
        assert_eq!(undecorate("plain"), "plain");
    }

    #[test]
    fn test_toml_overrides_names() {
        let config = AnalysisConfig::from_toml_str(
            r#"
            allocators = ["xmalloc"]
            deallocator_patterns = ["_destroy$"]
            trace_depth = 2
            "#,
        )
        .unwrap();
        assert_eq!(config.trace_depth, 2);
        assert_eq!(config.deallocators, vec!["free".to_string()]);
        let classifier = config.classifier().unwrap();
        assert!(classifier.is_allocator("xmalloc"));
        assert!(!classifier.is_allocator("malloc"));
        assert!(classifier.is_deallocator("list_destroy"));
        assert!(classifier.is_deallocator("free"));
    }

    #[test]
    fn test_bad_pattern_is_config_error() {
        let config = AnalysisConfig {
            deallocator_patterns: vec!["(".to_string()],
            ..AnalysisConfig::default()
        };
        assert!(matches!(config.classifier(), Err(AnalysisError::Config(_))));
        assert!(matches!(
            AnalysisConfig::from_toml_str("trace_depth = \"deep\""),
            Err(AnalysisError::Config(_))
        ));
    }
}
