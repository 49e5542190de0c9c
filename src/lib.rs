//! Intraprocedural double-free and use-after-free detection.
//!
//! Per function:
//! 1. validate the IR
//! 2. flow-insensitive points-to analysis, frozen into an alias oracle
//! 3. allocation-state fixpoint by chaotic iteration over the instruction CFG
//! 4. read-only checkers over the converged In states

pub mod cfg;
pub mod config;
pub mod dataflow;
pub mod detector;
pub mod domain;
pub mod error;
pub mod ir;
pub mod pointer_analysis;
pub mod transfer;
pub mod util;

use log::{debug, info, log_enabled, trace, Level};
use serde::Serialize;
use std::collections::BTreeSet;
use std::fmt;

pub use config::{AnalysisConfig, CallClassifier};
pub use error::{AnalysisError, Result};

use cfg::Cfg;
use dataflow::ChaoticIteration;
use detector::{DetectorContext, DoubleFreeDetector, NullDerefDetector, UseAfterFreeDetector};
use ir::{Function, InstId, Module, SourceLoc};
use pointer_analysis::{PointerAnalysis, PointsToInfo};
use transfer::AllocStateTransfer;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Category {
    DoubleFree,
    UseAfterFree,
    NullDereference,
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Category::DoubleFree => "double-free",
            Category::UseAfterFree => "use-after-free",
            Category::NullDereference => "null-dereference",
        };
        f.write_str(s)
    }
}

/// One flagged instruction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Diagnostic {
    pub function: String,
    pub inst: InstId,
    pub category: Category,
    /// Rendered instruction.
    pub text: String,
    pub loc: Option<SourceLoc>,
}

impl fmt::Display for Diagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}\t{}\t{}\t", self.function, self.category, self.text)?;
        match self.loc {
            Some(loc) => write!(f, "{}", loc),
            None => write!(f, "-"),
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct AnalysisResult {
    pub function: String,
    pub double_free: BTreeSet<InstId>,
    pub use_after_free: BTreeSet<InstId>,
    pub null_deref: BTreeSet<InstId>,
    pub points_to: PointsToInfo,
    /// False if the allocation-state fixpoint hit `max_iterations`.
    pub converged: bool,
    diagnostics: Vec<Diagnostic>,
}

impl AnalysisResult {
    pub fn flagged(&self, category: Category) -> &BTreeSet<InstId> {
        match category {
            Category::DoubleFree => &self.double_free,
            Category::UseAfterFree => &self.use_after_free,
            Category::NullDereference => &self.null_deref,
        }
    }

    /// Every flagged instruction, ordered by instruction then category.
    pub fn diagnostics(&self) -> &[Diagnostic] {
        &self.diagnostics
    }

    pub fn is_clean(&self) -> bool {
        self.double_free.is_empty() && self.use_after_free.is_empty() && self.null_deref.is_empty()
    }
}

pub fn analyze_function(func: &Function, config: &AnalysisConfig) -> Result<AnalysisResult> {
    let classifier = config.classifier()?;
    analyze_with(func, config, &classifier)
}

/// Analyzes every function with a body; declarations are skipped.
pub fn analyze_module(module: &Module, config: &AnalysisConfig) -> Result<Vec<AnalysisResult>> {
    let classifier = config.classifier()?;
    let mut results = Vec::new();
    for func in module.functions.iter() {
        if func.is_declaration() {
            debug!("skipping declaration {}", func.name);
            continue;
        }
        results.push(analyze_with(func, config, &classifier)?);
    }
    info!(
        "{}: analyzed {} functions, {} findings",
        module.name,
        results.len(),
        results.iter().map(|r| r.diagnostics.len()).sum::<usize>()
    );
    Ok(results)
}

/// Graphviz rendering of a function's block CFG.
pub fn render_cfg(func: &Function) -> Result<String> {
    func.validate()?;
    Ok(Cfg::new(func).dot(func))
}

pub fn analyze_with(
    func: &Function,
    config: &AnalysisConfig,
    classifier: &CallClassifier,
) -> Result<AnalysisResult> {
    if func.is_declaration() {
        return Ok(AnalysisResult {
            function: func.name.clone(),
            converged: true,
            ..AnalysisResult::default()
        });
    }
    func.validate()?;
    debug!(
        "analyzing {}: {} blocks, {} instructions",
        func.name,
        func.blocks.len(),
        func.insts.len()
    );

    let cfg = Cfg::new(func);
    let points_to = PointerAnalysis::new(func, config.max_points_to_passes).analyze();
    debug!(
        "{}: {} points-to facts after {} passes",
        func.name,
        points_to.fact_count(),
        points_to.passes()
    );

    let transfer = AllocStateTransfer::new(func, &points_to, classifier, config.trace_depth);
    let states = ChaoticIteration::new(func, &cfg, transfer, config.max_iterations).run();
    if log_enabled!(Level::Trace) {
        for inst in func.inst_ids() {
            trace!(
                "{:>24}  in {}  out {}",
                func.render(inst),
                states.input(inst).render(func),
                states.output(inst).render(func)
            );
        }
    }

    let cx = DetectorContext {
        func,
        cfg: &cfg,
        points_to: &points_to,
        states: &states,
        classifier,
        trace_depth: config.trace_depth,
    };
    let double_free = DoubleFreeDetector::new(&cx).analyze();
    let use_after_free = UseAfterFreeDetector::new(&cx).analyze();
    let null_deref = NullDerefDetector::new(&cx).analyze();

    let mut diagnostics = Vec::new();
    for inst in func.inst_ids() {
        for (category, set) in [
            (Category::DoubleFree, &double_free),
            (Category::UseAfterFree, &use_after_free),
            (Category::NullDereference, &null_deref),
        ] {
            if set.contains(&inst) {
                diagnostics.push(Diagnostic {
                    function: func.name.clone(),
                    inst,
                    category,
                    text: func.render(inst),
                    loc: func.inst(inst).loc,
                });
            }
        }
    }
    debug!(
        "{}: {} double free, {} use after free, {} null dereference",
        func.name,
        double_free.len(),
        use_after_free.len(),
        null_deref.len()
    );

    Ok(AnalysisResult {
        function: func.name.clone(),
        double_free,
        use_after_free,
        null_deref,
        points_to,
        converged: states.converged,
        diagnostics,
    })
}
