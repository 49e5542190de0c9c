use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use clap::{ArgAction, Parser, ValueEnum};
use log::{debug, LevelFilter};
use serde::Deserialize;
use simplelog::{ColorChoice, ConfigBuilder, TermLogger, TerminalMode};

use free_detector::config::DEFAULT_CONFIG_FILE_NAME;
use free_detector::ir::{Function, Module};
use free_detector::{analyze_module, render_cfg, AnalysisConfig, Category};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum DetectorType {
    /// double free
    Df,
    /// use after free
    Uaf,
    /// null dereference
    Null,
    All,
}

impl DetectorType {
    fn reports(self, category: Category) -> bool {
        match self {
            DetectorType::Df => category == Category::DoubleFree,
            DetectorType::Uaf => category == Category::UseAfterFree,
            DetectorType::Null => category == Category::NullDereference,
            DetectorType::All => true,
        }
    }
}

#[derive(Debug, Parser)]
#[command(version, about = "Double-free and use-after-free detection on a typed SSA IR")]
struct Cli {
    /// JSON-serialised modules or functions
    #[arg(required = true)]
    inputs: Vec<PathBuf>,

    /// TOML analysis configuration; defaults to ./free-detector.toml if present
    #[arg(long)]
    config: Option<PathBuf>,

    #[arg(long, value_enum, env = "DETECTOR_TYPE", default_value = "all", ignore_case = true)]
    detector: DetectorType,

    /// Print each function's CFG in Graphviz format instead of analysing it
    #[arg(long)]
    dot: bool,

    /// -v for debug, -vv for trace
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Input {
    Module(Module),
    Function(Function),
}

fn load_config(path: Option<&Path>) -> anyhow::Result<AnalysisConfig> {
    match path {
        Some(path) => AnalysisConfig::load(path)
            .with_context(|| format!("failed to load config {}", path.display())),
        None => {
            let default = Path::new(DEFAULT_CONFIG_FILE_NAME);
            if default.exists() {
                AnalysisConfig::load(default)
                    .with_context(|| format!("failed to load config {}", default.display()))
            } else {
                Ok(AnalysisConfig::default())
            }
        }
    }
}

fn load_module(path: &Path) -> anyhow::Result<Module> {
    let raw = fs::read_to_string(path).with_context(|| format!("failed to read {}", path.display()))?;
    let input: Input =
        serde_json::from_str(&raw).with_context(|| format!("{} is not a module or function", path.display()))?;
    Ok(match input {
        Input::Module(module) => module,
        Input::Function(func) => Module {
            name: path.display().to_string(),
            functions: vec![func],
        },
    })
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Debug,
        _ => LevelFilter::Trace,
    };
    TermLogger::init(
        level,
        ConfigBuilder::new().set_time_level(LevelFilter::Off).build(),
        TerminalMode::Stderr,
        ColorChoice::Auto,
    )?;

    let config = load_config(cli.config.as_deref())?;
    debug!("{:?}", config);

    for path in cli.inputs.iter() {
        let module = load_module(path)?;
        if cli.dot {
            for func in module.functions.iter().filter(|f| !f.is_declaration()) {
                println!("// {}", func.name);
                let dot = render_cfg(func).with_context(|| format!("failed to render {}", path.display()))?;
                println!("{}", dot);
            }
            continue;
        }
        let results = match analyze_module(&module, &config) {
            Ok(results) => results,
            Err(e) if e.is_malformed_input() => bail!("{}: {}", path.display(), e),
            Err(e) => return Err(e).with_context(|| format!("failed to analyze {}", path.display())),
        };
        for result in results.iter() {
            for diagnostic in result.diagnostics() {
                if cli.detector.reports(diagnostic.category) {
                    println!("{}", diagnostic);
                }
            }
        }
    }
    Ok(())
}
