use ahash::AHashMap;
use clap::{Args, CommandFactory, Parser, Subcommand};
use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};
use moraine::bayes::progress::SamplingProgressObserver;
use moraine::bayes::report::render_summary;
use moraine::bayes::spec::Hypothesis;
use moraine::config::PipelineConfig;
use moraine::pipeline;
use std::io::IsTerminal;
use std::path::PathBuf;
use std::process;
use std::sync::Mutex;
use std::time::Duration;

#[derive(Parser)]
#[command(
    name = "moraine",
    version,
    about = "Bayesian multi-level models of glacial lake outburst flood occurrence",
    long_about = "Fits four hierarchical logistic models of GLOF occurrence (elevation-dependent \
                 warming, forecasting, mass balance and monsoonality) to a Himalayan lake \
                 inventory and reports effects, diagnostics and predictive skill."
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Prepare the data, fit the selected models and write their reports
    Run(RunArgs),

    /// Write the prepared dataset without fitting anything
    Prepare {
        #[command(flatten)]
        inputs: InputArgs,

        /// Destination of the prepared table (tab-separated)
        #[arg(long, value_name = "PATH", default_value = "prepared.tsv")]
        out: PathBuf,
    },

    /// Print every model's formula, row filter and priors
    Describe,
}

#[derive(Args)]
struct InputArgs {
    /// TOML configuration; defaults apply to every field it omits
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Lake inventory table (overrides [inputs] lakes)
    #[arg(long, value_name = "PATH")]
    lakes: Option<PathBuf>,

    /// Climate table (overrides [inputs] climate)
    #[arg(long, value_name = "PATH")]
    climate: Option<PathBuf>,
}

#[derive(Args)]
struct RunArgs {
    #[command(flatten)]
    inputs: InputArgs,

    /// Output directory (overrides [output] directory)
    #[arg(long, value_name = "DIR")]
    out: Option<PathBuf>,

    /// Comma-separated models: edw, forecasting, mass_balance, monsoonality
    #[arg(long, value_delimiter = ',')]
    models: Vec<String>,

    /// Number of chains (overrides [mcmc] chains)
    #[arg(long, value_name = "N")]
    chains: Option<usize>,

    /// Random seed (overrides [mcmc] seed)
    #[arg(long, value_name = "SEED")]
    seed: Option<u64>,
}

impl InputArgs {
    fn load(&self) -> Result<PipelineConfig, Box<dyn std::error::Error>> {
        let mut config = match &self.config {
            Some(path) => PipelineConfig::load(path)?,
            None => PipelineConfig::default(),
        };
        if let Some(lakes) = &self.lakes {
            config.inputs.lakes = lakes.clone();
        }
        if let Some(climate) = &self.climate {
            config.inputs.climate = climate.clone();
        }
        Ok(config)
    }
}

/// One bar per chain, grouped under a shared multi-bar display.
struct ChainProgressBars {
    multi: MultiProgress,
    bars: Mutex<AHashMap<(String, usize), ProgressBar>>,
}

impl ChainProgressBars {
    fn new() -> Self {
        let draw_target = if std::io::stderr().is_terminal() {
            ProgressDrawTarget::stderr_with_hz(10)
        } else {
            ProgressDrawTarget::hidden()
        };
        Self {
            multi: MultiProgress::with_draw_target(draw_target),
            bars: Mutex::new(AHashMap::new()),
        }
    }

    fn with_bar(&self, model: &str, chain: usize, f: impl FnOnce(&ProgressBar)) {
        if let Ok(bars) = self.bars.lock() {
            if let Some(bar) = bars.get(&(model.to_string(), chain)) {
                f(bar);
            }
        }
    }
}

impl SamplingProgressObserver for ChainProgressBars {
    fn on_chain_start(&self, model: &str, chain: usize, total_iterations: usize) {
        let bar = self.multi.add(ProgressBar::new_spinner());
        let style = ProgressStyle::with_template("> {spinner} {prefix:>16} [{elapsed_precise}] {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_spinner());
        bar.set_style(style);
        bar.set_prefix(format!("{model} #{chain}"));
        bar.set_message(format!("{total_iterations} iterations"));
        bar.enable_steady_tick(Duration::from_millis(120));
        if let Ok(mut bars) = self.bars.lock() {
            bars.insert((model.to_string(), chain), bar);
        }
    }

    fn on_chain_finish(&self, model: &str, chain: usize) {
        self.with_bar(model, chain, |bar| bar.finish_with_message("done"));
    }
}

fn run(args: RunArgs) -> Result<(), Box<dyn std::error::Error>> {
    let mut config = args.inputs.load()?;
    if let Some(out) = args.out {
        config.output.directory = out;
    }
    if !args.models.is_empty() {
        config.output.models = args.models;
    }
    if let Some(chains) = args.chains {
        config.mcmc.chains = chains;
    }
    if let Some(seed) = args.seed {
        config.mcmc.seed = seed;
    }

    let progress = ChainProgressBars::new();
    let runs = pipeline::run(&config, &progress)?;

    let mut failed = Vec::new();
    for model in &runs {
        match &model.outcome {
            Ok(outputs) => println!("{}", render_summary(&outputs.report)),
            Err(e) => {
                println!("{}: not fitted ({e})\n", model.hypothesis);
                failed.push(model.hypothesis.slug());
            }
        }
    }
    if failed.is_empty() {
        Ok(())
    } else {
        Err(format!("{} model(s) failed: {}", failed.len(), failed.join(", ")).into())
    }
}

fn prepare(inputs: InputArgs, out: PathBuf) -> Result<(), Box<dyn std::error::Error>> {
    let config = inputs.load()?;
    let prepared = pipeline::prepare(&config)?;
    pipeline::write_frame(&prepared.frame, &out)?;
    for (column, scale) in &prepared.summary.scales {
        println!(
            "{column:<32} mean {:>10.4}  sd {:>10.4}",
            scale.mean, scale.sd
        );
    }
    Ok(())
}

fn describe() {
    for hypothesis in Hypothesis::ALL {
        let spec = hypothesis.spec();
        println!("{} ({})", hypothesis, spec.formula());
        println!("  rows: {:?}", spec.row_filter());
        for (class, prior) in spec.prior_table() {
            println!("  {class:<40} ~ {prior}");
        }
        println!();
    }
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let Cli { command } = Cli::parse();

    let result = match command {
        Some(Commands::Run(args)) => run(args),
        Some(Commands::Prepare { inputs, out }) => prepare(inputs, out),
        Some(Commands::Describe) => {
            describe();
            Ok(())
        }
        None => {
            let _ = Cli::command().print_help();
            println!();
            Ok(())
        }
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        process::exit(1);
    }
}
