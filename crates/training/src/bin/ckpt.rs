use std::path::PathBuf;

use clap::{Parser, Subcommand};
use training::{
    checkpoint::{self, DEFAULT_EXTENSION, DEFAULT_TAG},
    CheckpointStore, ConfigOverride, ExperimentConfig, OptimizerBuilder, RunContext, TrainingError,
};

fn main() {
    if let Err(err) = run() {
        eprintln!("textgen-ckpt failed: {}", err);
        std::process::exit(1);
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Inspect training checkpoints and configs", long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List the surviving checkpoints of an experiment.
    List {
        #[arg(long, value_name = "DIR", help = "Experiment checkpoint directory")]
        dir: PathBuf,
        #[arg(long, value_name = "STEM", help = "Experiment filename stem")]
        name: String,
        #[arg(long, default_value = DEFAULT_TAG)]
        tag: String,
        #[arg(long, default_value = DEFAULT_EXTENSION)]
        extension: String,
    },
    /// Print one checkpoint record, following a best pointer if needed.
    Show {
        #[arg(value_name = "PATH")]
        path: PathBuf,
    },
    /// Validate a config and print what it resolves to.
    CheckConfig {
        #[arg(short, long, value_name = "PATH", help = "Path to experiment config file")]
        config: PathBuf,
        #[arg(
            long = "override",
            value_name = "KEY=VALUE",
            help = "Override configuration value using dot-separated paths"
        )]
        overrides: Vec<ConfigOverride>,
    },
}

fn init_logging(level: &str) {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level))
        .try_init();
}

fn run() -> Result<(), TrainingError> {
    let args = Args::parse();
    match args.command {
        Command::List {
            dir,
            name,
            tag,
            extension,
        } => {
            init_logging("info");
            list(dir, name, tag, extension)
        }
        Command::Show { path } => {
            init_logging("info");
            show(path)
        }
        Command::CheckConfig { config, overrides } => check_config(config, &overrides),
    }
}

fn list(dir: PathBuf, name: String, tag: String, extension: String) -> Result<(), TrainingError> {
    let ctx = RunContext::local();
    let store = CheckpointStore::new(dir, name, usize::MAX, ctx).with_naming(tag, extension);

    let best = store.surviving_best()?;

    let serials = store.list()?;
    if serials.is_empty() {
        println!("no checkpoints in {}", store.directory().display());
        return Ok(());
    }
    for serial in serials {
        let marker = if Some(serial) == best { "*" } else { " " };
        match store.load(&store.record_path(serial))? {
            Some(record) => println!("{marker} {serial:>4}  {}", record.summary),
            None => println!("{marker} {serial:>4}  <unreadable>"),
        }
    }
    Ok(())
}

fn show(path: PathBuf) -> Result<(), TrainingError> {
    let ctx = RunContext::local();
    let Some(record) = checkpoint::load_from(&path, &ctx)? else {
        return Err(TrainingError::checkpoint(format!(
            "no checkpoint record at {}",
            path.display()
        )));
    };
    let best_score = record
        .best_valid_score
        .map(|score| format!("{score:.4}"))
        .unwrap_or_else(|| "none".to_string());

    println!("experiment:      {}", record.config.experiment.filename());
    println!("epoch:           {}", record.epoch);
    println!(
        "timestamp:       train_step={} train_epoch={} valid_epoch={}",
        record.timestamp.train_step, record.timestamp.train_epoch, record.timestamp.valid_epoch
    );
    println!("stopping count:  {}", record.stopping_count);
    println!(
        "best score:      {best_score} (valid epoch {})",
        record.best_valid_timestamp.valid_epoch
    );
    println!("summary:         {}", record.summary);
    println!("config sha256:   {}", record.config_sha256);
    Ok(())
}

fn check_config(path: PathBuf, overrides: &[ConfigOverride]) -> Result<(), TrainingError> {
    let config = ExperimentConfig::from_path_unvalidated(&path)?.with_overrides(overrides)?;
    init_logging(&config.logging.level);
    config.validate()?;

    let plan = OptimizerBuilder::new(&config.optimizer).plan();
    if plan.fell_back {
        println!(
            "optimizer:       {} (requested '{}' is unknown)",
            plan.kind.name(),
            plan.requested
        );
    } else {
        println!("optimizer:       {}", plan.kind.name());
    }
    println!("learning rate:   {}", plan.learning_rate);
    println!(
        "scheduler:       {}",
        plan.scheduler.map_or("none", |kind| kind.name())
    );
    match (plan.grad_clip, plan.clip_disabled) {
        (Some(norm), _) => println!("grad clip:       {norm}"),
        (None, true) => println!("grad clip:       disabled for {}", plan.kind.name()),
        (None, false) => println!("grad clip:       none"),
    }

    let store = CheckpointStore::from_config(&config, RunContext::local());
    println!("checkpoint dir:  {}", store.directory().display());
    println!("first record:    {}", store.record_path(1).display());
    println!("best pointer:    {}", store.best_path().display());
    println!("keeping:         {} checkpoint(s)", store.max_keep());
    println!("fingerprint:     {}", config.fingerprint()?);
    Ok(())
}
