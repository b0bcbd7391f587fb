//! CLI entry point for the mixture verifier.
//!
//! Subcommands:
//!   train    -- Train the two-tower verifier on WAV/FLAC corpora
//!   inspect  -- List the parameter names and shapes stored in a checkpoint

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use mixverify_core::{LoggingConfig, TrainConfig};
use mixverify_train::checkpoint::checkpoint_entries;
use mixverify_train::device::select_device;
use mixverify_train::{train, SymphoniaReader};
use std::path::PathBuf;
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "train-verifier", about = "Audio mixture verification trainer")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Train the verifier; flags override values from `--config`.
    Train(TrainArgs),

    /// Print every tensor name and shape in a checkpoint.
    Inspect {
        /// Checkpoint file (.safetensors).
        checkpoint: PathBuf,
    },
}

#[derive(Args)]
struct TrainArgs {
    /// YAML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// SGD learning rate.
    #[arg(long)]
    learning_rate: Option<f64>,

    /// Number of epochs.
    #[arg(long)]
    num_epochs: Option<usize>,

    /// Examples per minibatch.
    #[arg(long)]
    batch_size: Option<usize>,

    /// Training corpus directory.
    #[arg(long)]
    train_dir: Option<PathBuf>,

    /// Validation corpus directory.
    #[arg(long)]
    valid_dir: Option<PathBuf>,

    /// Test corpus directory.
    #[arg(long)]
    test_dir: Option<PathBuf>,

    /// Base random seed.
    #[arg(long)]
    seed: Option<u64>,

    /// Directory for checkpoints and logs.
    #[arg(long)]
    output_dir: Option<PathBuf>,

    /// Run name used for the checkpoint directory and log files.
    #[arg(long)]
    run_name: Option<String>,

    /// Batches synthesized ahead on a background thread (0 = inline).
    #[arg(long)]
    prefetch_batches: Option<usize>,

    /// Checkpoint to load before the first epoch.
    #[arg(long)]
    resume: Option<PathBuf>,

    /// Skip GPU probing.
    #[arg(long)]
    cpu: bool,
}

impl TrainArgs {
    fn into_config(self) -> anyhow::Result<(TrainConfig, Option<PathBuf>, bool)> {
        let mut config = match &self.config {
            Some(path) => TrainConfig::from_yaml_file(path)
                .with_context(|| format!("loading {}", path.display()))?,
            None => TrainConfig::default(),
        };

        if let Some(v) = self.learning_rate {
            config.learning_rate = v;
        }
        if let Some(v) = self.num_epochs {
            config.num_epochs = v;
        }
        if let Some(v) = self.batch_size {
            config.batch_size = v;
        }
        if let Some(v) = self.train_dir {
            config.train_dir = v;
        }
        if let Some(v) = self.valid_dir {
            config.valid_dir = v;
        }
        if let Some(v) = self.test_dir {
            config.test_dir = v;
        }
        if let Some(v) = self.seed {
            config.seed = v;
        }
        if let Some(v) = self.output_dir {
            config.output_dir = v;
        }
        if self.run_name.is_some() {
            config.run_name = self.run_name;
        }
        if let Some(v) = self.prefetch_batches {
            config.prefetch_batches = v;
        }

        config.validate().context("invalid configuration")?;
        Ok((config, self.resume, self.cpu))
    }
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if logging.format == "json" {
        builder.json().init();
    } else {
        builder.init();
    }
}

fn run_train(args: TrainArgs) -> anyhow::Result<()> {
    let (config, resume, force_cpu) = args.into_config()?;
    init_tracing(&config.logging);
    tracing::info!(
        run = %config.run_name(),
        learning_rate = config.learning_rate,
        num_epochs = config.num_epochs,
        batch_size = config.batch_size,
        "Starting training"
    );

    let device = select_device(force_cpu);
    let history = train(&config, Arc::new(SymphoniaReader), device, resume.as_deref())
        .context("training failed")?;

    for epoch in &history {
        let accs: Vec<String> = epoch
            .phases
            .iter()
            .map(|p| format!("{} {:.2}%", p.phase, p.accuracy_pct))
            .collect();
        println!(
            "epoch {:3} | {} | {}",
            epoch.epoch,
            accs.join(" | "),
            epoch.checkpoint.display()
        );
    }
    Ok(())
}

fn run_inspect(checkpoint: PathBuf) -> anyhow::Result<()> {
    init_tracing(&LoggingConfig::default());
    let entries = checkpoint_entries(&checkpoint)
        .with_context(|| format!("reading {}", checkpoint.display()))?;
    for (name, shape) in &entries {
        println!("{name:<60} {shape:?}");
    }
    println!("{} tensors", entries.len());
    Ok(())
}

fn main() {
    let cli = Cli::parse();

    let result = match cli.command {
        Command::Train(args) => run_train(args),
        Command::Inspect { checkpoint } => run_inspect(checkpoint),
    };

    if let Err(e) = result {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
}
