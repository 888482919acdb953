//! LeNet evaluation driver: classifies the MNIST test split and prints the
//! error rate and confusion matrix.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use pico_cnn::backend::Backend;
use pico_cnn::config::{EvalConfig, RunConfig};
use pico_cnn::dataset::Dataset;
use pico_cnn::eval::{Evaluation, evaluate, evaluate_parallel};
use pico_cnn::modelio::load_weights;
use pico_cnn::network::{Network, NetworkSpec};
use pico_cnn::ops::dispatch::Executor;

#[derive(Parser)]
#[command(name = "lenet", about = "Evaluate a LeNet-style network on the MNIST test set")]
struct Cli {
    /// Directory containing t10k-images.idx3-ubyte and t10k-labels.idx1-ubyte
    dataset_dir: PathBuf,

    /// Weights file (pcnw container)
    weights: PathBuf,

    /// Kernel backend: naive, cpu or wgpu
    #[arg(long, default_value = "naive")]
    backend: Backend,

    /// Worker threads for the cpu backend (default: one per core)
    #[arg(long)]
    threads: Option<usize>,

    /// Evaluate at most this many samples
    #[arg(long)]
    limit: Option<usize>,

    /// Number of classes
    #[arg(long, default_value_t = 10)]
    classes: usize,

    /// JSON network description (default: the built-in lenet-caffe topology)
    #[arg(long)]
    network: Option<PathBuf>,

    /// Run whole samples in parallel
    #[arg(long)]
    parallel_samples: bool,

    /// Write every stage output of the first sample into this directory
    #[cfg(feature = "dump")]
    #[arg(long)]
    dump_dir: Option<PathBuf>,
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            return if e.use_stderr() {
                ExitCode::FAILURE
            } else {
                ExitCode::SUCCESS
            };
        }
    };

    match run(&cli) {
        Ok(eval) => {
            print!("{eval}");
            ExitCode::SUCCESS
        }
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: &Cli) -> anyhow::Result<Evaluation> {
    let eval_config = EvalConfig {
        num_classes: cli.classes,
        sample_limit: cli.limit,
    };
    eval_config.validate()?;
    let run_config = RunConfig {
        backend: cli.backend,
        threads: cli.threads,
        parallel_samples: cli.parallel_samples,
    };

    let spec = match &cli.network {
        Some(path) => NetworkSpec::load(path)?,
        None => NetworkSpec::lenet_caffe(),
    };
    let dataset = Dataset::load_mnist(&cli.dataset_dir, cli.limit)
        .with_context(|| {
            format!(
                "could not read mnist data from '{}'",
                cli.dataset_dir.display()
            )
        })?;
    info!(path = %cli.weights.display(), "reading weights");
    let weights = load_weights(&cli.weights)?;

    let executor = Executor::from_config(&run_config)?;
    let network = Network::new(spec, &weights, executor)?;
    info!(
        network = %network.spec().name,
        backend = %run_config.backend,
        samples = dataset.len(),
        "evaluating"
    );

    #[cfg(feature = "dump")]
    if let (Some(dir), Some(image)) = (&cli.dump_dir, dataset.images().first()) {
        let dumper = pico_cnn::dump::StageDumper::new(dir)?;
        dumper.input(image)?;
        network.forward_observed(image.clone(), |i, name, act| dumper.observe(i, name, act))?;
        info!(dir = %dir.display(), "stage outputs dumped");
    }

    let eval = if run_config.parallel_samples {
        evaluate_parallel(&network, &dataset, &eval_config)?
    } else {
        evaluate(&network, &dataset, &eval_config)?
    };
    Ok(eval)
}
