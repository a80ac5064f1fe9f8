//! `rustytab`: trains a TabNet classifier on a synthetic tabular problem.
//!
//! ```text
//! RUST_LOG=rustytab=debug rustytab --epochs 20 --save tabnet.nn1
//! rustytab --config run.json --load tabnet.nn1
//! ```

use anyhow::{bail, Context, Result};
use clap::Parser;
use ndarray::{Array2, ArrayD, Axis};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rustytab::losses::binary_cross_entropy;
use rustytab::metrics::threshold_match;
use rustytab::nn::{CategoricalColumn, GhostBatchNormOpts, Model, TabNet, TabNetOpts};
use rustytab::optimizers::Adam;
use rustytab::tensor::Tensor;
use rustytab::training::{predict, train, TrainOpts};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Instant;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "RustyTab: TabNet on a graph-based autodiff engine", long_about = None)]
struct Args {
    /// JSON run configuration; command line flags override it.
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[arg(short, long)]
    epochs: Option<usize>,

    #[arg(short, long)]
    batch_size: Option<usize>,

    #[arg(long)]
    seed: Option<u64>,

    /// Write the trained weights to this `.nn1` file.
    #[arg(long)]
    save: Option<PathBuf>,

    /// Start from the weights of this `.nn1` file.
    #[arg(long)]
    load: Option<PathBuf>,

    /// Check every computed value for NaN/Inf.
    #[arg(long)]
    dev_mode: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
struct RunConfig {
    rows: usize,
    numeric_features: usize,
    categories: usize,
    embedding_dim: usize,
    validation_fraction: f32,
    epochs: usize,
    batch_size: usize,
    virtual_batch_size: i64,
    decision_steps: usize,
    prediction_layer_dim: usize,
    attention_layer_dim: usize,
    learning_rate: f32,
    lambda_sparse: f32,
    seed: u64,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            rows: 512,
            numeric_features: 6,
            categories: 4,
            embedding_dim: 2,
            validation_fraction: 0.2,
            epochs: 10,
            batch_size: 64,
            virtual_batch_size: 16,
            decision_steps: 3,
            prediction_layer_dim: 8,
            attention_layer_dim: 8,
            learning_rate: 2e-2,
            lambda_sparse: 1e-3,
            seed: 42,
        }
    }
}

impl RunConfig {
    fn load(args: &Args) -> Result<Self> {
        let mut config = match &args.config {
            Some(path) => {
                let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
                serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))?
            }
            None => RunConfig::default(),
        };
        if let Some(epochs) = args.epochs {
            config.epochs = epochs;
        }
        if let Some(batch_size) = args.batch_size {
            config.batch_size = batch_size;
        }
        if let Some(seed) = args.seed {
            config.seed = seed;
        }
        if config.rows < 2 || config.numeric_features < 2 || config.categories == 0 {
            bail!("need at least 2 rows, 2 numeric features and 1 category, got {:?}", config);
        }
        if !(0.0..1.0).contains(&config.validation_fraction) {
            bail!("validation fraction must be in [0, 1), got {}", config.validation_fraction);
        }
        Ok(config)
    }
}

/// Numeric features in `[-1, 1)` followed by one categorical column.
/// The label depends on two numeric features and the category parity.
fn synthetic_data(config: &RunConfig) -> (ArrayD<f32>, ArrayD<f32>) {
    let mut rng = StdRng::seed_from_u64(config.seed);
    let width = config.numeric_features + 1;
    let mut x = Array2::<f32>::zeros((config.rows, width));
    let mut y = Array2::<f32>::zeros((config.rows, 1));
    for (mut row, mut label) in x.outer_iter_mut().zip(y.outer_iter_mut()) {
        for j in 0..config.numeric_features {
            row[j] = rng.gen_range(-1.0..1.0);
        }
        let category = rng.gen_range(0..config.categories);
        row[config.numeric_features] = category as f32;
        let shift = if category % 2 == 1 { 0.4 } else { -0.4 };
        label[0] = if row[0] + 0.5 * row[1] + shift > 0.0 { 1.0 } else { 0.0 };
    }
    (x.into_dyn(), y.into_dyn())
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("rustytab=info".parse()?))
        .init();

    let args = Args::parse();
    let config = RunConfig::load(&args)?;
    info!(?config, "run configuration");

    let (x, y) = synthetic_data(&config);
    let validation_rows = (config.rows as f32 * config.validation_fraction) as usize;
    let split = config.rows - validation_rows;
    let (train_x, validate_x) = x.view().split_at(Axis(0), split);
    let (train_y, validate_y) = y.view().split_at(Axis(0), split);
    let (train_x, train_y) = (train_x.to_owned(), train_y.to_owned());
    let (validate_x, validate_y) = (validate_x.to_owned(), validate_y.to_owned());
    info!(train = split, validate = validation_rows, features = x.shape()[1], "synthetic dataset");

    let model = Model::with_seed(config.seed);
    let net = TabNet::new(
        &model,
        config.numeric_features + 1,
        1,
        TabNetOpts {
            decision_steps: Some(config.decision_steps),
            prediction_layer_dim: Some(config.prediction_layer_dim),
            attention_layer_dim: Some(config.attention_layer_dim),
            gbn: GhostBatchNormOpts { virtual_batch_size: Some(config.virtual_batch_size), ..Default::default() },
            categorical: vec![CategoricalColumn {
                index: config.numeric_features,
                vocab_size: config.categories,
                embedding_dim: config.embedding_dim,
            }],
            ..Default::default()
        },
    )?;

    if let Some(path) = &args.load {
        let cost = model.load(path).with_context(|| format!("loading {}", path.display()))?;
        info!(path = %path.display(), cost, "loaded pretrained weights");
    }

    let started = Instant::now();
    let report = train(
        &model,
        &net,
        &train_x,
        &train_y,
        &validate_x,
        &validate_y,
        TrainOpts {
            epochs: Some(config.epochs),
            batch_size: Some(config.batch_size),
            solver: Some(Box::new(Adam::new(config.learning_rate))),
            cost_fn: Some(Box::new(|logits: &Tensor, y: &Tensor| binary_cross_entropy(&logits.sigmoid(), y, 1e-7))),
            lambda_sparse: Some(config.lambda_sparse),
            // Logits: a positive logit is a positive prediction.
            match_type_for: Some(Box::new(threshold_match(0.0))),
            dev_mode: args.dev_mode,
            seed: Some(config.seed),
            ..Default::default()
        },
    )?;
    info!(elapsed = ?started.elapsed(), steps = report.steps, "training finished");

    match &report.validation {
        Some(matrix) => info!(%matrix, cost = ?report.validation_cost, "final validation"),
        None => warn!("no validation rows, skipped validation"),
    }

    if validation_rows > 0 {
        let logits = predict(&model, &net, &validate_x, config.batch_size)?;
        let positives = logits.iter().filter(|&&v| v > 0.0).count();
        info!(positives, rows = validation_rows, "validation predictions");
    }

    if let Some(path) = &args.save {
        let cost = report.final_cost().unwrap_or(f32::NAN);
        model.save(path, cost).with_context(|| format!("saving {}", path.display()))?;
    }
    Ok(())
}
