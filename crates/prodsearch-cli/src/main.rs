//! prodsearch CLI - train and evaluate personalized product search models.
//!
//! # Usage
//!
//! ```bash
//! # Corpus, split and graph statistics
//! prodsearch stats reviews.jsonl
//!
//! # Train GraphSearch and keep a checkpoint
//! prodsearch train reviews.jsonl --model graph-search --epochs 20 --save ckpt/
//!
//! # Train LSE
//! prodsearch train reviews.jsonl --model lse --embedding-size 64 --window-size 5
//!
//! # Re-evaluate a checkpoint
//! prodsearch evaluate reviews.jsonl --checkpoint ckpt/ --top-k 20
//!
//! # Nearest users under a GraphSearch checkpoint (JSON lines)
//! prodsearch similar-users reviews.jsonl --checkpoint ckpt/ --top 5
//! ```

use anyhow::{bail, Context, Result};
use candle_core::Device;
use clap::{Parser, Subcommand, ValueEnum};
use indicatif::{ProgressBar, ProgressStyle};
use prodsearch_core::{load_jsonl, prepare, DataConfig, PreparedData, SearchGraph};
use prodsearch_nn::checkpoint::{self, CheckpointMeta};
use prodsearch_nn::models::load_word_matrix;
use prodsearch_nn::{
    evaluate, EvalConfig, GraphSearch, GraphSearchConfig, Lse, LseConfig, ModelConfig,
    PropagationMode, SearchModel, Trainer, TrainingConfig,
};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "prodsearch")]
#[command(about = "Personalized product search CLI", long_about = None)]
struct Cli {
    /// More log output (-v info, -vv debug)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show corpus, split and graph statistics
    Stats {
        /// Review corpus (JSON lines)
        input: PathBuf,

        #[command(flatten)]
        data: DataArgs,
    },

    /// Train a model and report ranking metrics
    Train(TrainArgs),

    /// Evaluate a saved checkpoint
    Evaluate {
        /// Review corpus the checkpoint was trained on
        input: PathBuf,

        /// Checkpoint directory
        #[arg(long)]
        checkpoint: PathBuf,

        /// Ranking cutoff
        #[arg(long, default_value = "10")]
        top_k: usize,

        /// Keep previously purchased items in the ranking
        #[arg(long)]
        no_filter: bool,
    },

    /// Print each user's most similar users (GraphSearch checkpoints)
    SimilarUsers {
        /// Review corpus the checkpoint was trained on
        input: PathBuf,

        /// Checkpoint directory
        #[arg(long)]
        checkpoint: PathBuf,

        /// Neighbours per user
        #[arg(long, default_value = "5")]
        top: usize,
    },
}

#[derive(clap::Args, Clone)]
struct DataArgs {
    /// Reviews are clipped to this many words
    #[arg(long, default_value = "20")]
    max_review_words: usize,

    /// Drop review words seen fewer times
    #[arg(long, default_value = "1")]
    min_word_count: usize,

    /// Users with fewer distinct items keep all purchases in training (at least 2)
    #[arg(long, default_value = "2")]
    min_user_purchases: usize,
}

impl DataArgs {
    fn config(&self) -> DataConfig {
        DataConfig::default()
            .with_max_review_words(self.max_review_words)
            .with_min_word_count(self.min_word_count)
            .with_min_user_purchases(self.min_user_purchases)
    }
}

#[derive(clap::Args)]
struct TrainArgs {
    /// Review corpus (JSON lines)
    input: PathBuf,

    /// Model to train
    #[arg(long, default_value = "graph-search")]
    model: ModelArg,

    /// Number of epochs
    #[arg(long, default_value = "20")]
    epochs: usize,

    /// Batch size
    #[arg(long, default_value = "256")]
    batch_size: usize,

    /// Adagrad learning rate
    #[arg(long, default_value = "0.1")]
    lr: f64,

    /// Negative items per interaction
    #[arg(long, default_value = "5")]
    neg_sample_num: usize,

    /// When non-zero, overrides both word and entity embedding sizes
    #[arg(long, default_value = "0")]
    embedding_size: usize,

    /// Word embedding size (GraphSearch)
    #[arg(long, default_value = "64")]
    word_embedding_size: usize,

    /// Entity embedding size (GraphSearch), also the LSE size
    #[arg(long, default_value = "64")]
    entity_embedding_size: usize,

    /// Attention heads (GraphSearch)
    #[arg(long, default_value = "4")]
    head_num: usize,

    /// Convolution layers (GraphSearch)
    #[arg(long, default_value = "4")]
    convolution_num: usize,

    /// Embedding norm penalty
    #[arg(long, default_value = "0.001")]
    regularization: f64,

    /// Propagation setup (GraphSearch)
    #[arg(long, default_value = "ordinary")]
    mode: ModeArg,

    /// Review n-gram length (LSE)
    #[arg(long, default_value = "5")]
    window_size: usize,

    /// Pretrained word vectors, safetensors (GraphSearch)
    #[arg(long)]
    word_vectors: Option<PathBuf>,

    /// Ranking cutoff
    #[arg(long, default_value = "10")]
    top_k: usize,

    /// Evaluate every N epochs (0: only after the last)
    #[arg(long, default_value = "1")]
    eval_every: usize,

    /// Keep previously purchased items in the ranking
    #[arg(long)]
    no_filter: bool,

    /// Random seed
    #[arg(long, default_value = "42")]
    seed: u64,

    /// Save a checkpoint into this directory
    #[arg(long)]
    save: Option<PathBuf>,

    #[command(flatten)]
    data: DataArgs,
}

#[derive(Clone, Copy, ValueEnum)]
enum ModelArg {
    /// Graph propagation with query self-attention
    GraphSearch,
    /// Latent semantic entity
    Lse,
}

#[derive(Clone, Copy, ValueEnum)]
enum ModeArg {
    /// Id and text propagation
    Ordinary,
    /// Entity neighbours only
    #[value(alias = "no_text_prop")]
    NoTextProp,
    /// Word neighbours only
    #[value(alias = "no_id_prop")]
    NoIdProp,
}

impl From<ModeArg> for PropagationMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Ordinary => Self::Ordinary,
            ModeArg::NoTextProp => Self::NoTextProp,
            ModeArg::NoIdProp => Self::NoIdProp,
        }
    }
}

impl TrainArgs {
    fn model_config(&self) -> ModelConfig {
        let (word_size, entity_size) = if self.embedding_size > 0 {
            (self.embedding_size, self.embedding_size)
        } else {
            (self.word_embedding_size, self.entity_embedding_size)
        };
        match self.model {
            ModelArg::GraphSearch => ModelConfig::GraphSearch(
                GraphSearchConfig::default()
                    .with_word_embedding_size(word_size)
                    .with_entity_embedding_size(entity_size)
                    .with_head_num(self.head_num)
                    .with_convolution_num(self.convolution_num)
                    .with_l2(self.regularization)
                    .with_mode(self.mode.into()),
            ),
            ModelArg::Lse => ModelConfig::Lse(
                LseConfig::default()
                    .with_embedding_size(entity_size)
                    .with_l2(self.regularization)
                    .with_window_size(self.window_size),
            ),
        }
    }

    fn training_config(&self) -> TrainingConfig {
        TrainingConfig::default()
            .with_epochs(self.epochs)
            .with_batch_size(self.batch_size)
            .with_learning_rate(self.lr)
            .with_neg_sample_num(self.neg_sample_num)
            .with_seed(self.seed)
            .with_eval_every(self.eval_every)
            .with_eval(eval_config(self.top_k, self.no_filter))
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.verbose);

    match cli.command {
        Commands::Stats { input, data } => cmd_stats(&input, &data.config()),
        Commands::Train(args) => cmd_train(&args),
        Commands::Evaluate {
            input,
            checkpoint,
            top_k,
            no_filter,
        } => cmd_evaluate(&input, &checkpoint, top_k, no_filter),
        Commands::SimilarUsers {
            input,
            checkpoint,
            top,
        } => cmd_similar_users(&input, &checkpoint, top),
    }
}

fn init_tracing(verbose: u8) {
    let default = match verbose {
        0 => "warn",
        1 => "info",
        _ => "debug",
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn eval_config(top_k: usize, no_filter: bool) -> EvalConfig {
    EvalConfig::default()
        .with_k(top_k)
        .with_filter_purchased(!no_filter)
}

fn load_data(path: &Path, config: &DataConfig) -> Result<PreparedData> {
    let start = Instant::now();
    let pb = ProgressBar::new_spinner();
    pb.set_message(format!("Loading {}...", path.display()));

    let records =
        load_jsonl(path).with_context(|| format!("Failed to load {}", path.display()))?;
    let data = prepare(&records, config)
        .with_context(|| format!("Failed to prepare {}", path.display()))?;

    pb.finish_and_clear();
    tracing::info!(
        records = records.len(),
        elapsed = ?start.elapsed(),
        "loaded corpus"
    );
    Ok(data)
}

fn device() -> Result<Device> {
    Device::cuda_if_available(0).context("Failed to select a device")
}

fn cmd_stats(input: &Path, config: &DataConfig) -> Result<()> {
    let data = load_data(input, config)?;
    let stats = data.stats();
    let graph = SearchGraph::build(&data).stats();

    println!("Corpus Statistics");
    println!("=================");
    println!("Users:          {}", stats.num_users);
    println!("Items:          {}", stats.num_items);
    println!("Queries:        {}", stats.num_queries);
    println!("Words:          {}", stats.num_words);
    println!("Train:          {}", stats.num_train);
    println!("Test:           {}", stats.num_test);
    println!("Graph nodes:    {}", graph.total_nodes);
    println!("Graph edges:    {}", graph.total_edges);

    for (edge_type, count) in &graph.edges_by_type {
        println!("  {edge_type}: {count}");
    }
    Ok(())
}

fn build(args: &TrainArgs, config: &ModelConfig, data: &PreparedData) -> Result<Box<dyn SearchModel>> {
    let device = device()?;
    match config {
        ModelConfig::GraphSearch(config) => {
            let graph = SearchGraph::build(data);
            let model = GraphSearch::new(config.clone(), &graph, &device)?;
            if let Some(path) = &args.word_vectors {
                let matrix = load_word_matrix(path, &device)
                    .with_context(|| format!("Failed to load word vectors {}", path.display()))?;
                model.apply_word2vec(&matrix)?;
            }
            Ok(Box::new(model))
        }
        ModelConfig::Lse(config) => {
            if args.word_vectors.is_some() {
                tracing::warn!("--word-vectors only applies to graph-search, ignoring");
            }
            Ok(Box::new(Lse::new(
                config.clone(),
                data.num_words(),
                data.num_items(),
                &device,
            )?))
        }
    }
}

fn cmd_train(args: &TrainArgs) -> Result<()> {
    let data_config = args.data.config();
    let data = load_data(&args.input, &data_config)?;
    let config = args.model_config();
    let model = build(args, &config, &data)?;

    println!(
        "Training {} on {} interactions ({} users, {} items)...",
        config.kind(),
        data.train.len(),
        data.num_users(),
        data.num_items()
    );
    let start = Instant::now();

    let pb = ProgressBar::new(args.epochs as u64);
    pb.set_style(
        ProgressStyle::with_template("{bar:30} {pos}/{len} epochs {msg}")
            .context("Invalid progress template")?,
    );
    let bar = pb.clone();
    let mut trainer = Trainer::new(args.training_config()).with_callback(move |report| {
        bar.set_message(format!("loss {:.4}", report.loss));
        bar.inc(1);
    });
    let report = trainer.fit(model.as_ref(), &data)?;
    pb.finish_and_clear();

    for epoch in &report.epochs {
        println!("{epoch}");
    }
    println!("Trained in {:.2?}", start.elapsed());
    if let Some(best) = report.best_epoch {
        println!("Best epoch: {}", best + 1);
    }
    let metrics = report.final_metrics().cloned();
    if let Some(metrics) = &metrics {
        println!("{metrics}");
    }

    if let Some(dir) = &args.save {
        let meta = CheckpointMeta::for_data(config, data_config, &data)
            .with_epochs(report.epochs.len())
            .with_metrics(metrics);
        checkpoint::save(dir, model.as_ref(), &meta)
            .with_context(|| format!("Failed to save checkpoint to {}", dir.display()))?;
        println!("Saved checkpoint to {}", dir.display());
    }
    Ok(())
}

fn cmd_evaluate(input: &Path, dir: &Path, top_k: usize, no_filter: bool) -> Result<()> {
    let meta = checkpoint::load_meta(dir)
        .with_context(|| format!("Failed to read checkpoint {}", dir.display()))?;
    let data = load_data(input, &meta.data)?;
    let (model, _) = checkpoint::load(dir, &data, &device()?)
        .with_context(|| format!("Failed to load checkpoint {}", dir.display()))?;

    let metrics = evaluate(model.as_ref(), &data, &eval_config(top_k, no_filter))?;
    println!("{} ({} epochs)", meta.model.kind(), meta.epochs);
    println!("{metrics}");
    Ok(())
}

#[derive(Serialize)]
struct SimilarLine<'a> {
    user: &'a str,
    similar: Vec<Neighbour<'a>>,
}

#[derive(Serialize)]
struct Neighbour<'a> {
    user: &'a str,
    score: f32,
}

fn cmd_similar_users(input: &Path, dir: &Path, top: usize) -> Result<()> {
    let meta = checkpoint::load_meta(dir)
        .with_context(|| format!("Failed to read checkpoint {}", dir.display()))?;
    let ModelConfig::GraphSearch(config) = &meta.model else {
        bail!("similar-users needs a graph_search checkpoint, found {}", meta.model.kind());
    };
    let data = load_data(input, &meta.data)?;
    meta.check_data(&data)?;

    let graph = SearchGraph::build(&data);
    let model = GraphSearch::new(config.clone(), &graph, &device()?)?;
    checkpoint::restore(dir, &model)
        .with_context(|| format!("Failed to load checkpoint {}", dir.display()))?;

    for entry in model.similar_users(top)? {
        let user = data.users.key(entry.user).unwrap_or_default();
        let similar = entry
            .neighbours
            .iter()
            .map(|&(other, score)| Neighbour {
                user: data.users.key(other).unwrap_or_default(),
                score,
            })
            .collect();
        println!("{}", serde_json::to_string(&SimilarLine { user, similar })?);
    }
    Ok(())
}
