//! Command-line entry point: `train` one sub-model on noisy labels, or
//! `detect` label noise with the two cross-trained sub-models.

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use colored::Colorize;
use tracing::info;

use pixel_cl::confident::{run_detection, DetectOptions};
use pixel_cl::dataset::{DiskBatches, NoisyPixelDataset, Subset};
use pixel_cl::loss::build_loss;
use pixel_cl::model::{build_model, Sgd};
use pixel_cl::training::{
    CheckpointPolicy, CheckpointSelector, CheckpointStore, EpochOrchestrator, NullSink,
    SvgChartSink, TrainingSink,
};
use pixel_cl::utils::logging::{init_logging, LogConfig};
use pixel_cl::utils::metrics::OverlapMetrics;
use pixel_cl::{LossKind, NetworkKind, PruneMethod, TrainingConfig};

/// Pixel-level confident learning for noisily labeled segmentation data.
#[derive(Parser, Debug)]
#[command(name = "pixel_cl")]
#[command(version)]
#[command(about = "Train pixel classifiers on noisy labels and detect mislabeled pixels", long_about = None)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, default_value = "false")]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Train one sub-model and track the best validation checkpoint
    Train {
        /// Partition root containing training/ and validation/
        #[arg(short, long)]
        data_dir: PathBuf,

        /// Run directory for checkpoints, config snapshot and charts
        #[arg(short, long)]
        output_dir: PathBuf,

        /// Label class to train against
        #[arg(short, long, default_value = "lung")]
        class_name: String,

        /// Number of (train, eval) epoch pairs
        #[arg(short, long, default_value = "100")]
        epochs: usize,

        #[arg(short, long, default_value = "4")]
        batch_size: usize,

        /// Initial learning rate
        #[arg(short, long, default_value = "0.001")]
        learning_rate: f64,

        /// Decay the learning rate by gamma every this many epochs
        #[arg(long, default_value = "50")]
        lr_step_size: usize,

        #[arg(long, default_value = "0.1")]
        lr_gamma: f64,

        /// Periodic checkpoint interval in epochs
        #[arg(long, default_value = "10")]
        save_epochs: usize,

        /// Network calling convention (segmenter, attention_segmenter)
        #[arg(long, default_value = "segmenter")]
        network: String,

        /// Loss calling convention (cross_entropy, confidence_smoothed,
        /// attention_weighted)
        #[arg(long, default_value = "cross_entropy")]
        loss: String,

        /// Smoothing strength for the confidence-smoothed loss
        #[arg(long, default_value = "0.1")]
        smoothing_epsilon: f32,

        /// Load confidence maps from an earlier detection pass
        #[arg(long, default_value = "false")]
        load_confidence_maps: bool,

        /// Square cropping size applied to every sample
        #[arg(long, default_value = "112")]
        cropping_size: usize,

        /// Number of output classes
        #[arg(long, default_value = "2")]
        num_classes: usize,

        /// Seed for the training-subset shuffle
        #[arg(long, default_value = "42")]
        seed: u64,

        /// Skip SVG chart rendering
        #[arg(long, default_value = "false")]
        no_charts: bool,
    },

    /// Detect mislabeled pixels and write per-image confidence maps
    Detect {
        /// Data root containing sub-1/, sub-2/ and all/
        #[arg(short, long)]
        data_root: PathBuf,

        /// Run directory of sub-model 1
        #[arg(short, long)]
        model_dir: PathBuf,

        /// Run directory of sub-model 2 (derived from --model-dir by the
        /// sub_1 -> sub_2 naming convention when omitted)
        #[arg(long)]
        model_sub_2_dir: Option<PathBuf>,

        /// Label class whose maps are generated
        #[arg(short, long, default_value = "lung")]
        class_name: String,

        /// Comma-separated pruning methods (prune_by_class,
        /// prune_by_noise_rate, both, Cij, Qij, intersection, union)
        #[arg(long, default_value = "both", value_delimiter = ',')]
        methods: Vec<String>,

        /// Dataset subset to evaluate (training, validation)
        #[arg(long, default_value = "training")]
        subset: String,

        #[arg(short, long, default_value = "4")]
        batch_size: usize,

        /// Checkpoint epoch to load; -1 selects the best on validation
        #[arg(long, default_value = "-1")]
        epoch: i64,

        /// Network calling convention of the saved models
        #[arg(long, default_value = "segmenter")]
        network: String,

        #[arg(long, default_value = "2")]
        num_classes: usize,

        /// Square cropping size the models were trained with
        #[arg(long, default_value = "112")]
        cropping_size: usize,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_config = if cli.verbose {
        LogConfig::verbose()
    } else {
        LogConfig::default()
    };
    let _ = init_logging(&log_config);

    match cli.command {
        Commands::Train {
            data_dir,
            output_dir,
            class_name,
            epochs,
            batch_size,
            learning_rate,
            lr_step_size,
            lr_gamma,
            save_epochs,
            network,
            loss,
            smoothing_epsilon,
            load_confidence_maps,
            cropping_size,
            num_classes,
            seed,
            no_charts,
        } => {
            let config = TrainingConfig {
                num_classes,
                cropping_size: (cropping_size, cropping_size),
                class_name,
                network: network.parse::<NetworkKind>()?,
                loss: loss.parse::<LossKind>()?,
                smoothing_epsilon,
                load_confidence_maps,
                num_epochs: epochs,
                batch_size,
                learning_rate,
                lr_step_size,
                lr_gamma,
                save_epochs,
                seed,
            };
            cmd_train(&data_dir, &output_dir, config, no_charts)?;
        }

        Commands::Detect {
            data_root,
            model_dir,
            model_sub_2_dir,
            class_name,
            methods,
            subset,
            batch_size,
            epoch,
            network,
            num_classes,
            cropping_size,
        } => {
            let methods = methods
                .iter()
                .map(|name| name.parse::<PruneMethod>())
                .collect::<pixel_cl::Result<Vec<_>>>()?;
            let options = DetectOptions {
                data_root,
                model_dir,
                model_sub_2_dir,
                class_name,
                methods,
                subset: subset.parse::<Subset>()?,
                batch_size,
                checkpoint: CheckpointSelector::from_epoch_arg(epoch),
                network: network.parse::<NetworkKind>()?,
                num_classes,
                cropping_size: (cropping_size, cropping_size),
            };
            cmd_detect(&options)?;
        }
    }

    Ok(())
}

fn cmd_train(
    data_dir: &std::path::Path,
    output_dir: &std::path::Path,
    config: TrainingConfig,
    no_charts: bool,
) -> Result<()> {
    config.validate()?;

    println!("{}", "Training Configuration:".cyan().bold());
    println!("  data:       {}", data_dir.display());
    println!("  run dir:    {}", output_dir.display());
    println!("  class:      {}", config.class_name);
    println!("  network:    {:?}", config.network);
    println!("  loss:       {:?}", config.loss);
    println!("  epochs:     {}", config.num_epochs);
    println!("  batch size: {}", config.batch_size);
    println!();

    config.snapshot(output_dir)?;
    let store = CheckpointStore::create(output_dir.join("ckpt"))?;

    let confidence_dir = config
        .load_confidence_maps
        .then(|| format!("{}-confident-maps", config.class_name));

    let train_dataset = NoisyPixelDataset::load(
        data_dir,
        Subset::Training,
        &config.class_name,
        config.num_classes,
        config.cropping_size,
        confidence_dir.as_deref(),
    )?;
    let val_dataset = NoisyPixelDataset::load(
        data_dir,
        Subset::Validation,
        &config.class_name,
        config.num_classes,
        config.cropping_size,
        None,
    )?;

    let mut train_source = DiskBatches::new(train_dataset, config.batch_size, true, config.seed);
    let mut val_source = DiskBatches::new(val_dataset, config.batch_size, false, config.seed);

    let mut model = build_model(config.network, config.num_classes);
    match store.latest_epoch()? {
        Some(epoch) => {
            let checkpoint = store.resolve(CheckpointSelector::Latest)?;
            model.load(&checkpoint)?;
            info!("resumed from checkpoint of epoch {epoch}");
        }
        None => info!("training from scratch"),
    }

    let sink: Box<dyn TrainingSink> = if no_charts {
        Box::new(NullSink)
    } else {
        Box::new(SvgChartSink::new(output_dir, config.num_classes))
    };

    let mut orchestrator = EpochOrchestrator::new(
        model,
        build_loss(config.loss, config.smoothing_epsilon),
        Box::new(Sgd),
        Box::new(OverlapMetrics::new(config.num_classes)),
        sink,
    );
    let policy = CheckpointPolicy::new(config.save_epochs);

    let report = orchestrator.run(&config, &mut train_source, &mut val_source, &store, &policy)?;

    println!();
    println!("{}", "Training Complete!".green().bold());
    println!(
        "  best dice on the validation set: {:.4}",
        report.best_validation_overlap
    );
    Ok(())
}

fn cmd_detect(options: &DetectOptions) -> Result<()> {
    println!("{}", "Noise Detection Configuration:".cyan().bold());
    println!("  data root: {}", options.data_root.display());
    println!("  model dir: {}", options.model_dir.display());
    println!("  class:     {}", options.class_name);
    println!(
        "  methods:   {}",
        options
            .methods
            .iter()
            .map(|m| m.to_string())
            .collect::<Vec<_>>()
            .join(", ")
    );
    println!();

    run_detection(options)?;

    println!("{}", "Confidence maps written.".green().bold());
    Ok(())
}
