use std::path::PathBuf;

use anyhow::Context;
use burn::config::Config;
use clap::Parser;
use yolov3::{
    backend::{device, TrainBackend},
    dataset::YoloDataset,
    logging::init_logging,
    training::{train, TrainingConfig},
};

/// Train YOLOv3 on a dataset of images with YOLO label files.
#[derive(Parser, Debug)]
#[command(name = "train")]
struct TrainArgs {
    /// CSV index of `image,label` pairs used for training.
    #[arg(long)]
    train_csv: PathBuf,
    /// CSV index of `image,label` pairs used for validation and mAP.
    #[arg(long)]
    test_csv: PathBuf,
    #[arg(long)]
    image_dir: PathBuf,
    #[arg(long)]
    label_dir: PathBuf,
    /// Where the config, checkpoints and final model are written.
    #[arg(long, default_value = "/tmp/yolov3")]
    artifact_dir: PathBuf,
    /// JSON training config; defaults are used when omitted.
    #[arg(long)]
    config: Option<PathBuf>,
    #[arg(long)]
    num_classes: Option<usize>,
    #[arg(long)]
    image_size: Option<usize>,
    #[arg(long)]
    batch_size: Option<usize>,
    #[arg(long)]
    epochs: Option<usize>,
    #[arg(long)]
    num_workers: Option<usize>,
    #[arg(long)]
    max_lr: Option<f64>,
    #[arg(long)]
    seed: Option<u64>,
    /// Continue from the checkpoint saved at the end of this epoch.
    #[arg(long)]
    resume: Option<usize>,
    /// Skip per-epoch checkpoints.
    #[arg(long)]
    no_save: bool,
}

impl TrainArgs {
    fn training_config(&self) -> anyhow::Result<TrainingConfig> {
        let mut config = match &self.config {
            Some(path) => TrainingConfig::load(path)
                .map_err(|err| anyhow::anyhow!("{}: {err:?}", path.display()))?,
            None => TrainingConfig::new(),
        };

        if let Some(num_classes) = self.num_classes {
            config.model.num_classes = num_classes;
        }
        if let Some(image_size) = self.image_size {
            config.image_size = image_size;
        }
        if let Some(batch_size) = self.batch_size {
            config.batch_size = batch_size;
        }
        if let Some(epochs) = self.epochs {
            config.num_epochs = epochs;
        }
        if let Some(num_workers) = self.num_workers {
            config.num_workers = num_workers;
        }
        if let Some(max_lr) = self.max_lr {
            config.max_lr = max_lr;
        }
        if let Some(seed) = self.seed {
            config.seed = seed;
        }
        if self.resume.is_some() {
            config.resume = self.resume;
        }
        if self.no_save {
            config.save_model = false;
        }

        Ok(config)
    }
}

fn main() -> anyhow::Result<()> {
    init_logging();
    let args = TrainArgs::parse();
    let config = args.training_config()?;

    let builder = config.target_builder()?;
    let dataset = |index: &PathBuf| {
        YoloDataset::from_csv(
            index,
            &args.image_dir,
            &args.label_dir,
            config.image_size,
            config.model.num_classes,
            builder.clone(),
        )
        .with_context(|| format!("loading {}", index.display()))
    };
    let train_dataset = dataset(&args.train_csv)?;
    let test_dataset = dataset(&args.test_csv)?;

    let outcome = train::<TrainBackend, _, _>(
        &args.artifact_dir,
        &config,
        train_dataset,
        test_dataset,
        device(),
    )?;

    for summary in outcome.epochs {
        log::info!("{}", serde_json::to_string(&summary)?);
    }

    Ok(())
}
