use std::{path::PathBuf, sync::Arc};

use anyhow::Context;
use clap::Parser;
use yolov3::{
    backend::{device, InferenceBackend},
    dataset::YoloDataset,
    logging::init_logging,
    training::{dataloader, evaluate, load_checkpoint, load_model, TrainingConfig},
};

/// Report class accuracy and mAP of a trained model.
#[derive(Parser, Debug)]
#[command(name = "eval")]
struct EvalArgs {
    /// Directory written by `train`; its `config.json` is reused.
    #[arg(long, default_value = "/tmp/yolov3")]
    artifact_dir: PathBuf,
    /// CSV index of `image,label` pairs to evaluate on.
    #[arg(long)]
    test_csv: PathBuf,
    #[arg(long)]
    image_dir: PathBuf,
    #[arg(long)]
    label_dir: PathBuf,
    /// Evaluate the checkpoint of this epoch instead of the final model.
    #[arg(long)]
    checkpoint: Option<usize>,
    #[arg(long)]
    batch_size: Option<usize>,
}

fn main() -> anyhow::Result<()> {
    init_logging();
    let args = EvalArgs::parse();

    let mut config = TrainingConfig::load_from(&args.artifact_dir)?;
    if let Some(batch_size) = args.batch_size {
        config.batch_size = batch_size;
    }

    let device = device();
    let model = match args.checkpoint {
        Some(epoch) => {
            load_checkpoint::<InferenceBackend>(&args.artifact_dir, epoch, &config, &device)?
        }
        None => {
            load_model::<InferenceBackend>(args.artifact_dir.join("model"), &config, &device)?
        }
    };

    let dataset = YoloDataset::from_csv(
        &args.test_csv,
        &args.image_dir,
        &args.label_dir,
        config.image_size,
        config.model.num_classes,
        config.target_builder()?,
    )
    .with_context(|| format!("loading {}", args.test_csv.display()))?;
    let loader = dataloader::<InferenceBackend, _>(&config, Arc::new(dataset), device, false);

    let evaluation = evaluate(&model, loader.as_ref(), &config)?;
    println!("{}", evaluation.accuracy);
    println!("MAP: {:.4}", evaluation.map);

    Ok(())
}
