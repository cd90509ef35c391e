use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use burn::{
    config::Config,
    data::{
        dataloader::{DataLoader, DataLoaderBuilder},
        dataset::Dataset,
    },
    lr_scheduler::LrScheduler,
    module::{AutodiffModule, Module},
    optim::{decay::WeightDecayConfig, AdamConfig, Optimizer},
    record::{CompactRecorder, Recorder},
    tensor::backend::{AutodiffBackend, Backend},
    train::{TrainOutput, TrainStep, ValidStep},
};
use serde::{Deserialize, Serialize};

use crate::{
    boxes::{tensor_to_scalar, BoxFormat},
    dataset::{YoloBatch, YoloBatcher, YoloItem},
    error::{YoloError, YoloResult},
    metric::{
        check_class_accuracy, evaluation_boxes, mean_average_precision, ClassAccuracyReport,
    },
    model::{YoloOutput, YoloV3, YoloV3Config},
    schedule::{OneCycleLrScheduler, OneCycleLrSchedulerConfig},
    targets::TargetBuilder,
};

impl<B: AutodiffBackend> TrainStep<YoloBatch<B>, YoloOutput<B>> for YoloV3<B> {
    fn step(&self, batch: YoloBatch<B>) -> TrainOutput<YoloOutput<B>> {
        let item = self.forward_loss(batch);

        TrainOutput::new(self, item.loss.backward(), item)
    }
}

impl<B: Backend> ValidStep<YoloBatch<B>, YoloOutput<B>> for YoloV3<B> {
    fn step(&self, batch: YoloBatch<B>) -> YoloOutput<B> {
        self.forward_loss(batch)
    }
}

pub fn default_optimizer() -> AdamConfig {
    AdamConfig::new().with_weight_decay(Some(WeightDecayConfig::new(1e-4)))
}

#[derive(Config)]
pub struct TrainingConfig {
    #[config(default = "YoloV3Config::new()")]
    pub model: YoloV3Config,
    #[config(default = "default_optimizer()")]
    pub optimizer: AdamConfig,
    #[config(default = 416)]
    pub image_size: usize,
    #[config(default = 32)]
    pub batch_size: usize,
    #[config(default = 4)]
    pub num_workers: usize,
    #[config(default = 40)]
    pub num_epochs: usize,
    #[config(default = 42)]
    pub seed: u64,
    #[config(default = 1e-3)]
    pub max_lr: f64,
    #[config(default = 100.0)]
    pub div_factor: f64,
    #[config(default = 1e4)]
    pub final_div_factor: f64,
    #[config(default = 0.125)]
    pub pct_start: f64,
    /// Objectness above which a cell counts as a detection.
    #[config(default = 0.05)]
    pub conf_threshold: f32,
    #[config(default = 0.5)]
    pub map_iou_threshold: f32,
    #[config(default = 0.45)]
    pub nms_iou_threshold: f32,
    #[config(default = true)]
    pub save_model: bool,
    /// Epoch of the checkpoint to continue from.
    pub resume: Option<usize>,
}

impl TrainingConfig {
    /// Prediction grid size of every scale for the configured image size.
    pub fn grid_sizes(&self) -> YoloResult<Vec<usize>> {
        self.model.summary()?.grid_sizes(self.image_size)
    }

    pub fn target_builder(&self) -> YoloResult<TargetBuilder> {
        Ok(TargetBuilder::new(&self.model.anchors, &self.grid_sizes()?))
    }

    /// The one-cycle schedule over `steps_per_epoch * num_epochs` iterations.
    pub fn scheduler(&self, steps_per_epoch: usize) -> YoloResult<OneCycleLrScheduler> {
        OneCycleLrSchedulerConfig::new(self.max_lr, steps_per_epoch * self.num_epochs)
            .with_pct_start(self.pct_start)
            .with_div_factor(self.div_factor)
            .with_final_div_factor(self.final_div_factor)
            .init()
            .map_err(YoloError::Config)
    }

    pub fn load_from(artifact_dir: impl AsRef<Path>) -> YoloResult<Self> {
        let path = artifact_dir.as_ref().join("config.json");

        Self::load(&path)
            .map_err(|err| YoloError::Config(format!("{}: {err:?}", path.display())))
    }
}

/// Losses of one epoch, with the mAP when the epoch was evaluated.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct EpochSummary {
    pub epoch: usize,
    pub train_loss: f32,
    pub valid_loss: f32,
    pub map: Option<f32>,
}

pub struct TrainingOutcome<B: AutodiffBackend> {
    pub model: YoloV3<B>,
    pub epochs: Vec<EpochSummary>,
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Evaluation {
    pub accuracy: ClassAccuracyReport,
    pub map: f32,
}

/// Whether an epoch runs the full evaluation: every tenth epoch and the first few.
pub fn should_evaluate(epoch: usize) -> bool {
    epoch % 10 == 0 || (1..=3).contains(&epoch)
}

pub fn checkpoint_dir(artifact_dir: impl AsRef<Path>, epoch: usize) -> PathBuf {
    artifact_dir.as_ref().join(format!("checkpoint_{epoch}"))
}

pub fn dataloader<B: Backend, D: Dataset<YoloItem> + 'static>(
    config: &TrainingConfig,
    dataset: Arc<D>,
    device: B::Device,
    shuffle: bool,
) -> Arc<dyn DataLoader<YoloBatch<B>>> {
    let mut builder = DataLoaderBuilder::new(YoloBatcher::<B>::new(device))
        .batch_size(config.batch_size)
        .num_workers(config.num_workers);
    if shuffle {
        builder = builder.shuffle(config.seed);
    }

    builder.build(dataset)
}

/// Class accuracy and mAP of a model over a loader.
pub fn evaluate<B: Backend>(
    model: &YoloV3<B>,
    loader: &dyn DataLoader<YoloBatch<B>>,
    config: &TrainingConfig,
) -> YoloResult<Evaluation> {
    let accuracy = check_class_accuracy(model, loader.iter(), config.conf_threshold);
    log::info!("Test {accuracy}");

    let (predicted, ground_truth) = evaluation_boxes(
        model,
        loader.iter(),
        config.nms_iou_threshold,
        config.conf_threshold,
        BoxFormat::Midpoint,
    )?;
    let map = mean_average_precision(
        &predicted,
        &ground_truth,
        config.map_iou_threshold,
        BoxFormat::Midpoint,
        model.num_classes(),
    );
    log::info!("MAP: {map}");

    Ok(Evaluation { accuracy, map })
}

/// Loads the model saved at the end of `epoch`.
pub fn load_checkpoint<B: Backend>(
    artifact_dir: impl AsRef<Path>,
    epoch: usize,
    config: &TrainingConfig,
    device: &B::Device,
) -> YoloResult<YoloV3<B>> {
    load_model(checkpoint_dir(artifact_dir, epoch).join("model"), config, device)
}

/// Loads a model file written by [train].
pub fn load_model<B: Backend>(
    path: impl AsRef<Path>,
    config: &TrainingConfig,
    device: &B::Device,
) -> YoloResult<YoloV3<B>> {
    let path = path.as_ref();

    config
        .model
        .init::<B>(device)?
        .load_file(path, &CompactRecorder::new(), device)
        .map_err(|err| YoloError::recorder(path, err))
}

fn save_checkpoint<B, O>(
    dir: &Path,
    model: &YoloV3<B>,
    optim: &O,
    scheduler: &OneCycleLrScheduler,
) -> YoloResult<()>
where
    B: AutodiffBackend,
    O: Optimizer<YoloV3<B>, B>,
{
    fs::create_dir_all(dir).map_err(|err| YoloError::io(dir, err))?;
    let recorder = CompactRecorder::new();

    model
        .clone()
        .save_file(dir.join("model"), &recorder)
        .map_err(|err| YoloError::recorder(dir, err))?;
    Recorder::<B>::record(&recorder, optim.to_record(), dir.join("optim"))
        .map_err(|err| YoloError::recorder(dir, err))?;
    Recorder::<B>::record(&recorder, scheduler.to_record::<B>(), dir.join("scheduler"))
        .map_err(|err| YoloError::recorder(dir, err))?;

    Ok(())
}

fn load_training_state<B, O>(
    dir: &Path,
    model: YoloV3<B>,
    optim: O,
    scheduler: OneCycleLrScheduler,
    device: &B::Device,
) -> YoloResult<(YoloV3<B>, O, OneCycleLrScheduler)>
where
    B: AutodiffBackend,
    O: Optimizer<YoloV3<B>, B>,
{
    let recorder = CompactRecorder::new();

    let model = model
        .load_file(dir.join("model"), &recorder, device)
        .map_err(|err| YoloError::recorder(dir, err))?;
    let optim_record = Recorder::<B>::load(&recorder, dir.join("optim"), device)
        .map_err(|err| YoloError::recorder(dir, err))?;
    let step: usize = Recorder::<B>::load(&recorder, dir.join("scheduler"), device)
        .map_err(|err| YoloError::recorder(dir, err))?;

    Ok((
        model,
        optim.load_record(optim_record),
        scheduler.load_record::<B>(step),
    ))
}

/// Trains a YOLOv3 model, writing the config, checkpoints and final model to `artifact_dir`.
///
/// Each epoch trains on the shuffled training set, reports class accuracy on the training
/// set, and computes the validation loss. Epochs picked by [should_evaluate] also report
/// accuracy and mAP on the test set.
pub fn train<B, D, T>(
    artifact_dir: impl AsRef<Path>,
    config: &TrainingConfig,
    train_dataset: D,
    test_dataset: T,
    device: B::Device,
) -> YoloResult<TrainingOutcome<B>>
where
    B: AutodiffBackend,
    D: Dataset<YoloItem> + 'static,
    T: Dataset<YoloItem> + 'static,
{
    config.grid_sizes()?;
    let artifact_dir = artifact_dir.as_ref();
    fs::create_dir_all(artifact_dir).map_err(|err| YoloError::io(artifact_dir, err))?;
    let config_path = artifact_dir.join("config.json");
    config
        .save(&config_path)
        .map_err(|err| YoloError::io(&config_path, err))?;

    B::seed(config.seed);

    let train_dataset = Arc::new(train_dataset);
    let test_dataset = Arc::new(test_dataset);
    let steps_per_epoch = train_dataset.len().div_ceil(config.batch_size).max(1);

    let dataloader_train = dataloader::<B, _>(config, train_dataset.clone(), device.clone(), true);
    let dataloader_train_eval =
        dataloader::<B::InnerBackend, _>(config, train_dataset, device.clone(), false);
    let dataloader_test =
        dataloader::<B::InnerBackend, _>(config, test_dataset, device.clone(), false);

    let mut model = config.model.init::<B>(&device)?;
    let mut optim = config.optimizer.init::<B, YoloV3<B>>();
    let mut scheduler = config.scheduler(steps_per_epoch)?;
    let mut start_epoch = 0;

    if let Some(epoch) = config.resume {
        let dir = checkpoint_dir(artifact_dir, epoch);
        log::info!("Resuming from {}", dir.display());
        (model, optim, scheduler) = load_training_state(&dir, model, optim, scheduler, &device)?;
        start_epoch = epoch + 1;
    }

    let mut epochs = Vec::with_capacity(config.num_epochs.saturating_sub(start_epoch));

    for epoch in start_epoch..config.num_epochs {
        log::info!("Executing training step for epoch {epoch}");

        let mut train_loss = 0.0;
        let mut iterations = 0;
        for (iteration, batch) in dataloader_train.iter().enumerate() {
            let lr = scheduler.step();
            let output = TrainStep::step(&model, batch);
            let loss = tensor_to_scalar(output.item.loss);
            log::debug!("Epoch {epoch} iteration {iteration}: loss {loss:.4}, lr {lr:.3e}");

            model = optim.step(lr, model, output.grads);
            train_loss += loss;
            iterations += 1;
        }
        let train_loss = train_loss / iterations.max(1) as f32;

        if config.save_model {
            let dir = checkpoint_dir(artifact_dir, epoch);
            save_checkpoint(&dir, &model, &optim, &scheduler)?;
            log::info!("Saved {}", dir.display());
        }

        let model_valid = model.valid();
        let accuracy = check_class_accuracy(
            &model_valid,
            dataloader_train_eval.iter(),
            config.conf_threshold,
        );
        log::info!("Train {accuracy}");

        log::info!("Executing validation step for epoch {epoch}");
        let mut valid_loss = 0.0;
        let mut iterations = 0;
        for batch in dataloader_test.iter() {
            let output = ValidStep::step(&model_valid, batch);
            valid_loss += tensor_to_scalar(output.loss);
            iterations += 1;
        }
        let valid_loss = valid_loss / iterations.max(1) as f32;

        let map = if should_evaluate(epoch) {
            Some(evaluate(&model_valid, dataloader_test.as_ref(), config)?.map)
        } else {
            None
        };

        log::info!("Epoch {epoch}: train loss {train_loss:.4}, valid loss {valid_loss:.4}");
        epochs.push(EpochSummary {
            epoch,
            train_loss,
            valid_loss,
            map,
        });
    }

    let model_path = artifact_dir.join("model");
    model
        .clone()
        .save_file(&model_path, &CompactRecorder::new())
        .map_err(|err| YoloError::recorder(&model_path, err))?;

    Ok(TrainingOutcome { model, epochs })
}
