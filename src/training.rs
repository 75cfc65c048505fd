use std::path::{Path, PathBuf};

use burn::{
    data::{dataloader::DataLoaderBuilder, dataset::Dataset},
    module::AutodiffModule,
    optim::{AdamConfig, Optimizer},
    prelude::*,
    tensor::backend::AutodiffBackend,
    train::{TrainStep, ValidStep},
};
use thiserror::Error;

use crate::{
    data::{SignBatcher, SignLanguageDataset},
    inference::letter,
    model::{Model, ModelConfig},
    weights::{save_weights, WeightsError},
};

/// Training configuration, saved next to the weights as `config.json`.
#[derive(Config)]
pub struct TrainingConfig {
    pub model: ModelConfig,
    pub optimizer: AdamConfig,
    #[config(default = 20)]
    pub num_epochs: usize,
    #[config(default = 64)]
    pub batch_size: usize,
    #[config(default = 1)]
    pub num_workers: usize,
    #[config(default = 42)]
    pub seed: u64,
    #[config(default = 1.0e-3)]
    pub learning_rate: f64,
}

/// File name of the saved [TrainingConfig](TrainingConfig) in the artifact directory.
pub const CONFIG_FILE: &str = "config.json";
/// File stem of the saved weights in the artifact directory.
pub const WEIGHTS_FILE: &str = "model";

#[derive(Error, Debug)]
pub enum TrainingError {
    #[error("could not write `{path}`: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Weights(#[from] WeightsError),
}

/// Predicted and true class of every evaluated sample, in dataset order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Evaluation {
    pub predictions: Vec<usize>,
    pub targets: Vec<usize>,
}

impl Evaluation {
    /// Fraction of exact matches, `0.0` when nothing was evaluated.
    pub fn accuracy(&self) -> f64 {
        if self.targets.is_empty() {
            return 0.0;
        }

        let correct = self
            .predictions
            .iter()
            .zip(&self.targets)
            .filter(|(prediction, target)| prediction == target)
            .count();

        correct as f64 / self.targets.len() as f64
    }
}

#[derive(Debug, Clone)]
pub struct TrainingReport {
    /// Sum of the batch losses of every epoch.
    pub epoch_losses: Vec<f32>,
    /// Test-set evaluation of the final model.
    pub evaluation: Evaluation,
}

/// Trains a fresh model, saves it in `artifact_dir` and evaluates it on the test set.
pub fn train<B: AutodiffBackend>(
    artifact_dir: &Path,
    config: &TrainingConfig,
    dataset_train: SignLanguageDataset,
    dataset_test: SignLanguageDataset,
    device: B::Device,
) -> Result<TrainingReport, TrainingError> {
    create_artifact_dir(artifact_dir)?;

    let config_path = artifact_dir.join(CONFIG_FILE);
    config
        .save(&config_path)
        .map_err(|source| TrainingError::Io {
            path: config_path,
            source,
        })?;

    B::seed(config.seed);
    log_missing_classes(&dataset_train);

    let dataloader_train = DataLoaderBuilder::new(SignBatcher::default())
        .batch_size(config.batch_size)
        .shuffle(config.seed)
        .num_workers(config.num_workers)
        .set_device(device.clone())
        .build(dataset_train);

    let mut model: Model<B> = config.model.init(&device);
    let mut optim = config.optimizer.init::<B, Model<B>>();
    let mut epoch_losses = Vec::with_capacity(config.num_epochs);

    log::info!("Training model for {} epochs", config.num_epochs);

    for epoch in 1..config.num_epochs + 1 {
        let mut total_loss = 0.0;

        for batch in dataloader_train.iter() {
            let output = TrainStep::step(&model, batch);
            total_loss += output.item.loss.into_scalar().elem::<f32>();

            // Gradients come from a fresh backward pass, nothing accumulates across steps.
            model = optim.step(config.learning_rate, model, output.grads);
        }

        log::info!("Epoch {epoch}/{} | Loss: {total_loss:.4}", config.num_epochs);
        epoch_losses.push(total_loss);
    }

    save_weights(&model, artifact_dir.join(WEIGHTS_FILE))?;

    let evaluation = evaluate(&model.valid(), dataset_test, config.batch_size, &device);
    log::info!(
        "Validation Accuracy: {:.2}% ({} samples)",
        evaluation.accuracy() * 100.0,
        evaluation.targets.len()
    );

    Ok(TrainingReport {
        epoch_losses,
        evaluation,
    })
}

/// Runs the model over the whole dataset in order and collects predicted and true classes.
///
/// Pass a model on a non-autodiff backend (see `AutodiffModule::valid`) so batch
/// normalization uses its running statistics and dropout is disabled.
pub fn evaluate<B: Backend>(
    model: &Model<B>,
    dataset: SignLanguageDataset,
    batch_size: usize,
    device: &B::Device,
) -> Evaluation {
    let dataloader = DataLoaderBuilder::new(SignBatcher::default())
        .batch_size(batch_size)
        .set_device(device.clone())
        .build(dataset);

    let mut evaluation = Evaluation::default();

    for batch in dataloader.iter() {
        let output = ValidStep::step(model, batch);
        let predictions = output.output.argmax(1).squeeze::<1>(1);

        evaluation
            .predictions
            .extend(predictions.into_data().iter::<i64>().map(|class| class as usize));
        evaluation
            .targets
            .extend(output.targets.into_data().iter::<i64>().map(|class| class as usize));
    }

    evaluation
}

fn create_artifact_dir(artifact_dir: &Path) -> Result<(), TrainingError> {
    std::fs::create_dir_all(artifact_dir).map_err(|source| TrainingError::Io {
        path: artifact_dir.to_path_buf(),
        source,
    })
}

fn log_missing_classes(dataset: &SignLanguageDataset) {
    if dataset.is_empty() {
        log::warn!("Training set is empty");
        return;
    }

    let missing: Vec<char> = dataset
        .class_histogram()
        .iter()
        .enumerate()
        .filter(|(_, count)| **count == 0)
        .map(|(class, _)| letter(class))
        .collect();

    if !missing.is_empty() {
        log::warn!("No training samples for classes {missing:?}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{tests::csv_text, NUM_CLASSES};
    use burn::backend::{Autodiff, NdArray};

    type TestBackend = NdArray<f32>;
    type TestAutodiffBackend = Autodiff<TestBackend>;

    fn dataset(rows: &[(u8, u8)]) -> SignLanguageDataset {
        SignLanguageDataset::from_reader(csv_text(rows).as_bytes()).unwrap()
    }

    #[test]
    fn accuracy_is_the_fraction_of_exact_matches() {
        let evaluation = Evaluation {
            predictions: vec![0, 1, 2, 3],
            targets: vec![0, 1, 5, 3],
        };

        assert_eq!(evaluation.accuracy(), 0.75);
        assert_eq!(Evaluation::default().accuracy(), 0.0);
    }

    #[test]
    fn default_config_matches_the_reference_run() {
        let config = TrainingConfig::new(ModelConfig::new(), AdamConfig::new());

        assert_eq!(config.num_epochs, 20);
        assert_eq!(config.batch_size, 64);
        assert_eq!(config.model.num_classes, NUM_CLASSES);
        assert_eq!(config.model.dropout, 0.3);
    }

    #[test]
    fn evaluation_keeps_dataset_order() {
        let device = Default::default();
        let model = ModelConfig::new().init::<TestBackend>(&device);
        let rows: Vec<(u8, u8)> = (0..7).map(|i| (i * 3, i * 30)).collect();

        let evaluation = evaluate(&model, dataset(&rows), 3, &device);

        assert_eq!(evaluation.targets, vec![0, 3, 6, 9, 12, 15, 18]);
        assert_eq!(evaluation.predictions.len(), 7);
        assert!(evaluation.predictions.iter().all(|class| *class < NUM_CLASSES));
    }

    #[test]
    fn training_writes_config_and_weights() {
        let device = Default::default();
        let dir = tempfile::tempdir().unwrap();
        let config = TrainingConfig::new(ModelConfig::new(), AdamConfig::new())
            .with_num_epochs(2)
            .with_batch_size(4);

        let report = train::<TestAutodiffBackend>(
            dir.path(),
            &config,
            dataset(&[(0, 10), (1, 200), (0, 20), (1, 220), (0, 15), (1, 210)]),
            dataset(&[(0, 12), (1, 205)]),
            device,
        )
        .unwrap();

        assert_eq!(report.epoch_losses.len(), 2);
        assert!(report.epoch_losses.iter().all(|loss| loss.is_finite() && *loss > 0.0));
        assert_eq!(report.evaluation.targets, vec![0, 1]);
        assert!(dir.path().join(CONFIG_FILE).exists());
        assert!(dir.path().join(format!("{WEIGHTS_FILE}.mpk")).exists());

        let saved = TrainingConfig::load(dir.path().join(CONFIG_FILE)).unwrap();
        assert_eq!(saved.num_epochs, 2);
        assert_eq!(saved.model.channels, config.model.channels);
    }
}
