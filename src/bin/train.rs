use std::{error::Error, path::Path};

use asl_signs::{
    data::SignLanguageDataset,
    inference::infer,
    logger::install_logger,
    model::ModelConfig,
    training::{train, TrainingConfig, WEIGHTS_FILE},
    weights::load_weights,
};
use burn::{
    backend::{ndarray::NdArrayDevice, Autodiff, NdArray},
    data::dataset::Dataset,
    optim::AdamConfig,
};

const TRAIN_CSV: &str = "data/sign_mnist_train.csv";
const TEST_CSV: &str = "data/sign_mnist_test.csv";
const ARTIFACT_DIR: &str = "artifacts";
const LOG_FILE: &str = "experiment.log";

type Backend = Autodiff<NdArray<f32>>;

fn main() -> Result<(), Box<dyn Error>> {
    let artifact_dir = Path::new(ARTIFACT_DIR);
    install_logger(&artifact_dir.join(LOG_FILE))?;

    let dataset_train = SignLanguageDataset::from_csv(TRAIN_CSV)?;
    let dataset_test = SignLanguageDataset::from_csv(TEST_CSV)?;
    let sample = dataset_test.get(0);

    let config = TrainingConfig::new(ModelConfig::new(), AdamConfig::new());
    let report = train::<Backend>(
        artifact_dir,
        &config,
        dataset_train,
        dataset_test,
        NdArrayDevice::Cpu,
    )?;

    log::info!(
        "Training done, final accuracy {:.2}%",
        report.evaluation.accuracy() * 100.0
    );

    // Reload the saved weights and classify the first test sample with them.
    if let Some(item) = sample {
        let device = NdArrayDevice::Cpu;
        let weights_path = artifact_dir.join(WEIGHTS_FILE);
        let model = load_weights::<NdArray<f32>, _>(&config.model, weights_path, &device)?;
        infer(&model, item, &device);
    }

    Ok(())
}
