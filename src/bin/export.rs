use std::{error::Error, path::Path};

use asl_signs::{
    data::{HEIGHT, WIDTH},
    export::{export_onnx, ONNX_FILE},
    inference::{predict, predictions_from_logits},
    logger::install_logger,
    onnx::OnnxGraph,
    training::{TrainingConfig, CONFIG_FILE, WEIGHTS_FILE},
    weights::load_weights,
};
use burn::{
    backend::{ndarray::NdArrayDevice, NdArray},
    config::Config,
    tensor::{Distribution, Tensor},
};

const ARTIFACT_DIR: &str = "artifacts";
const LOG_FILE: &str = "experiment.log";

type Backend = NdArray<f32>;

fn main() -> Result<(), Box<dyn Error>> {
    let artifact_dir = Path::new(ARTIFACT_DIR);
    install_logger(&artifact_dir.join(LOG_FILE))?;

    let device = NdArrayDevice::Cpu;
    let onnx_path = artifact_dir.join(ONNX_FILE);
    export_onnx::<Backend>(artifact_dir, &onnx_path, &device)?;

    // Reload the written file and run it at a batch size other than the checked one.
    let graph = OnnxGraph::from_file(&onnx_path)?;
    let images =
        Tensor::<Backend, 4>::random([3, 1, HEIGHT, WIDTH], Distribution::Default, &device);
    let logits = graph.run(images.clone(), &device)?;
    log::info!("ONNX graph output shape {:?}", logits.dims());

    let config = TrainingConfig::load(artifact_dir.join(CONFIG_FILE))?;
    let weights_path = artifact_dir.join(WEIGHTS_FILE);
    let model = load_weights::<Backend, _>(&config.model, weights_path, &device)?;

    for (onnx, native) in predictions_from_logits(logits)
        .into_iter()
        .zip(predict(&model, images))
    {
        log::info!(
            "Random input classified as {} ({:.1}%) by the ONNX graph, {} ({:.1}%) by the model",
            onnx.letter,
            onnx.confidence * 100.0,
            native.letter,
            native.confidence * 100.0
        );
    }

    Ok(())
}
