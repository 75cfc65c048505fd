use std::path::Path;

use asl_signs::{
    data::{SignLanguageDataset, HEIGHT, NUM_CLASSES, NUM_PIXELS, WIDTH},
    export::{export_onnx, ExportError, ONNX_FILE},
    inference::{predict, predictions_from_logits},
    model::ModelConfig,
    onnx::{Dimension, OnnxGraph, BATCH_DIM},
    training::{train, TrainingConfig, CONFIG_FILE, WEIGHTS_FILE},
    weights::{load_weights, WeightsError},
};
use burn::{
    backend::{Autodiff, NdArray},
    config::Config,
    optim::AdamConfig,
    tensor::{Distribution, Tensor},
};

type TestBackend = NdArray<f32>;
type TestAutodiffBackend = Autodiff<TestBackend>;

/// Writes a CSV where every pixel of a row has the same intensity.
fn write_csv(path: &Path, rows: &[(u8, u8)]) {
    let mut text = String::from("label");
    for i in 1..=NUM_PIXELS {
        text.push_str(&format!(",pixel{i}"));
    }
    text.push('\n');

    for (label, pixel) in rows {
        text.push_str(&label.to_string());
        for _ in 0..NUM_PIXELS {
            text.push_str(&format!(",{pixel}"));
        }
        text.push('\n');
    }

    std::fs::write(path, text).unwrap();
}

#[test]
fn train_then_export_runs_at_any_batch_size() {
    let device = Default::default();
    let dir = tempfile::tempdir().unwrap();
    let artifact_dir = dir.path().join("artifacts");

    let rows: Vec<(u8, u8)> = (0..10).map(|i| (i * 2, i * 25)).collect();
    let train_csv = dir.path().join("sign_mnist_train.csv");
    let test_csv = dir.path().join("sign_mnist_test.csv");
    write_csv(&train_csv, &rows);
    write_csv(&test_csv, &rows);

    let config = TrainingConfig::new(ModelConfig::new(), AdamConfig::new())
        .with_num_epochs(1)
        .with_batch_size(4);
    let report = train::<TestAutodiffBackend>(
        &artifact_dir,
        &config,
        SignLanguageDataset::from_csv(&train_csv).unwrap(),
        SignLanguageDataset::from_csv(&test_csv).unwrap(),
        device,
    )
    .unwrap();

    assert_eq!(report.epoch_losses.len(), 1);
    assert_eq!(report.evaluation.predictions.len(), 10);
    assert!(report
        .evaluation
        .predictions
        .iter()
        .all(|class| *class < NUM_CLASSES));
    assert!(artifact_dir.join(CONFIG_FILE).exists());

    let onnx_path = artifact_dir.join(ONNX_FILE);
    export_onnx::<TestBackend>(&artifact_dir, &onnx_path, &device).unwrap();

    let graph = OnnxGraph::from_file(&onnx_path).unwrap();
    let model = load_weights::<TestBackend, _>(
        &config.model,
        artifact_dir.join(WEIGHTS_FILE),
        &device,
    )
    .unwrap();
    assert_eq!(
        graph.input_shape()[0],
        Dimension::Symbolic(BATCH_DIM.to_string())
    );

    for batch_size in [3, 7] {
        let images = Tensor::<TestBackend, 4>::random(
            [batch_size, 1, HEIGHT, WIDTH],
            Distribution::Default,
            &device,
        );

        let logits = graph.run(images.clone(), &device).unwrap();

        assert_eq!(logits.dims(), [batch_size, NUM_CLASSES]);

        let graph_classes: Vec<usize> = predictions_from_logits(logits)
            .iter()
            .map(|prediction| prediction.class)
            .collect();
        let model_classes: Vec<usize> = predict(&model, images)
            .iter()
            .map(|prediction| prediction.class)
            .collect();
        assert_eq!(graph_classes, model_classes);
    }
}

#[test]
fn export_rejects_weights_of_another_architecture() {
    let device = Default::default();
    let dir = tempfile::tempdir().unwrap();

    let rows: Vec<(u8, u8)> = (0..4).map(|i| (i, i * 60)).collect();
    let csv = dir.path().join("signs.csv");
    write_csv(&csv, &rows);

    let config = TrainingConfig::new(ModelConfig::new(), AdamConfig::new())
        .with_num_epochs(1)
        .with_batch_size(2);
    train::<TestAutodiffBackend>(
        dir.path(),
        &config,
        SignLanguageDataset::from_csv(&csv).unwrap(),
        SignLanguageDataset::from_csv(&csv).unwrap(),
        device,
    )
    .unwrap();

    // Same weights, but the saved configuration now asks for a narrower first block.
    let mut altered = config.clone();
    altered.model = ModelConfig::new().with_channels([16, 64, 128]);
    altered.save(dir.path().join(CONFIG_FILE)).unwrap();

    let result = export_onnx::<TestBackend>(dir.path(), &dir.path().join(ONNX_FILE), &device);

    assert!(matches!(
        result,
        Err(ExportError::Weights(WeightsError::ShapeMismatch { parameter, .. }))
            if parameter == "conv1.weight"
    ));
    assert!(!dir.path().join(ONNX_FILE).exists());
}
