use std::path::{Path, PathBuf};

use burn::{
    prelude::*,
    record::{FullPrecisionSettings, NamedMpkFileRecorder, Recorder, RecorderError},
};
use thiserror::Error;

use crate::model::{Model, ModelConfig, ModelRecord};

/// Recorder writing one named MessagePack entry per module field (`conv1`, `bn1`, ..., `fc`).
pub type WeightsRecorder = NamedMpkFileRecorder<FullPrecisionSettings>;

/// Error type for saving and restoring model weights.
#[derive(Error, Debug)]
pub enum WeightsError {
    /// The file could not be written, read or decoded.
    #[error("recorder error: {0}")]
    Recorder(#[from] RecorderError),

    /// The stored tensors were produced by a different model definition.
    #[error("parameter `{parameter}`: expected shape {expected:?}, found {found:?}")]
    ShapeMismatch {
        parameter: String,
        expected: Vec<usize>,
        found: Vec<usize>,
    },
}

/// Saves the model parameters. The recorder appends the `.mpk` extension.
pub fn save_weights<B: Backend, P: Into<PathBuf>>(
    model: &Model<B>,
    path: P,
) -> Result<(), WeightsError> {
    let path = path.into();
    model.clone().save_file(path.clone(), &WeightsRecorder::new())?;
    log::info!("Model weights saved to {}.mpk", path.display());

    Ok(())
}

/// Restores the parameters saved by [save_weights](save_weights) into a fresh model
/// built from `config`.
///
/// Every stored tensor is checked against the shape the fresh model expects before
/// it is loaded.
pub fn load_weights<B: Backend, P: AsRef<Path>>(
    config: &ModelConfig,
    path: P,
    device: &B::Device,
) -> Result<Model<B>, WeightsError> {
    let model = config.init::<B>(device);

    let record: ModelRecord<B> =
        WeightsRecorder::new().load(path.as_ref().to_path_buf(), device)?;
    check_shapes(&model.parameter_shapes(), &record.parameter_shapes())?;

    Ok(model.load_record(record))
}

fn check_shapes(
    expected: &[(String, Vec<usize>)],
    found: &[(String, Vec<usize>)],
) -> Result<(), WeightsError> {
    for index in 0..expected.len().max(found.len()) {
        let mismatch = match (expected.get(index), found.get(index)) {
            (Some((name, shape)), Some((found_name, found_shape))) => {
                if name == found_name && shape == found_shape {
                    continue;
                }
                // A renamed tensor is reported with the name the model expects.
                (name.clone(), shape.clone(), found_shape.clone())
            }
            (Some((name, shape)), None) => (name.clone(), shape.clone(), Vec::new()),
            (None, Some((name, shape))) => (name.clone(), Vec::new(), shape.clone()),
            (None, None) => break,
        };

        return Err(WeightsError::ShapeMismatch {
            parameter: mismatch.0,
            expected: mismatch.1,
            found: mismatch.2,
        });
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{HEIGHT, WIDTH};
    use burn::{
        backend::NdArray,
        tensor::{Distribution, Tolerance},
    };

    type TestBackend = NdArray<f32>;

    #[test]
    fn reloaded_model_reproduces_outputs() {
        let device = Default::default();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model");
        let config = ModelConfig::new();
        let model = config.init::<TestBackend>(&device);

        save_weights(&model, &path).unwrap();
        assert!(dir.path().join("model.mpk").exists());

        let reloaded = load_weights::<TestBackend, _>(&config, &path, &device).unwrap();
        let images =
            Tensor::<TestBackend, 4>::random([5, 1, HEIGHT, WIDTH], Distribution::Default, &device);

        let expected = model.forward(images.clone()).into_data();
        reloaded
            .forward(images)
            .into_data()
            .assert_approx_eq::<f32>(&expected, Tolerance::default());
    }

    #[test]
    fn missing_file_is_a_recorder_error() {
        let device = Default::default();
        let dir = tempfile::tempdir().unwrap();

        let path = dir.path().join("missing");

        let result = load_weights::<TestBackend, _>(&ModelConfig::new(), path, &device);

        assert!(matches!(result, Err(WeightsError::Recorder(_))));
    }

    #[test]
    fn changed_definition_is_a_shape_mismatch() {
        let device = Default::default();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("model");

        let narrow = ModelConfig::new().with_channels([16, 64, 128]);
        save_weights(&narrow.init::<TestBackend>(&device), &path).unwrap();

        let result = load_weights::<TestBackend, _>(&ModelConfig::new(), &path, &device);

        match result {
            Err(WeightsError::ShapeMismatch {
                parameter,
                expected,
                found,
            }) => {
                assert_eq!(parameter, "conv1.weight");
                assert_eq!(expected, vec![32, 1, 3, 3]);
                assert_eq!(found, vec![16, 1, 3, 3]);
            }
            other => panic!("expected a shape mismatch, got {other:?}"),
        }
    }

    #[test]
    fn shape_check_reports_first_difference() {
        let expected = vec![
            ("fc.weight".to_string(), vec![128, 26]),
            ("fc.bias".to_string(), vec![26]),
        ];
        let found = vec![
            ("fc.weight".to_string(), vec![128, 26]),
            ("fc.bias".to_string(), vec![24]),
        ];

        assert!(check_shapes(&expected, &expected).is_ok());
        assert!(matches!(
            check_shapes(&expected, &found),
            Err(WeightsError::ShapeMismatch { parameter, .. }) if parameter == "fc.bias"
        ));
    }

    #[test]
    fn shape_check_reports_missing_extra_and_renamed_tensors() {
        let expected = vec![
            ("fc.weight".to_string(), vec![128, 26]),
            ("fc.bias".to_string(), vec![26]),
        ];

        let missing = vec![expected[0].clone()];
        match check_shapes(&expected, &missing) {
            Err(WeightsError::ShapeMismatch {
                parameter,
                expected,
                found,
            }) => {
                assert_eq!(parameter, "fc.bias");
                assert_eq!(expected, vec![26]);
                assert!(found.is_empty());
            }
            other => panic!("expected a missing tensor, got {other:?}"),
        }

        let mut extra = expected.clone();
        extra.push(("fc.scale".to_string(), vec![26]));
        match check_shapes(&expected, &extra) {
            Err(WeightsError::ShapeMismatch {
                parameter,
                expected,
                found,
            }) => {
                assert_eq!(parameter, "fc.scale");
                assert!(expected.is_empty());
                assert_eq!(found, vec![26]);
            }
            other => panic!("expected an extra tensor, got {other:?}"),
        }

        let renamed = vec![
            expected[0].clone(),
            ("fc.offset".to_string(), vec![26]),
        ];
        assert!(matches!(
            check_shapes(&expected, &renamed),
            Err(WeightsError::ShapeMismatch { parameter, .. }) if parameter == "fc.bias"
        ));
    }
}
