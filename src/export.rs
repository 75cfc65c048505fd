use std::path::{Path, PathBuf};

use burn::{config::ConfigError, prelude::*, tensor::Distribution};
use protobuf::{EnumOrUnknown, Message, MessageField};
use thiserror::Error;

use crate::{
    data::{HEIGHT, WIDTH},
    model::{Model, KERNEL_SIZE, PADDING, POOL_SIZE},
    onnx::{
        attribute_proto::AttributeType, tensor_shape_proto, type_proto, AttributeProto, Dimension,
        GraphProto, ModelProto, NodeProto, OperatorSetIdProto, TensorProto, TensorShapeProto,
        TypeProto, ValueInfoProto, BATCH_DIM, ELEM_TYPE_FLOAT, INPUT_NAME, OUTPUT_NAME,
    },
    training::{TrainingConfig, CONFIG_FILE, WEIGHTS_FILE},
    weights::{load_weights, WeightsError},
};

/// ONNX IR version written in the model header.
pub const IR_VERSION: i64 = 8;
/// Version of the default operator set.
pub const OPSET_VERSION: i64 = 17;
/// File name of the exported model in the artifact directory.
pub const ONNX_FILE: &str = "model.onnx";

const GRAPH_NAME: &str = "asl_classifier";

#[derive(Error, Debug)]
pub enum ExportError {
    #[error("could not load `{path}`: {source}")]
    Config {
        path: PathBuf,
        #[source]
        source: ConfigError,
    },

    #[error(transparent)]
    Weights(#[from] WeightsError),

    #[error("synthetic input produced output shape {found:?}, expected {expected:?}")]
    OutputShape {
        expected: [usize; 2],
        found: [usize; 2],
    },

    #[error("could not encode ONNX model: {0}")]
    Encode(#[from] protobuf::Error),

    #[error("could not write `{path}`: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Rebuilds the trained model from `artifact_dir` and writes it as an ONNX graph.
///
/// Use a non-autodiff backend: the model then runs in evaluation mode, with batch
/// normalization on its running statistics and dropout disabled.
pub fn export_onnx<B: Backend>(
    artifact_dir: &Path,
    output_path: &Path,
    device: &B::Device,
) -> Result<(), ExportError> {
    let config_path = artifact_dir.join(CONFIG_FILE);
    let config = TrainingConfig::load(&config_path).map_err(|source| ExportError::Config {
        path: config_path,
        source,
    })?;

    let model = load_weights::<B, _>(&config.model, artifact_dir.join(WEIGHTS_FILE), device)?;
    let bytes = to_onnx(&model, device)?.write_to_bytes()?;

    std::fs::write(output_path, bytes).map_err(|source| ExportError::Io {
        path: output_path.to_path_buf(),
        source,
    })?;
    log::info!("Model exported to {}", output_path.display());

    Ok(())
}

/// Converts the model into an ONNX graph with a dynamic batch dimension.
///
/// The graph is assembled from the fixed layer list of [Model](Model), one node per
/// layer, with the parameters stored as initializers. A synthetic `[1, 1, 28, 28]`
/// input is run through the model beforehand only to check that it yields one logit
/// row; the graph itself does not depend on that pass.
pub fn to_onnx<B: Backend>(
    model: &Model<B>,
    device: &B::Device,
) -> Result<ModelProto, ExportError> {
    let num_classes = model.fc.weight.val().dims()[1];

    let input = Tensor::<B, 4>::random([1, 1, HEIGHT, WIDTH], Distribution::Default, device);
    let found = model.forward(input).dims();
    if found != [1, num_classes] {
        return Err(ExportError::OutputShape {
            expected: [1, num_classes],
            found,
        });
    }

    let mut builder = GraphBuilder::new(GRAPH_NAME);
    let batch = Dimension::Symbolic(BATCH_DIM.to_string());

    builder.input(
        INPUT_NAME,
        &[
            batch.clone(),
            Dimension::Fixed(1),
            Dimension::Fixed(HEIGHT),
            Dimension::Fixed(WIDTH),
        ],
    );
    builder.output(OUTPUT_NAME, &[batch, Dimension::Fixed(num_classes)]);

    let blocks = [
        (&model.conv1, &model.bn1),
        (&model.conv2, &model.bn2),
        (&model.conv3, &model.bn3),
    ];
    let num_blocks = blocks.len();
    let mut x = INPUT_NAME.to_string();

    for (index, (conv, norm)) in blocks.into_iter().enumerate() {
        let block = index + 1;

        let name = format!("conv{block}");
        let mut inputs = vec![x, builder.initializer(&format!("{name}.weight"), conv.weight.val())];
        if let Some(bias) = &conv.bias {
            inputs.push(builder.initializer(&format!("{name}.bias"), bias.val()));
        }
        x = builder.node(
            "Conv",
            &name,
            inputs,
            vec![
                ints("kernel_shape", &[KERNEL_SIZE, KERNEL_SIZE]),
                ints("pads", &[PADDING; 4]),
                ints("strides", &[1, 1]),
                ints("dilations", &[1, 1]),
                int("group", 1),
            ],
        );

        // PyTorch names: weight = gamma, bias = beta.
        let name = format!("bn{block}");
        let inputs = vec![
            x,
            builder.initializer(&format!("{name}.weight"), norm.gamma.val()),
            builder.initializer(&format!("{name}.bias"), norm.beta.val()),
            builder.initializer(&format!("{name}.running_mean"), norm.running_mean.value()),
            builder.initializer(&format!("{name}.running_var"), norm.running_var.value()),
        ];
        x = builder.node(
            "BatchNormalization",
            &name,
            inputs,
            vec![
                float("epsilon", norm.epsilon as f32),
                // ONNX weighs the running statistic, burn weighs the new batch.
                float("momentum", (1.0 - norm.momentum) as f32),
            ],
        );

        x = builder.node("Relu", &format!("relu{block}"), vec![x], vec![]);

        if block < num_blocks {
            x = builder.node(
                "MaxPool",
                &format!("pool{block}"),
                vec![x],
                vec![
                    ints("kernel_shape", &[POOL_SIZE, POOL_SIZE]),
                    ints("strides", &[POOL_SIZE, POOL_SIZE]),
                    ints("pads", &[0; 4]),
                ],
            );
        }
    }

    x = builder.node("GlobalAveragePool", "global_pool", vec![x], vec![]);
    x = builder.node("Flatten", "flatten", vec![x], vec![int("axis", 1)]);

    // Stored as [num_classes, channels] like a PyTorch linear layer, hence transB.
    let mut inputs = vec![x, builder.initializer("fc.weight", model.fc.weight.val().transpose())];
    if let Some(bias) = &model.fc.bias {
        inputs.push(builder.initializer("fc.bias", bias.val()));
    }
    builder.node_with_output(
        "Gemm",
        "fc",
        inputs,
        OUTPUT_NAME,
        vec![float("alpha", 1.0), float("beta", 1.0), int("transB", 1)],
    );

    let mut opset = OperatorSetIdProto::new();
    opset.version = OPSET_VERSION;

    let mut proto = ModelProto::new();
    proto.ir_version = IR_VERSION;
    proto.producer_name = env!("CARGO_PKG_NAME").to_string();
    proto.producer_version = env!("CARGO_PKG_VERSION").to_string();
    proto.opset_import.push(opset);
    proto.graph = MessageField::some(builder.build());

    Ok(proto)
}

struct GraphBuilder {
    graph: GraphProto,
}

impl GraphBuilder {
    fn new(name: &str) -> Self {
        let mut graph = GraphProto::new();
        graph.name = name.to_string();

        Self { graph }
    }

    fn input(&mut self, name: &str, dims: &[Dimension]) {
        self.graph.input.push(value_info(name, dims));
    }

    fn output(&mut self, name: &str, dims: &[Dimension]) {
        self.graph.output.push(value_info(name, dims));
    }

    /// Adds a float initializer and returns its name.
    fn initializer<B: Backend, const D: usize>(
        &mut self,
        name: &str,
        tensor: Tensor<B, D>,
    ) -> String {
        let mut proto = TensorProto::new();
        proto.name = name.to_string();
        proto.data_type = ELEM_TYPE_FLOAT;
        proto.dims = tensor.dims().iter().map(|dim| *dim as i64).collect();
        proto.float_data = tensor.into_data().iter::<f32>().collect();

        self.graph.initializer.push(proto);
        name.to_string()
    }

    /// Adds a node and returns the name of its output value.
    fn node(
        &mut self,
        op_type: &str,
        name: &str,
        inputs: Vec<String>,
        attributes: Vec<AttributeProto>,
    ) -> String {
        let output = format!("{name}_output");
        self.node_with_output(op_type, name, inputs, &output, attributes);
        output
    }

    fn node_with_output(
        &mut self,
        op_type: &str,
        name: &str,
        inputs: Vec<String>,
        output: &str,
        attributes: Vec<AttributeProto>,
    ) {
        let mut node = NodeProto::new();
        node.op_type = op_type.to_string();
        node.name = name.to_string();
        node.input = inputs;
        node.output = vec![output.to_string()];
        node.attribute = attributes;

        self.graph.node.push(node);
    }

    fn build(self) -> GraphProto {
        self.graph
    }
}

fn value_info(name: &str, dims: &[Dimension]) -> ValueInfoProto {
    let mut shape = TensorShapeProto::new();
    for dim in dims {
        let mut proto = tensor_shape_proto::Dimension::new();
        match dim {
            Dimension::Fixed(size) => proto.set_dim_value(*size as i64),
            Dimension::Symbolic(param) => proto.set_dim_param(param.clone()),
        }
        shape.dim.push(proto);
    }

    let mut tensor_type = type_proto::Tensor::new();
    tensor_type.elem_type = ELEM_TYPE_FLOAT;
    tensor_type.shape = MessageField::some(shape);

    let mut type_proto = TypeProto::new();
    type_proto.set_tensor_type(tensor_type);

    let mut value = ValueInfoProto::new();
    value.name = name.to_string();
    value.type_ = MessageField::some(type_proto);
    value
}

fn attribute(name: &str, kind: AttributeType) -> AttributeProto {
    let mut attribute = AttributeProto::new();
    attribute.name = name.to_string();
    attribute.type_ = EnumOrUnknown::new(kind);
    attribute
}

fn ints(name: &str, values: &[usize]) -> AttributeProto {
    let mut attribute = attribute(name, AttributeType::INTS);
    attribute.ints = values.iter().map(|value| *value as i64).collect();
    attribute
}

fn int(name: &str, value: i64) -> AttributeProto {
    let mut attribute = attribute(name, AttributeType::INT);
    attribute.i = value;
    attribute
}

fn float(name: &str, value: f32) -> AttributeProto {
    let mut attribute = attribute(name, AttributeType::FLOAT);
    attribute.f = value;
    attribute
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{data::NUM_CLASSES, model::ModelConfig, onnx::OnnxGraph};
    use burn::{backend::NdArray, tensor::Tolerance};

    type TestBackend = NdArray<f32>;

    #[test]
    fn graph_declares_a_dynamic_batch() {
        let device = Default::default();
        let model = ModelConfig::new().init::<TestBackend>(&device);

        let bytes = to_onnx(&model, &device).unwrap().write_to_bytes().unwrap();
        let graph = OnnxGraph::from_bytes(&bytes).unwrap();

        let batch = Dimension::Symbolic(BATCH_DIM.to_string());
        assert_eq!(
            graph.input_shape(),
            &[
                batch.clone(),
                Dimension::Fixed(1),
                Dimension::Fixed(HEIGHT),
                Dimension::Fixed(WIDTH)
            ]
        );
        assert_eq!(graph.output_shape(), &[batch, Dimension::Fixed(NUM_CLASSES)]);
        assert_eq!(graph.opset_version(), Some(OPSET_VERSION));
    }

    #[test]
    fn graph_follows_the_layer_order() {
        let device = Default::default();
        let model = ModelConfig::new().init::<TestBackend>(&device);

        let bytes = to_onnx(&model, &device).unwrap().write_to_bytes().unwrap();
        let graph = OnnxGraph::from_bytes(&bytes).unwrap();

        assert_eq!(
            graph.op_types(),
            vec![
                "Conv",
                "BatchNormalization",
                "Relu",
                "MaxPool",
                "Conv",
                "BatchNormalization",
                "Relu",
                "MaxPool",
                "Conv",
                "BatchNormalization",
                "Relu",
                "GlobalAveragePool",
                "Flatten",
                "Gemm",
            ]
        );
    }

    #[test]
    fn initializers_use_pytorch_names_and_layouts() {
        let device = Default::default();
        let model = ModelConfig::new().init::<TestBackend>(&device);

        let proto = to_onnx(&model, &device).unwrap();
        let initializer = |name: &str| {
            proto
                .graph
                .initializer
                .iter()
                .find(|tensor| tensor.name == name)
                .map(|tensor| tensor.dims.clone())
        };

        assert_eq!(initializer("conv1.weight"), Some(vec![32, 1, 3, 3]));
        assert_eq!(initializer("bn2.running_var"), Some(vec![64]));
        assert_eq!(initializer("fc.weight"), Some(vec![NUM_CLASSES as i64, 128]));
        assert_eq!(initializer("fc.bias"), Some(vec![NUM_CLASSES as i64]));
        assert_eq!(proto.graph.initializer.len(), 20);
    }

    #[test]
    fn exported_graph_matches_the_model() {
        let device = Default::default();
        let model = ModelConfig::new().init::<TestBackend>(&device);
        let bytes = to_onnx(&model, &device).unwrap().write_to_bytes().unwrap();
        let graph = OnnxGraph::from_bytes(&bytes).unwrap();

        let images =
            Tensor::<TestBackend, 4>::random([2, 1, HEIGHT, WIDTH], Distribution::Default, &device);
        let expected = model.forward(images.clone()).into_data();

        graph
            .run(images, &device)
            .unwrap()
            .into_data()
            .assert_approx_eq::<f32>(&expected, Tolerance::rel_abs(1e-3, 1e-4));
    }

    #[test]
    fn missing_artifacts_fail_the_export() {
        let device = Default::default();
        let dir = tempfile::tempdir().unwrap();

        let result = export_onnx::<TestBackend>(dir.path(), &dir.path().join(ONNX_FILE), &device);

        assert!(matches!(result, Err(ExportError::Config { .. })));
        assert!(!dir.path().join(ONNX_FILE).exists());
    }

    #[test]
    fn config_errors_display_their_cause() {
        let device = Default::default();
        let dir = tempfile::tempdir().unwrap();

        let error = export_onnx::<TestBackend>(dir.path(), &dir.path().join(ONNX_FILE), &device)
            .unwrap_err();
        let message = error.to_string();

        assert!(message.contains(CONFIG_FILE));
        assert!(!message.contains("FileNotFound"));
        assert!(std::error::Error::source(&error).is_some());
    }
}
