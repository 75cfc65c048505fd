use std::{collections::HashMap, path::Path};

use burn::{
    prelude::*,
    tensor::{
        activation::relu,
        module::{conv2d, max_pool2d},
        ops::ConvOptions,
    },
};
use protobuf::Message;
use thiserror::Error;

use super::{
    tensor_shape_proto::dimension::Value as DimValue, AttributeProto, ModelProto, NodeProto,
    TensorProto, ValueInfoProto, ELEM_TYPE_FLOAT, INPUT_NAME, OUTPUT_NAME,
};

#[derive(Error, Debug)]
pub enum OnnxError {
    #[error("could not read `{path}`: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("could not decode ONNX model: {0}")]
    Decode(#[from] protobuf::Error),

    #[error("model has no graph")]
    MissingGraph,

    #[error("invalid graph signature: {0}")]
    Signature(String),

    #[error("node `{node}`: unsupported operator `{op_type}`")]
    UnsupportedOp { node: String, op_type: String },

    #[error("node `{node}`: unsupported attribute value for `{attribute}`")]
    UnsupportedAttribute { node: String, attribute: String },

    #[error("value `{0}` is not defined")]
    MissingValue(String),

    #[error("value `{name}` has rank {found}, expected {expected}")]
    Rank {
        name: String,
        expected: usize,
        found: usize,
    },

    #[error("initializer `{name}`: unsupported data type {data_type}")]
    DataType { name: String, data_type: i32 },

    #[error("initializer `{name}`: {found} values for {expected} elements")]
    ElementCount {
        name: String,
        expected: usize,
        found: usize,
    },
}

/// Dimension of a graph input or output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Dimension {
    Fixed(usize),
    Symbolic(String),
}

/// Decoded ONNX model whose operator graph can be evaluated with burn tensors.
///
/// Supports the operators emitted by the exporter: `Conv`, `BatchNormalization`,
/// `Relu`, `MaxPool`, `GlobalAveragePool`, `Flatten` and `Gemm`.
#[derive(Debug, Clone)]
pub struct OnnxGraph {
    model: ModelProto,
    input_shape: Vec<Dimension>,
    output_shape: Vec<Dimension>,
}

enum Value<B: Backend> {
    Rank1(Tensor<B, 1>),
    Rank2(Tensor<B, 2>),
    Rank4(Tensor<B, 4>),
}

impl<B: Backend> Value<B> {
    fn rank(&self) -> usize {
        match self {
            Value::Rank1(_) => 1,
            Value::Rank2(_) => 2,
            Value::Rank4(_) => 4,
        }
    }
}

impl OnnxGraph {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, OnnxError> {
        let path = path.as_ref();
        let bytes = std::fs::read(path).map_err(|source| OnnxError::Io {
            path: path.display().to_string(),
            source,
        })?;

        Self::from_bytes(&bytes)
    }

    /// Decodes a model and checks its `input` and `output` signature.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, OnnxError> {
        let model = ModelProto::parse_from_bytes(bytes)?;
        let graph = model.graph.as_ref().ok_or(OnnxError::MissingGraph)?;

        let input_shape = signature(&graph.input, INPUT_NAME, 4)?;
        let output_shape = signature(&graph.output, OUTPUT_NAME, 2)?;

        Ok(Self {
            model,
            input_shape,
            output_shape,
        })
    }

    pub fn input_shape(&self) -> &[Dimension] {
        &self.input_shape
    }

    pub fn output_shape(&self) -> &[Dimension] {
        &self.output_shape
    }

    /// Operator types in execution order.
    pub fn op_types(&self) -> Vec<&str> {
        self.model
            .graph
            .node
            .iter()
            .map(|node| node.op_type.as_str())
            .collect()
    }

    pub fn opset_version(&self) -> Option<i64> {
        self.model
            .opset_import
            .iter()
            .find(|opset| opset.domain.is_empty())
            .map(|opset| opset.version)
    }

    /// Evaluates the graph on images shaped `[batch_size, 1, 28, 28]`.
    pub fn run<B: Backend>(
        &self,
        input: Tensor<B, 4>,
        device: &B::Device,
    ) -> Result<Tensor<B, 2>, OnnxError> {
        let graph = &self.model.graph;
        let mut values: HashMap<String, Value<B>> = HashMap::new();

        for initializer in graph.initializer.iter() {
            values.insert(initializer.name.clone(), initializer_value(initializer, device)?);
        }
        values.insert(INPUT_NAME.to_string(), Value::Rank4(input));

        for node in graph.node.iter() {
            let output = run_node(node, &values)?;
            let name = node
                .output
                .first()
                .ok_or_else(|| OnnxError::MissingValue(format!("{}:output", node.name)))?;
            values.insert(name.clone(), output);
        }

        match values.remove(OUTPUT_NAME) {
            Some(Value::Rank2(output)) => Ok(output),
            Some(other) => Err(OnnxError::Rank {
                name: OUTPUT_NAME.to_string(),
                expected: 2,
                found: other.rank(),
            }),
            None => Err(OnnxError::MissingValue(OUTPUT_NAME.to_string())),
        }
    }
}

fn signature(
    values: &[ValueInfoProto],
    name: &str,
    rank: usize,
) -> Result<Vec<Dimension>, OnnxError> {
    let value = match values {
        [value] if value.name == name => value,
        _ => {
            return Err(OnnxError::Signature(format!(
                "expected a single value named `{name}`"
            )))
        }
    };

    let tensor_type = value.type_.tensor_type();
    if tensor_type.elem_type != ELEM_TYPE_FLOAT {
        return Err(OnnxError::Signature(format!(
            "`{name}` has element type {}, expected float",
            tensor_type.elem_type
        )));
    }

    let shape: Vec<Dimension> = tensor_type
        .shape
        .dim
        .iter()
        .map(|dim| match &dim.value {
            Some(DimValue::DimValue(size)) => Dimension::Fixed(*size as usize),
            Some(DimValue::DimParam(param)) => Dimension::Symbolic(param.clone()),
            None => Dimension::Symbolic(String::new()),
        })
        .collect();

    if shape.len() != rank {
        return Err(OnnxError::Signature(format!(
            "`{name}` has rank {}, expected {rank}",
            shape.len()
        )));
    }

    if let Some(Dimension::Fixed(size)) = shape.first() {
        return Err(OnnxError::Signature(format!(
            "`{name}` has a fixed batch dimension of {size}"
        )));
    }

    Ok(shape)
}

fn initializer_value<B: Backend>(
    tensor: &TensorProto,
    device: &B::Device,
) -> Result<Value<B>, OnnxError> {
    if tensor.data_type != ELEM_TYPE_FLOAT {
        return Err(OnnxError::DataType {
            name: tensor.name.clone(),
            data_type: tensor.data_type,
        });
    }

    let values: Vec<f32> = if tensor.raw_data.is_empty() {
        tensor.float_data.clone()
    } else {
        tensor
            .raw_data
            .chunks_exact(4)
            .map(|bytes| f32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
            .collect()
    };
    let dims: Vec<usize> = tensor.dims.iter().map(|dim| *dim as usize).collect();

    let expected: usize = dims.iter().product();
    if values.len() != expected {
        return Err(OnnxError::ElementCount {
            name: tensor.name.clone(),
            expected,
            found: values.len(),
        });
    }

    let value = match dims.len() {
        1 => Value::Rank1(Tensor::from_data(TensorData::new(values, [dims[0]]), device)),
        2 => Value::Rank2(Tensor::from_data(
            TensorData::new(values, [dims[0], dims[1]]),
            device,
        )),
        4 => Value::Rank4(Tensor::from_data(
            TensorData::new(values, [dims[0], dims[1], dims[2], dims[3]]),
            device,
        )),
        found => {
            return Err(OnnxError::Rank {
                name: tensor.name.clone(),
                expected: 4,
                found,
            })
        }
    };

    Ok(value)
}

fn run_node<B: Backend>(
    node: &NodeProto,
    values: &HashMap<String, Value<B>>,
) -> Result<Value<B>, OnnxError> {
    let output = match node.op_type.as_str() {
        "Conv" => {
            let x = rank4(values, input_name(node, 0)?)?;
            let weight = rank4(values, input_name(node, 1)?)?;
            let bias = match node.input.get(2) {
                Some(name) => Some(rank1(values, name)?),
                None => None,
            };

            let options = ConvOptions::new(
                pair(node, "strides", [1, 1])?,
                symmetric_pads(node)?,
                pair(node, "dilations", [1, 1])?,
                int(node, "group", 1) as usize,
            );

            Value::Rank4(conv2d(x, weight, bias, options))
        }
        "BatchNormalization" => {
            let x = rank4(values, input_name(node, 0)?)?;
            let channels = x.dims()[1];
            let per_channel = |index: usize| -> Result<Tensor<B, 4>, OnnxError> {
                Ok(rank1(values, input_name(node, index)?)?.reshape([1, channels, 1, 1]))
            };

            let scale = per_channel(1)?;
            let bias = per_channel(2)?;
            let mean = per_channel(3)?;
            let var = per_channel(4)?;
            let epsilon = float(node, "epsilon", 1e-5);

            Value::Rank4((x - mean) / var.add_scalar(epsilon).sqrt() * scale + bias)
        }
        "Relu" => match value(values, input_name(node, 0)?)? {
            Value::Rank2(x) => Value::Rank2(relu(x.clone())),
            Value::Rank4(x) => Value::Rank4(relu(x.clone())),
            Value::Rank1(x) => Value::Rank1(relu(x.clone())),
        },
        "MaxPool" => {
            let x = rank4(values, input_name(node, 0)?)?;
            let kernel = pair(node, "kernel_shape", [1, 1])?;
            let strides = pair(node, "strides", [1, 1])?;

            Value::Rank4(max_pool2d(
                x,
                kernel,
                strides,
                symmetric_pads(node)?,
                pair(node, "dilations", [1, 1])?,
            ))
        }
        "GlobalAveragePool" => {
            let x = rank4(values, input_name(node, 0)?)?;
            Value::Rank4(x.mean_dim(3).mean_dim(2))
        }
        "Flatten" => {
            if int(node, "axis", 1) != 1 {
                return Err(unsupported_attribute(node, "axis"));
            }
            let x = rank4(values, input_name(node, 0)?)?;
            Value::Rank2(x.flatten::<2>(1, 3))
        }
        "Gemm" => {
            if int(node, "transA", 0) != 0 {
                return Err(unsupported_attribute(node, "transA"));
            }
            let a = rank2(values, input_name(node, 0)?)?;
            let mut b = rank2(values, input_name(node, 1)?)?;
            if int(node, "transB", 0) != 0 {
                b = b.transpose();
            }

            let mut y = a.matmul(b).mul_scalar(float(node, "alpha", 1.0));
            if let Some(name) = node.input.get(2) {
                let c = rank1(values, name)?.unsqueeze::<2>();
                y = y + c.mul_scalar(float(node, "beta", 1.0));
            }

            Value::Rank2(y)
        }
        op_type => {
            return Err(OnnxError::UnsupportedOp {
                node: node.name.clone(),
                op_type: op_type.to_string(),
            })
        }
    };

    Ok(output)
}

fn input_name(node: &NodeProto, index: usize) -> Result<&str, OnnxError> {
    node.input
        .get(index)
        .map(String::as_str)
        .ok_or_else(|| OnnxError::MissingValue(format!("{}:input{index}", node.name)))
}

fn value<'a, B: Backend>(
    values: &'a HashMap<String, Value<B>>,
    name: &str,
) -> Result<&'a Value<B>, OnnxError> {
    values
        .get(name)
        .ok_or_else(|| OnnxError::MissingValue(name.to_string()))
}

fn rank_error<B: Backend>(name: &str, expected: usize, found: &Value<B>) -> OnnxError {
    OnnxError::Rank {
        name: name.to_string(),
        expected,
        found: found.rank(),
    }
}

fn rank1<B: Backend>(
    values: &HashMap<String, Value<B>>,
    name: &str,
) -> Result<Tensor<B, 1>, OnnxError> {
    match value(values, name)? {
        Value::Rank1(tensor) => Ok(tensor.clone()),
        other => Err(rank_error(name, 1, other)),
    }
}

fn rank2<B: Backend>(
    values: &HashMap<String, Value<B>>,
    name: &str,
) -> Result<Tensor<B, 2>, OnnxError> {
    match value(values, name)? {
        Value::Rank2(tensor) => Ok(tensor.clone()),
        other => Err(rank_error(name, 2, other)),
    }
}

fn rank4<B: Backend>(
    values: &HashMap<String, Value<B>>,
    name: &str,
) -> Result<Tensor<B, 4>, OnnxError> {
    match value(values, name)? {
        Value::Rank4(tensor) => Ok(tensor.clone()),
        other => Err(rank_error(name, 4, other)),
    }
}

fn attribute<'a>(node: &'a NodeProto, name: &str) -> Option<&'a AttributeProto> {
    node.attribute.iter().find(|attribute| attribute.name == name)
}

fn int(node: &NodeProto, name: &str, default: i64) -> i64 {
    attribute(node, name).map_or(default, |attribute| attribute.i)
}

fn float(node: &NodeProto, name: &str, default: f32) -> f32 {
    attribute(node, name).map_or(default, |attribute| attribute.f)
}

fn pair(node: &NodeProto, name: &str, default: [usize; 2]) -> Result<[usize; 2], OnnxError> {
    match attribute(node, name).map(|attribute| attribute.ints.as_slice()) {
        None => Ok(default),
        Some([a, b]) if *a >= 0 && *b >= 0 => Ok([*a as usize, *b as usize]),
        Some(_) => Err(unsupported_attribute(node, name)),
    }
}

/// Converts ONNX `[top, left, bottom, right]` pads to burn's symmetric padding.
fn symmetric_pads(node: &NodeProto) -> Result<[usize; 2], OnnxError> {
    match attribute(node, "pads").map(|attribute| attribute.ints.as_slice()) {
        None => Ok([0, 0]),
        Some([top, left, bottom, right])
            if top == bottom && left == right && *top >= 0 && *left >= 0 =>
        {
            Ok([*top as usize, *left as usize])
        }
        Some(_) => Err(unsupported_attribute(node, "pads")),
    }
}

fn unsupported_attribute(node: &NodeProto, attribute: &str) -> OnnxError {
    OnnxError::UnsupportedAttribute {
        node: node.name.clone(),
        attribute: attribute.to_string(),
    }
}
