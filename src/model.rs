use burn::{
    nn::{
        conv::{Conv2d, Conv2dConfig},
        loss::CrossEntropyLossConfig,
        pool::{AdaptiveAvgPool2d, AdaptiveAvgPool2dConfig, MaxPool2d, MaxPool2dConfig},
        BatchNorm, BatchNormConfig, Dropout, DropoutConfig, Linear, LinearConfig, PaddingConfig2d,
        Relu,
    },
    prelude::*,
    tensor::backend::AutodiffBackend,
    train::{ClassificationOutput, TrainOutput, TrainStep, ValidStep},
};

use crate::data::{SignBatch, HEIGHT, WIDTH};

/// Square kernel of every convolution.
pub const KERNEL_SIZE: usize = 3;
/// Zero padding of every convolution, keeping the spatial size.
pub const PADDING: usize = 1;
/// Square window and stride of the max pooling after the first two blocks.
pub const POOL_SIZE: usize = 2;

/// Convolutional classifier for 1x28x28 hand-sign images.
///
/// Three `conv -> batch norm -> relu` blocks, the first two followed by a 2x2 max
/// pooling, then global average pooling, dropout and a linear head.
#[derive(Module, Debug)]
pub struct Model<B: Backend> {
    pub conv1: Conv2d<B>,
    pub bn1: BatchNorm<B, 2>,
    pub conv2: Conv2d<B>,
    pub bn2: BatchNorm<B, 2>,
    pub conv3: Conv2d<B>,
    pub bn3: BatchNorm<B, 2>,
    pub fc: Linear<B>,
    pool: MaxPool2d,
    global_pool: AdaptiveAvgPool2d,
    dropout: Dropout,
    activation: Relu,
}

#[derive(Config, Debug)]
pub struct ModelConfig {
    #[config(default = 26)]
    pub num_classes: usize,
    #[config(default = "[32, 64, 128]")]
    pub channels: [usize; 3],
    #[config(default = 0.3)]
    pub dropout: f64,
}

impl ModelConfig {
    /// Returns the initialized model.
    pub fn init<B: Backend>(&self, device: &B::Device) -> Model<B> {
        let [c1, c2, c3] = self.channels;

        Model {
            conv1: conv3x3(1, c1, device),
            bn1: BatchNormConfig::new(c1).init(device),
            conv2: conv3x3(c1, c2, device),
            bn2: BatchNormConfig::new(c2).init(device),
            conv3: conv3x3(c2, c3, device),
            bn3: BatchNormConfig::new(c3).init(device),
            fc: LinearConfig::new(c3, self.num_classes).init(device),
            pool: MaxPool2dConfig::new([POOL_SIZE, POOL_SIZE])
                .with_strides([POOL_SIZE, POOL_SIZE])
                .init(),
            global_pool: AdaptiveAvgPool2dConfig::new([1, 1]).init(),
            dropout: DropoutConfig::new(self.dropout).init(),
            activation: Relu::new(),
        }
    }
}

fn conv3x3<B: Backend>(channels_in: usize, channels_out: usize, device: &B::Device) -> Conv2d<B> {
    Conv2dConfig::new([channels_in, channels_out], [KERNEL_SIZE, KERNEL_SIZE])
        .with_padding(PaddingConfig2d::Explicit(PADDING, PADDING))
        .init(device)
}

impl<B: Backend> Model<B> {
    /// # Shapes
    ///   - Images [batch_size, 1, height, width]
    ///   - Output [batch_size, num_classes]
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let [batch_size, channels, height, width] = images.dims();
        debug_assert_eq!([channels, height, width], [1, HEIGHT, WIDTH]);

        let x = self.conv1.forward(images);
        let x = self.activation.forward(self.bn1.forward(x));
        let x = self.pool.forward(x); // [B, 32, 14, 14]

        let x = self.conv2.forward(x);
        let x = self.activation.forward(self.bn2.forward(x));
        let x = self.pool.forward(x); // [B, 64, 7, 7]

        let x = self.conv3.forward(x);
        let x = self.activation.forward(self.bn3.forward(x));
        let x = self.global_pool.forward(x); // [B, 128, 1, 1]

        let x = x.flatten::<2>(1, 3);
        debug_assert_eq!(x.dims()[0], batch_size);
        let x = self.dropout.forward(x);

        self.fc.forward(x)
    }

    pub fn forward_classification(
        &self,
        images: Tensor<B, 4>,
        targets: Tensor<B, 1, Int>,
    ) -> ClassificationOutput<B> {
        let output = self.forward(images);
        let loss = CrossEntropyLossConfig::new()
            .init(&output.device())
            .forward(output.clone(), targets.clone());

        ClassificationOutput::new(loss, output, targets)
    }

    /// Name and shape of every tensor the model persists, in layer order.
    pub fn parameter_shapes(&self) -> Vec<(String, Vec<usize>)> {
        self.clone().into_record().parameter_shapes()
    }
}

impl<B: Backend> ModelRecord<B> {
    /// Name and shape of every recorded tensor, in layer order.
    ///
    /// Linear weights keep burn's `[d_input, d_output]` layout.
    pub fn parameter_shapes(&self) -> Vec<(String, Vec<usize>)> {
        let mut shapes = Vec::new();

        for (name, conv) in [("conv1", &self.conv1), ("conv2", &self.conv2), ("conv3", &self.conv3)]
        {
            shapes.push((format!("{name}.weight"), conv.weight.val().dims().to_vec()));
            if let Some(bias) = &conv.bias {
                shapes.push((format!("{name}.bias"), bias.val().dims().to_vec()));
            }
        }

        for (name, norm) in [("bn1", &self.bn1), ("bn2", &self.bn2), ("bn3", &self.bn3)] {
            shapes.push((format!("{name}.gamma"), norm.gamma.val().dims().to_vec()));
            shapes.push((format!("{name}.beta"), norm.beta.val().dims().to_vec()));
            let running_mean = norm.running_mean.val().dims().to_vec();
            let running_var = norm.running_var.val().dims().to_vec();
            shapes.push((format!("{name}.running_mean"), running_mean));
            shapes.push((format!("{name}.running_var"), running_var));
        }

        shapes.push(("fc.weight".to_string(), self.fc.weight.val().dims().to_vec()));
        if let Some(bias) = &self.fc.bias {
            shapes.push(("fc.bias".to_string(), bias.val().dims().to_vec()));
        }

        shapes
    }
}

impl<B: AutodiffBackend> TrainStep<SignBatch<B>, ClassificationOutput<B>> for Model<B> {
    fn step(&self, batch: SignBatch<B>) -> TrainOutput<ClassificationOutput<B>> {
        let item = self.forward_classification(batch.images, batch.targets);

        TrainOutput::new(self, item.loss.backward(), item)
    }
}

impl<B: Backend> ValidStep<SignBatch<B>, ClassificationOutput<B>> for Model<B> {
    fn step(&self, batch: SignBatch<B>) -> ClassificationOutput<B> {
        self.forward_classification(batch.images, batch.targets)
    }
}
