use burn::{
    data::dataloader::batcher::Batcher,
    prelude::*,
    tensor::activation::softmax,
};

use crate::{
    data::{SignBatcher, SignItem, NUM_CLASSES},
    model::Model,
};

/// Letter of a class index, `0 => 'A'`.
///
/// Indices past `Z` map to `'?'`.
pub fn letter(class: usize) -> char {
    if class < NUM_CLASSES {
        (b'A' + class as u8) as char
    } else {
        '?'
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Prediction {
    pub class: usize,
    pub letter: char,
    /// Softmax probability of the predicted class.
    pub confidence: f32,
}

/// Classifies a batch of images shaped `[batch_size, 1, 28, 28]`.
pub fn predict<B: Backend>(model: &Model<B>, images: Tensor<B, 4>) -> Vec<Prediction> {
    predictions_from_logits(model.forward(images))
}

/// Classifies a single dataset item.
pub fn infer<B: Backend>(model: &Model<B>, item: SignItem, device: &B::Device) -> Prediction {
    let label = item.label;
    let batch = Batcher::<B, _, _>::batch(&SignBatcher::default(), vec![item], device);

    let prediction = predictions_from_logits(model.forward(batch.images)).remove(0);
    log::info!(
        "Predicted {} ({:.1}%) Expected {}",
        prediction.letter,
        prediction.confidence * 100.0,
        letter(label as usize)
    );

    prediction
}

/// Decodes logits shaped `[batch_size, num_classes]`, one prediction per row.
pub fn predictions_from_logits<B: Backend>(logits: Tensor<B, 2>) -> Vec<Prediction> {
    let [_, num_classes] = logits.dims();
    let probabilities: Vec<f32> = softmax(logits, 1).into_data().iter::<f32>().collect();

    probabilities
        .chunks(num_classes)
        .map(|row| {
            let (class, confidence) = row
                .iter()
                .copied()
                .enumerate()
                .fold((0, f32::MIN), |best, (class, p)| {
                    if p > best.1 {
                        (class, p)
                    } else {
                        best
                    }
                });

            Prediction {
                class,
                letter: letter(class),
                confidence,
            }
        })
        .collect()
}
