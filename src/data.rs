use std::{fs::File, io::Read, path::Path};

use burn::{
    data::{
        dataloader::batcher::Batcher,
        dataset::{Dataset, InMemDataset},
    },
    prelude::*,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const WIDTH: usize = 28;
pub const HEIGHT: usize = 28;
/// Number of pixel columns in every CSV row.
pub const NUM_PIXELS: usize = WIDTH * HEIGHT;
/// One class per alphabet letter, indexed from `A`.
pub const NUM_CLASSES: usize = 26;

const LABEL_COLUMN: &str = "label";
const MAX_PIXEL: f32 = 255.0;

/// Sign Language MNIST item.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct SignItem {
    /// Image as a 2D array of floats in `[0, 1]`.
    pub image: [[f32; WIDTH]; HEIGHT],

    /// Label of the image, in `[0, NUM_CLASSES)`.
    pub label: u8,
}

/// Error type for [SignLanguageDataset](SignLanguageDataset).
#[derive(Error, Debug)]
pub enum DatasetError {
    /// The CSV file could not be opened.
    #[error("could not open `{path}`: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// The CSV reader failed.
    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    /// The header has no `label` column.
    #[error("missing `label` column")]
    MissingLabelColumn,

    /// The header does not describe a 28x28 image.
    #[error("expected {expected} pixel columns, found {found}")]
    PixelColumnCount { expected: usize, found: usize },

    /// A row does not have as many fields as the header.
    #[error("row {row}: expected {expected} fields, found {found}")]
    FieldCount {
        row: usize,
        expected: usize,
        found: usize,
    },

    /// A field is not a number.
    #[error("row {row}, column `{column}`: invalid value `{value}`")]
    InvalidValue {
        row: usize,
        column: String,
        value: String,
    },

    /// A pixel intensity is outside `[0, 255]`.
    #[error("row {row}, column `{column}`: pixel value {value} outside [0, 255]")]
    PixelOutOfRange {
        row: usize,
        column: String,
        value: f32,
    },

    /// A label does not map to a class.
    #[error("row {row}: label {label} outside [0, {max}]", max = NUM_CLASSES - 1)]
    LabelOutOfRange { row: usize, label: u64 },
}

/// Sign Language MNIST dataset.
///
/// The data is parsed from a CSV file with a `label` column and 784 pixel columns
/// (`pixel1` to `pixel784` in the published archive), one image per row.
/// All rows are materialized in memory when the dataset is created, and pixel
/// intensities are scaled from `[0, 255]` to `[0, 1]`.
pub struct SignLanguageDataset {
    dataset: InMemDataset<SignItem>,
}

impl Dataset<SignItem> for SignLanguageDataset {
    fn get(&self, index: usize) -> Option<SignItem> {
        self.dataset.get(index)
    }

    fn len(&self) -> usize {
        self.dataset.len()
    }
}

impl SignLanguageDataset {
    /// Loads the dataset from a CSV file.
    pub fn from_csv<P: AsRef<Path>>(path: P) -> Result<Self, DatasetError> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|source| DatasetError::Io {
            path: path.display().to_string(),
            source,
        })?;

        let dataset = Self::from_reader(file)?;
        log::info!("Loaded {} samples from {}", dataset.len(), path.display());

        Ok(dataset)
    }

    /// Loads the dataset from any CSV source.
    pub fn from_reader<R: Read>(reader: R) -> Result<Self, DatasetError> {
        let mut rdr = csv::ReaderBuilder::new()
            .has_headers(true)
            .flexible(true)
            .trim(csv::Trim::All)
            .from_reader(reader);

        let headers = rdr.headers()?.clone();
        let label_index = headers
            .iter()
            .position(|name| name == LABEL_COLUMN)
            .ok_or(DatasetError::MissingLabelColumn)?;

        let num_pixels = headers.len() - 1;
        if num_pixels != NUM_PIXELS {
            return Err(DatasetError::PixelColumnCount {
                expected: NUM_PIXELS,
                found: num_pixels,
            });
        }

        let mut items = Vec::new();
        for (index, record) in rdr.records().enumerate() {
            let record = record?;
            let row = index + 1;

            if record.len() != headers.len() {
                return Err(DatasetError::FieldCount {
                    row,
                    expected: headers.len(),
                    found: record.len(),
                });
            }

            let mut image = [[0f32; WIDTH]; HEIGHT];
            let mut label = 0;
            let mut pixel = 0;

            for (position, (column, value)) in headers.iter().zip(record.iter()).enumerate() {
                if position == label_index {
                    label = parse_label(row, column, value)?;
                    continue;
                }

                image[pixel / WIDTH][pixel % WIDTH] = parse_pixel(row, column, value)? / MAX_PIXEL;
                pixel += 1;
            }

            items.push(SignItem { image, label });
        }

        Ok(Self {
            dataset: InMemDataset::new(items),
        })
    }

    /// Number of samples for every class.
    pub fn class_histogram(&self) -> [usize; NUM_CLASSES] {
        let mut histogram = [0; NUM_CLASSES];
        for item in self.dataset.iter() {
            histogram[item.label as usize] += 1;
        }
        histogram
    }
}

fn parse_label(row: usize, column: &str, value: &str) -> Result<u8, DatasetError> {
    let label = value
        .parse::<u64>()
        .map_err(|_| invalid_value(row, column, value))?;

    if label >= NUM_CLASSES as u64 {
        return Err(DatasetError::LabelOutOfRange { row, label });
    }

    Ok(label as u8)
}

fn parse_pixel(row: usize, column: &str, value: &str) -> Result<f32, DatasetError> {
    let pixel = value
        .parse::<f32>()
        .map_err(|_| invalid_value(row, column, value))?;

    if !(0.0..=MAX_PIXEL).contains(&pixel) {
        return Err(DatasetError::PixelOutOfRange {
            row,
            column: column.to_string(),
            value: pixel,
        });
    }

    Ok(pixel)
}

fn invalid_value(row: usize, column: &str, value: &str) -> DatasetError {
    DatasetError::InvalidValue {
        row,
        column: column.to_string(),
        value: value.to_string(),
    }
}

#[derive(Clone, Debug, Default)]
pub struct SignBatcher {}

#[derive(Clone, Debug)]
pub struct SignBatch<B: Backend> {
    /// Images shaped `[batch_size, 1, HEIGHT, WIDTH]`.
    pub images: Tensor<B, 4>,
    /// Class indices shaped `[batch_size]`.
    pub targets: Tensor<B, 1, Int>,
}

impl<B: Backend> Batcher<B, SignItem, SignBatch<B>> for SignBatcher {
    fn batch(&self, items: Vec<SignItem>, device: &B::Device) -> SignBatch<B> {
        let images = items
            .iter()
            .map(|item| TensorData::from(item.image).convert::<B::FloatElem>())
            .map(|data| Tensor::<B, 2>::from_data(data, device))
            .map(|tensor| tensor.reshape([1, 1, HEIGHT, WIDTH]))
            .collect();

        let targets = items
            .iter()
            .map(|item| {
                Tensor::<B, 1, Int>::from_data([(item.label as i64).elem::<B::IntElem>()], device)
            })
            .collect();

        let images = Tensor::cat(images, 0);
        let targets = Tensor::cat(targets, 0);

        SignBatch { images, targets }
    }
}
