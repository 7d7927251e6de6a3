//! Gradient-based introspection of a pretrained classifier.
//!
//! Four operations are provided, all built on the service layer's recorded
//! forward pass and seeded input gradients:
//!
//! - [`saliency::saliency_maps`]: per-pixel sensitivity of the true-class score
//! - [`fooling::make_fooling_image`]: targeted ascent until the prediction flips
//! - [`dream::class_visualization`]: synthesize an image maximizing a class score
//! - [`style::style_transfer`]: content/style/smoothness optimization

pub mod dream;
pub mod fooling;
pub mod regularize;
pub mod saliency;
pub mod style;

use ndarray::Array2;
use thiserror::Error;

use crate::operators::OperationError;
use crate::service::ServiceError;

#[derive(Error, Debug)]
pub enum VisError {
    #[error(transparent)]
    Service(#[from] ServiceError),
    #[error(transparent)]
    Operation(#[from] OperationError),
    #[error("Expected {expected} labels for a batch of {actual} images")]
    LabelCountMismatch { expected: usize, actual: usize },
    #[error("Class index {class} is out of range for {classes} classes")]
    ClassOutOfRange { class: usize, classes: usize },
    #[error("Expected a single image, found a batch of {0}")]
    NotASingleImage(usize),
    #[error("A feature map must be [1, C, H, W], found shape {0:?}")]
    BadFeatureShape(Vec<usize>),
    #[error("Every style layer needs a weight: {layers} layers, {weights} weights")]
    MismatchedStyleWeights { layers: usize, weights: usize },
}

/// One-hot score selection: a `[batch, classes]` gradient seed picking the
/// given class for every row.
pub(crate) fn one_hot_rows(
    batch: usize,
    classes: usize,
    picks: &[usize],
) -> Result<Array2<f32>, VisError> {
    let mut seed = Array2::<f32>::zeros((batch, classes));
    for (row, &class) in picks.iter().enumerate() {
        if class >= classes {
            return Err(VisError::ClassOutOfRange { class, classes });
        }
        seed[[row, class]] = 1.0;
    }
    Ok(seed)
}

/// Index of the highest score in a row.
pub(crate) fn argmax(row: ndarray::ArrayView1<f32>) -> usize {
    row.iter()
        .enumerate()
        .max_by(|a, b| a.1.partial_cmp(b.1).unwrap())
        .map(|(i, _)| i)
        .unwrap_or(0)
}
