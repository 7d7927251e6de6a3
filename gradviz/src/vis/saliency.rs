//! Saliency maps: how sensitive the true-class score is to every pixel.

use ndarray::{Array3, Array4, Axis};

use crate::service::Service;

use super::{one_hot_rows, VisError};

/// Computes one saliency map per image.
///
/// The gradient of the summed true-class scores is taken with respect to the
/// input batch; its absolute value is collapsed over the color channel with a
/// maximum. The result has shape `[batch, height, width]` and is everywhere
/// non-negative.
pub fn saliency_maps(
    service: &Service,
    images: &Array4<f32>,
    labels: &[usize],
) -> Result<Array3<f32>, VisError> {
    let batch = images.shape()[0];
    if labels.len() != batch {
        return Err(VisError::LabelCountMismatch {
            expected: batch,
            actual: labels.len(),
        });
    }

    let trace = service.forward_trace(images)?;
    let scores = service.scores(&trace)?;
    let classes = scores.shape()[1];

    let seed = one_hot_rows(batch, classes, labels)?;
    let seed = service.score_seed(&trace, seed)?;
    let gradient = service.input_gradient(&trace, vec![seed])?;

    let saliency = gradient
        .mapv(f32::abs)
        .map_axis(Axis(1), |channels| channels.fold(0.0_f32, |a, &b| a.max(b)));
    Ok(saliency)
}
