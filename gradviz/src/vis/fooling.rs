//! Fooling images: perturb an input until the model predicts a chosen class.

use log::debug;
use ndarray::{Array4, Axis};

use crate::service::Service;

use super::{argmax, one_hot_rows, VisError};

#[derive(Debug, Clone)]
pub struct FoolingConfig {
    /// Length of each ascent step, applied to the unit-normalized gradient.
    pub step_size: f32,
    /// Iteration cap; reaching it without flipping the prediction reports
    /// `converged: false`.
    pub max_iterations: usize,
}

impl Default for FoolingConfig {
    fn default() -> Self {
        Self {
            step_size: 1.0,
            max_iterations: 100,
        }
    }
}

#[derive(Debug)]
pub struct FoolingResult {
    /// The (possibly) perturbed image.
    pub image: Array4<f32>,
    /// Ascent steps actually taken.
    pub iterations: usize,
    /// Whether the model now predicts the target class.
    pub converged: bool,
    /// The model's prediction for the returned image.
    pub predicted_class: usize,
}

/// Performs targeted gradient ascent on the raw target-class score.
///
/// Each step adds `step_size * g / ||g||` to the image, where `g` is the
/// gradient of the target score with respect to the pixels. The loop stops as
/// soon as the argmax prediction equals the target; there is no backtracking.
/// Callers are expected to treat `converged: false` as a failure.
pub fn make_fooling_image(
    service: &Service,
    image: &Array4<f32>,
    target_class: usize,
    config: &FoolingConfig,
) -> Result<FoolingResult, VisError> {
    let batch = image.shape()[0];
    if batch != 1 {
        return Err(VisError::NotASingleImage(batch));
    }

    let mut x = image.clone();
    let mut iterations = 0;
    loop {
        let trace = service.forward_trace(&x)?;
        let scores = service.scores(&trace)?;
        let classes = scores.shape()[1];
        if target_class >= classes {
            return Err(VisError::ClassOutOfRange {
                class: target_class,
                classes,
            });
        }

        let predicted_class = argmax(scores.index_axis(Axis(0), 0));
        if predicted_class == target_class {
            return Ok(FoolingResult {
                image: x,
                iterations,
                converged: true,
                predicted_class,
            });
        }
        if iterations == config.max_iterations {
            return Ok(FoolingResult {
                image: x,
                iterations,
                converged: false,
                predicted_class,
            });
        }

        let seed = one_hot_rows(1, classes, &[target_class])?;
        let seed = service.score_seed(&trace, seed)?;
        let gradient = service.input_gradient(&trace, vec![seed])?;

        let norm = gradient.mapv(|g| g * g).sum().sqrt();
        if norm == 0.0 {
            // a dead gradient cannot make progress
            return Ok(FoolingResult {
                image: x,
                iterations,
                converged: false,
                predicted_class,
            });
        }
        x += &(&gradient * (config.step_size / norm));
        iterations += 1;
        debug!(
            "fooling iteration {}: predicted {}, target score {}",
            iterations,
            predicted_class,
            scores[[0, target_class]]
        );
    }
}
