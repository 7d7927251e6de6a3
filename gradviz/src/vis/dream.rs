//! Class visualization: synthesize, from noise, an image the model considers
//! a textbook example of a chosen class.

use log::debug;
use ndarray::{Array4, Axis};
use rand::{rngs::StdRng, Rng, SeedableRng};

use crate::service::prepare::valid_pixel_range;
use crate::service::Service;

use super::regularize::{clip_to_valid_range, gaussian_blur, jitter};
use super::{argmax, one_hot_rows, VisError};

#[derive(Debug, Clone)]
pub struct ClassVisConfig {
    /// Ascent step applied to the regularized score gradient.
    pub learning_rate: f32,
    /// Weight of the L2 penalty on pixel magnitude.
    pub l2_reg: f32,
    pub num_iterations: usize,
    /// Blur the image every this many iterations (0 disables blurring).
    pub blur_every: usize,
    pub blur_sigma: f32,
    /// Maximum circular shift applied before each step, in pixels.
    pub max_jitter: i64,
    /// Spatial size of the synthesized image.
    pub image_size: usize,
    /// Keep a copy of the image every this many iterations.
    pub snapshot_every: Option<usize>,
    /// Fixed RNG seed for reproducible runs.
    pub seed: Option<u64>,
}

impl Default for ClassVisConfig {
    fn default() -> Self {
        Self {
            learning_rate: 25.0,
            l2_reg: 1e-3,
            num_iterations: 200,
            blur_every: 10,
            blur_sigma: 0.5,
            max_jitter: 16,
            image_size: 224,
            snapshot_every: None,
            seed: None,
        }
    }
}

#[derive(Debug)]
pub struct Snapshot {
    pub iteration: usize,
    pub image: Array4<f32>,
}

#[derive(Debug)]
pub struct ClassVisResult {
    pub image: Array4<f32>,
    pub snapshots: Vec<Snapshot>,
    /// Raw score of the target class for the final image.
    pub final_score: f32,
}

/// Gradient ascent on `score(target) - l2_reg * ||x||^2`, starting from
/// random noise.
///
/// Each iteration applies a random circular shift for implicit translation
/// invariance, ascends the regularized score, undoes the shift, clips the
/// pixels to the displayable range and periodically blurs the image.
pub fn class_visualization(
    service: &Service,
    target_class: usize,
    config: &ClassVisConfig,
) -> Result<ClassVisResult, VisError> {
    let mut rng = match config.seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };

    let channels = service.network().declared_input_channels().unwrap_or(3);
    let mut x = noise_image(channels, config.image_size, config.image_size, &mut rng);
    let mut snapshots = Vec::new();
    let mut final_score = f32::MIN;

    for iteration in 1..=config.num_iterations {
        let (shift_y, shift_x) = if config.max_jitter > 0 {
            (
                rng.gen_range(-config.max_jitter..=config.max_jitter),
                rng.gen_range(-config.max_jitter..=config.max_jitter),
            )
        } else {
            (0, 0)
        };
        x = jitter(&x, shift_y, shift_x);

        let trace = service.forward_trace(&x)?;
        let scores = service.scores(&trace)?;
        let classes = scores.shape()[1];
        if target_class >= classes {
            return Err(VisError::ClassOutOfRange {
                class: target_class,
                classes,
            });
        }
        final_score = scores[[0, target_class]];

        let seed = one_hot_rows(1, classes, &[target_class])?;
        let seed = service.score_seed(&trace, seed)?;
        let score_grad = service.input_gradient(&trace, vec![seed])?;

        // ascend score - l2_reg * ||x||^2
        let gradient = score_grad - &x * (2.0 * config.l2_reg);
        x += &(&gradient * config.learning_rate);

        x = jitter(&x, -shift_y, -shift_x);
        clip_to_valid_range(&mut x);
        if config.blur_every > 0 && iteration % config.blur_every == 0 {
            x = gaussian_blur(&x, config.blur_sigma)?;
        }

        if config
            .snapshot_every
            .map_or(false, |every| iteration % every == 0)
        {
            snapshots.push(Snapshot {
                iteration,
                image: x.clone(),
            });
        }
        debug!(
            "class visualization iteration {}: target score {}, predicted {}",
            iteration,
            final_score,
            argmax(scores.index_axis(Axis(0), 0))
        );
    }

    Ok(ClassVisResult {
        image: x,
        snapshots,
        final_score,
    })
}

/// Uniform noise over the displayable normalized range of each channel.
pub(crate) fn noise_image(
    channels: usize,
    height: usize,
    width: usize,
    rng: &mut StdRng,
) -> Array4<f32> {
    let mut x = Array4::<f32>::zeros((1, channels, height, width));
    for (channel, mut lane) in x.axis_iter_mut(Axis(1)).enumerate() {
        let (lo, hi) = valid_pixel_range(channel.min(2));
        for v in lane.iter_mut() {
            *v = rng.gen_range(lo..hi);
        }
    }
    x
}
