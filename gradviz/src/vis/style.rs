//! Neural style transfer: match one image's content and another's style.
//!
//! Three losses drive the synthesis. Each has a closed-form gradient with
//! respect to its feature map (or the pixels, for total variation); feature
//! gradients are seeded into one combined backward pass through the model.

use log::{debug, info};
use ndarray::{s, Array2, Array4, ArrayD, Axis, Ix4};
use petgraph::graph::NodeIndex;
use rand::{rngs::StdRng, SeedableRng};

use crate::optimize::{Adam, Optimizer};
use crate::service::{Service, Trace};

use super::dream::{noise_image, Snapshot};
use super::regularize::clip_to_valid_range;
use super::VisError;

/// Scaled squared distance between a candidate feature map and the content
/// target: `weight * sum((F - F_content)^2)`.
pub fn content_loss(weight: f32, current: &ArrayD<f32>, target: &ArrayD<f32>) -> f32 {
    weight * (current - target).mapv(|d| d * d).sum()
}

/// Gradient of [`content_loss`] with respect to the candidate feature map.
pub fn content_grad(weight: f32, current: &ArrayD<f32>, target: &ArrayD<f32>) -> ArrayD<f32> {
    (current - target) * (2.0 * weight)
}

/// Gram matrix of a `[1, C, H, W]` feature map: the pairwise dot products of
/// its channels, flattened over spatial positions. Optionally normalized by
/// the element count of the feature map.
pub fn gram_matrix(features: &ArrayD<f32>, normalize: bool) -> Result<Array2<f32>, VisError> {
    let features = features
        .view()
        .into_dimensionality::<Ix4>()
        .map_err(|_| VisError::BadFeatureShape(features.shape().to_vec()))?;
    let (batch, channels, height, width) = features.dim();
    if batch != 1 {
        return Err(VisError::BadFeatureShape(features.shape().to_vec()));
    }

    let flat = features
        .index_axis(Axis(0), 0)
        .to_owned()
        .into_shape((channels, height * width))
        .expect("contiguous feature map");
    let mut gram = flat.dot(&flat.t());
    if normalize {
        gram /= (channels * height * width) as f32;
    }
    Ok(gram)
}

/// Contribution of one layer to the style loss:
/// `weight * sum((G - A)^2)` with `G` the candidate Gram matrix and `A` the
/// precomputed style target.
pub fn style_layer_loss(
    weight: f32,
    features: &ArrayD<f32>,
    target_gram: &Array2<f32>,
    normalize: bool,
) -> Result<f32, VisError> {
    let gram = gram_matrix(features, normalize)?;
    Ok(weight * (&gram - target_gram).mapv(|d| d * d).sum())
}

/// Gradient of [`style_layer_loss`] with respect to the layer's feature map.
pub fn style_layer_grad(
    weight: f32,
    features: &ArrayD<f32>,
    target_gram: &Array2<f32>,
    normalize: bool,
) -> Result<ArrayD<f32>, VisError> {
    let dims = features
        .view()
        .into_dimensionality::<Ix4>()
        .map_err(|_| VisError::BadFeatureShape(features.shape().to_vec()))?
        .dim();
    let (_, channels, height, width) = dims;

    let gram = gram_matrix(features, normalize)?;
    let flat = features
        .view()
        .into_dimensionality::<Ix4>()
        .unwrap()
        .index_axis(Axis(0), 0)
        .to_owned()
        .into_shape((channels, height * width))
        .expect("contiguous feature map");

    // dL/dF = 4w/E (G - A) . F, with E the normalization factor
    let mut scale = 4.0 * weight;
    if normalize {
        scale /= (channels * height * width) as f32;
    }
    let dflat = (&gram - target_gram).dot(&flat) * scale;
    Ok(dflat
        .into_shape((1, channels, height, width))
        .expect("gradient matches the feature map")
        .into_dyn())
}

/// Total-variation loss: `weight * sum` of squared differences between
/// vertically and horizontally adjacent pixels, over all channels.
pub fn tv_loss(image: &Array4<f32>, weight: f32) -> f32 {
    let down = &image.slice(s![.., .., 1.., ..]) - &image.slice(s![.., .., ..-1, ..]);
    let right = &image.slice(s![.., .., .., 1..]) - &image.slice(s![.., .., .., ..-1]);
    weight * (down.mapv(|d| d * d).sum() + right.mapv(|d| d * d).sum())
}

/// Gradient of [`tv_loss`] with respect to the image.
pub fn tv_grad(image: &Array4<f32>, weight: f32) -> Array4<f32> {
    let mut grad = Array4::<f32>::zeros(image.raw_dim());

    let down = &image.slice(s![.., .., 1.., ..]) - &image.slice(s![.., .., ..-1, ..]);
    let scaled = &down * (2.0 * weight);
    grad.slice_mut(s![.., .., 1.., ..]).zip_mut_with(&scaled, |g, &d| *g += d);
    grad.slice_mut(s![.., .., ..-1, ..]).zip_mut_with(&scaled, |g, &d| *g -= d);

    let right = &image.slice(s![.., .., .., 1..]) - &image.slice(s![.., .., .., ..-1]);
    let scaled = &right * (2.0 * weight);
    grad.slice_mut(s![.., .., .., 1..]).zip_mut_with(&scaled, |g, &d| *g += d);
    grad.slice_mut(s![.., .., .., ..-1]).zip_mut_with(&scaled, |g, &d| *g -= d);

    grad
}

#[derive(Debug, Clone)]
pub struct StyleConfig {
    /// Layer whose activation must match the content image.
    pub content_layer: String,
    pub content_weight: f32,
    /// Layers whose Gram matrices must match the style image.
    pub style_layers: Vec<String>,
    pub style_weights: Vec<f32>,
    pub tv_weight: f32,
    pub iterations: usize,
    /// Learning rate for the initial phase.
    pub initial_lr: f32,
    /// Learning rate after `decay_at` iterations.
    pub decayed_lr: f32,
    pub decay_at: usize,
    /// Start from noise instead of the content image.
    pub init_random: bool,
    pub normalize_gram: bool,
    pub snapshot_every: Option<usize>,
    pub seed: Option<u64>,
}

impl Default for StyleConfig {
    fn default() -> Self {
        Self {
            content_layer: String::new(),
            content_weight: 5e-2,
            style_layers: Vec::new(),
            style_weights: Vec::new(),
            tv_weight: 5e-2,
            iterations: 200,
            initial_lr: 3.0,
            decayed_lr: 0.1,
            decay_at: 180,
            init_random: false,
            normalize_gram: true,
            snapshot_every: None,
            seed: None,
        }
    }
}

#[derive(Debug)]
pub struct StyleResult {
    pub image: Array4<f32>,
    pub snapshots: Vec<Snapshot>,
    pub final_loss: f32,
}

struct StyleTargets {
    content_node: NodeIndex,
    content_features: ArrayD<f32>,
    style_nodes: Vec<NodeIndex>,
    style_grams: Vec<Array2<f32>>,
}

/// Optimizes an image to combine the content of one input with the style of
/// another, with total variation as a smoothness prior.
///
/// Adam drives the update, with a higher learning rate for an initial phase
/// and a decayed rate afterwards; pixels are clipped to the displayable range
/// after every step.
pub fn style_transfer(
    service: &Service,
    content_image: &Array4<f32>,
    style_image: &Array4<f32>,
    config: &StyleConfig,
) -> Result<StyleResult, VisError> {
    if config.style_layers.len() != config.style_weights.len() {
        return Err(VisError::MismatchedStyleWeights {
            layers: config.style_layers.len(),
            weights: config.style_weights.len(),
        });
    }
    let targets = extract_targets(service, content_image, style_image, config)?;

    let mut x = if config.init_random {
        let mut rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let shape = content_image.dim();
        noise_image(shape.1, shape.2, shape.3, &mut rng)
    } else {
        content_image.clone()
    };

    let mut optimizer: Optimizer<Ix4, _> = Optimizer::new(config.initial_lr, Adam::default());
    let mut snapshots = Vec::new();
    let mut final_loss = f32::INFINITY;

    for iteration in 1..=config.iterations {
        if iteration == config.decay_at {
            optimizer.learning_rate = config.decayed_lr;
        }

        let trace = service.forward_trace(&x)?;
        let (loss, gradient) = combined_loss_and_grad(service, &trace, &x, config, &targets)?;
        final_loss = loss;

        optimizer.minimize(&mut x, &gradient);
        clip_to_valid_range(&mut x);

        if config
            .snapshot_every
            .map_or(false, |every| iteration % every == 0)
        {
            snapshots.push(Snapshot {
                iteration,
                image: x.clone(),
            });
        }
        debug!("style transfer iteration {}: loss {}", iteration, loss);
    }
    info!(
        "style transfer finished after {} iterations, loss {}",
        config.iterations, final_loss
    );

    Ok(StyleResult {
        image: x,
        snapshots,
        final_loss,
    })
}

fn extract_targets(
    service: &Service,
    content_image: &Array4<f32>,
    style_image: &Array4<f32>,
    config: &StyleConfig,
) -> Result<StyleTargets, VisError> {
    let content_node = service.feature_node(&config.content_layer)?;
    let style_nodes = config
        .style_layers
        .iter()
        .map(|name| service.feature_node(name))
        .collect::<Result<Vec<_>, _>>()?;

    let content_trace = service.forward_trace(content_image)?;
    let content_features = content_trace.activation(content_node).clone();

    let style_trace = service.forward_trace(style_image)?;
    let style_grams = style_nodes
        .iter()
        .map(|&node| gram_matrix(style_trace.activation(node), config.normalize_gram))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(StyleTargets {
        content_node,
        content_features,
        style_nodes,
        style_grams,
    })
}

fn combined_loss_and_grad(
    service: &Service,
    trace: &Trace,
    image: &Array4<f32>,
    config: &StyleConfig,
    targets: &StyleTargets,
) -> Result<(f32, Array4<f32>), VisError> {
    let mut seeds = Vec::with_capacity(1 + targets.style_nodes.len());

    let content_features = trace.activation(targets.content_node);
    let loss_content = content_loss(
        config.content_weight,
        content_features,
        &targets.content_features,
    );
    seeds.push((
        targets.content_node,
        content_grad(
            config.content_weight,
            content_features,
            &targets.content_features,
        ),
    ));

    let mut loss_style = 0.0;
    for ((&node, gram), &weight) in targets
        .style_nodes
        .iter()
        .zip(&targets.style_grams)
        .zip(&config.style_weights)
    {
        let features = trace.activation(node);
        loss_style += style_layer_loss(weight, features, gram, config.normalize_gram)?;
        seeds.push((
            node,
            style_layer_grad(weight, features, gram, config.normalize_gram)?,
        ));
    }

    let loss_tv = tv_loss(image, config.tv_weight);
    let mut gradient = service.input_gradient(trace, seeds)?;
    gradient += &tv_grad(image, config.tv_weight);

    debug!(
        "losses: content {}, style {}, tv {}",
        loss_content, loss_style, loss_tv
    );
    Ok((loss_content + loss_style + loss_tv, gradient))
}
