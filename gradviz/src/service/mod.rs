//! Contains the service that can be used to run a pretrained model and to
//! differentiate through it.
//!
//! The service is created using a [`ServiceBuilder`], which can be created using [`ServiceBuilder::new`].
//!
//! [`Service::run`] executes a plain forward pass and returns the class scores.
//! The gradient loops instead use [`Service::forward_trace`], which retains the
//! activation of every layer, and [`Service::input_gradient`], which seeds
//! gradients at one or more recorded activations and propagates them back to
//! the input pixels. Model weights are frozen; only the input receives a
//! gradient.

pub mod labels;
pub mod prepare;
pub mod utility;

use ndarray::{Array2, Array4, ArrayD, Ix2, Ix4};
use petgraph::graph::NodeIndex;
use rayon::{ThreadPool, ThreadPoolBuilder};
use std::{error::Error, path::PathBuf};
use thiserror::Error;

use crate::{
    graph::{create_network, GraphError, Network},
    onnx_format::ModelProto,
    operators::{DeclaredShape, OperationError, Operator},
    providers::{DefaultProvider, Provider},
};

use self::prepare::postprocessing;

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("Could not load the model from {path}: {source}")]
    CouldNotLoadModel {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("Could not decode the model: {0}")]
    CouldNotDecodeModel(#[from] prost::DecodeError),
    #[error("The model could not be translated into an executable graph: {0}")]
    CouldNotTranslateModel(#[from] GraphError),
    #[error("An operation failed while running the model: {0}")]
    CouldNotExecuteOperation(OperationError),
    #[error("The input is invalid: {0}")]
    InvalidInput(Box<dyn Error + Send + Sync>),
    #[error("The input has {actual} channels, the model expects {expected}")]
    InvalidChannelCount { expected: usize, actual: usize },
    #[error("The output shape {actual:?} is different than expected {expected:?}")]
    InvalidOutputShape {
        expected: Vec<usize>,
        actual: Vec<usize>,
    },
    #[error("The model has no layer named {0}")]
    UnknownLayer(String),
    #[error("A gradient seed for layer {layer} has shape {actual:?}, expected {expected:?}")]
    InvalidSeedShape {
        layer: String,
        expected: Vec<usize>,
        actual: Vec<usize>,
    },
    #[error("The scores have shape {0:?}, expected a [batch, classes] tensor")]
    InvalidScoresShape(Vec<usize>),
}

#[derive(Clone, Debug)]
pub struct ServiceBuilder {
    model_path: PathBuf,
    config: Config,
}

#[derive(Clone, Debug)]
pub struct Config {
    pub num_threads: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self { num_threads: 1 }
    }
}

impl ServiceBuilder {
    pub fn new(model_path: PathBuf) -> Self {
        Self {
            model_path,
            config: Config::default(),
        }
    }

    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> Result<Service, ServiceError> {
        let model = utility::read_model_proto(self.model_path.as_path())?;
        Service::new(model, self.config)
    }
}

pub struct Service {
    network: Network,
    config: Config,
    thread_pool: ThreadPool,
}

/// The activations recorded by a single forward pass, one per layer.
#[derive(Debug)]
pub struct Trace {
    activations: Vec<Option<ArrayD<f32>>>,
    output_node: NodeIndex,
}

impl Trace {
    pub fn activation(&self, node: NodeIndex) -> &ArrayD<f32> {
        self.activations[node.index()]
            .as_ref()
            .expect("the forward pass visits every layer")
    }

    /// The raw class scores produced by the model.
    pub fn output(&self) -> &ArrayD<f32> {
        self.activation(self.output_node)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Prediction {
    pub class_index: usize,
    pub probability: f32,
}

pub struct InferenceOutput {
    batch_predictions: Array2<f32>,
}

impl InferenceOutput {
    pub fn new(output_tensor: ArrayD<f32>) -> Result<Self, ServiceError> {
        let scores = squeeze_scores(output_tensor)?;
        let batch_predictions = postprocessing(scores);
        Ok(Self { batch_predictions })
    }

    pub fn get_top_k_predictions(&self, k: usize) -> Vec<Vec<Prediction>> {
        // for each row in the tensor, get the top k predictions
        self.batch_predictions
            .outer_iter()
            .map(|row| {
                let mut ranked = row
                    .iter()
                    .copied()
                    .enumerate()
                    .collect::<Vec<(usize, f32)>>();
                ranked.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap());
                ranked.truncate(k);
                ranked
                    .into_iter()
                    .map(|(class_index, probability)| Prediction {
                        class_index,
                        probability,
                    })
                    .collect()
            })
            .collect()
    }

    pub fn probabilities(&self) -> &Array2<f32> {
        &self.batch_predictions
    }
}

/// Reduces a `[N, C]` or `[N, C, 1, 1]` score tensor to two dimensions.
fn squeeze_scores(output: ArrayD<f32>) -> Result<Array2<f32>, ServiceError> {
    let shape = output.shape().to_vec();
    match *output.shape() {
        [_, _] => Ok(output.into_dimensionality::<Ix2>().unwrap()),
        [n, c, 1, 1] => Ok(output
            .into_shape((n, c))
            .map_err(|_| ServiceError::InvalidScoresShape(shape))?),
        _ => Err(ServiceError::InvalidScoresShape(shape)),
    }
}

impl Service {
    pub fn new(model: ModelProto, config: Config) -> Result<Self, ServiceError> {
        let network = create_network(model)?;
        Ok(Self::from_network(network, config))
    }

    /// Wraps an already assembled network, mainly useful for small
    /// programmatically built models.
    pub fn from_network(network: Network, config: Config) -> Self {
        let n_threads = config.num_threads;
        Self {
            network,
            config,
            thread_pool: ThreadPoolBuilder::new()
                .num_threads(n_threads)
                .build()
                .expect("Unable to create ThreadPool"),
        }
    }

    pub fn current_config(&self) -> Config {
        self.config.clone()
    }

    pub fn network(&self) -> &Network {
        &self.network
    }

    /// Looks up the node recording the activation of a named layer.
    pub fn feature_node(&self, layer_name: &str) -> Result<NodeIndex, ServiceError> {
        self.network
            .find_layer(layer_name)
            .ok_or_else(|| ServiceError::UnknownLayer(String::from(layer_name)))
    }

    /// Preprocesses the given image files and returns their classification output.
    pub fn prepare_and_run(&self, inputs: Vec<PathBuf>) -> Result<InferenceOutput, ServiceError> {
        let input_tensor = utility::read_and_prepare_images(inputs.as_slice())?;
        self.classify(&input_tensor)
    }

    /// Runs the model and applies softmax postprocessing to the scores.
    pub fn classify(&self, input: &Array4<f32>) -> Result<InferenceOutput, ServiceError> {
        let scores = self.run(input)?;
        InferenceOutput::new(scores)
    }

    /// Runs the model on the input batch, returning the raw class scores.
    pub fn run(&self, input: &Array4<f32>) -> Result<ArrayD<f32>, ServiceError> {
        Ok(self.forward_trace(input)?.output().clone())
    }

    /// Runs the model and retains every layer's activation, using the default
    /// execution provider.
    pub fn forward_trace(&self, input: &Array4<f32>) -> Result<Trace, ServiceError> {
        self.forward_trace_with_provider::<DefaultProvider>(input)
    }

    pub fn forward_trace_with_provider<P: Provider>(
        &self,
        input: &Array4<f32>,
    ) -> Result<Trace, ServiceError> {
        if let Some(expected) = self.network.declared_input_channels() {
            let actual = input.shape()[1];
            if actual != expected {
                return Err(ServiceError::InvalidChannelCount { expected, actual });
            }
        }

        let mut activations: Vec<Option<ArrayD<f32>>> = vec![None; self.network.node_count()];
        for &node in self.network.order() {
            let layer = self.network.layer(node);
            let parent_activations: Vec<&ArrayD<f32>> = self
                .network
                .parents(node)
                .iter()
                .map(|parent| {
                    activations[parent.index()]
                        .as_ref()
                        .expect("parents precede their children in topological order")
                })
                .collect();

            let output = match &layer.op {
                Operator::InputFeed(_) => input.clone().into_dyn(),
                Operator::OutputCollector(declared) => {
                    let out = parent_activations[0].clone();
                    check_declared_shape(declared, out.shape())?;
                    out
                }
                op => self
                    .execute_operation::<P>(op, &parent_activations)
                    .map_err(ServiceError::CouldNotExecuteOperation)?,
            };
            activations[node.index()] = Some(output);
        }

        Ok(Trace {
            activations,
            output_node: self.network.output_node(),
        })
    }

    fn execute_operation<P: Provider>(
        &self,
        op: &Operator,
        inputs: &[&ArrayD<f32>],
    ) -> Result<ArrayD<f32>, OperationError> {
        let expect_inputs = |count: usize| -> Result<(), OperationError> {
            if inputs.len() != count {
                return Err(OperationError::WrongInputCount(
                    op.name(),
                    count,
                    inputs.len(),
                ));
            }
            Ok(())
        };

        match op {
            Operator::Convolution(inits, attrs) => {
                expect_inputs(1)?;
                P::conv(
                    &self.thread_pool,
                    inputs[0],
                    &inits.weights,
                    inits.bias.as_ref(),
                    attrs,
                )
            }
            Operator::ReLU => {
                expect_inputs(1)?;
                Ok(P::relu(&self.thread_pool, inputs[0]))
            }
            Operator::MaxPool(attrs) => {
                expect_inputs(1)?;
                P::max_pool(&self.thread_pool, inputs[0], attrs)
            }
            Operator::Concat(attrs) => P::concat(&self.thread_pool, inputs, attrs.axis),
            Operator::Add => {
                expect_inputs(2)?;
                P::add(&self.thread_pool, inputs[0], inputs[1])
            }
            Operator::BatchNorm(inits, attrs) => {
                expect_inputs(1)?;
                P::batch_norm(&self.thread_pool, inputs[0], inits, attrs)
            }
            Operator::Gemm(inits, attrs) => {
                expect_inputs(1)?;
                P::gemm(&self.thread_pool, inputs[0], &inits.b, &inits.c, attrs)
            }
            Operator::GlobalAveragePool => {
                expect_inputs(1)?;
                P::global_average_pool(&self.thread_pool, inputs[0])
            }
            Operator::Reshape(inits) => {
                expect_inputs(1)?;
                P::reshape(&self.thread_pool, inputs[0], &inits.shape)
            }
            Operator::Dropout => {
                expect_inputs(1)?;
                Ok(inputs[0].clone())
            }
            Operator::InputFeed(_) | Operator::OutputCollector(_) => {
                Err(OperationError::InvalidOperator)
            }
        }
    }

    /// Propagates gradient seeds back to the input pixels, using the default
    /// execution provider.
    ///
    /// Each seed pairs a node with the derivative of a scalar objective with
    /// respect to that node's recorded activation. Contributions from
    /// multiple seeds accumulate along the reversed topological order.
    pub fn input_gradient(
        &self,
        trace: &Trace,
        seeds: Vec<(NodeIndex, ArrayD<f32>)>,
    ) -> Result<Array4<f32>, ServiceError> {
        self.input_gradient_with_provider::<DefaultProvider>(trace, seeds)
    }

    pub fn input_gradient_with_provider<P: Provider>(
        &self,
        trace: &Trace,
        seeds: Vec<(NodeIndex, ArrayD<f32>)>,
    ) -> Result<Array4<f32>, ServiceError> {
        let mut grads: Vec<Option<ArrayD<f32>>> = vec![None; self.network.node_count()];
        for (node, seed) in seeds {
            let activation = trace.activation(node);
            if seed.shape() != activation.shape() {
                return Err(ServiceError::InvalidSeedShape {
                    layer: self.network.layer(node).name.clone(),
                    expected: activation.shape().to_vec(),
                    actual: seed.shape().to_vec(),
                });
            }
            accumulate(&mut grads[node.index()], seed);
        }

        for &node in self.network.order().iter().rev() {
            let Some(grad) = grads[node.index()].take() else {
                continue;
            };
            let layer = self.network.layer(node);
            if let Operator::InputFeed(_) = layer.op {
                // reached the pixels; keep the accumulated gradient
                grads[node.index()] = Some(grad);
                continue;
            }

            let parents = self.network.parents(node);
            let parent_grads = self
                .backward_operation::<P>(&layer.op, &grad, trace, parents)
                .map_err(ServiceError::CouldNotExecuteOperation)?;
            debug_assert_eq!(parent_grads.len(), parents.len());
            for (parent, parent_grad) in parents.iter().zip(parent_grads) {
                accumulate(&mut grads[parent.index()], parent_grad);
            }
        }

        let input_grad = grads[self.network.input_node().index()]
            .take()
            .unwrap_or_else(|| ArrayD::zeros(trace.activation(self.network.input_node()).raw_dim()));
        input_grad
            .into_dimensionality::<Ix4>()
            .map_err(|_| ServiceError::CouldNotExecuteOperation(OperationError::InvalidOperator))
    }

    fn backward_operation<P: Provider>(
        &self,
        op: &Operator,
        grad: &ArrayD<f32>,
        trace: &Trace,
        parents: &[NodeIndex],
    ) -> Result<Vec<ArrayD<f32>>, OperationError> {
        let parent_activation = |i: usize| trace.activation(parents[i]);

        match op {
            Operator::OutputCollector(_) | Operator::Dropout => Ok(vec![grad.clone()]),
            Operator::Convolution(inits, attrs) => {
                let dx = P::conv_input_grad(
                    &self.thread_pool,
                    grad,
                    &inits.weights,
                    attrs,
                    parent_activation(0).shape(),
                )?;
                Ok(vec![dx])
            }
            Operator::ReLU => Ok(vec![P::relu_input_grad(
                &self.thread_pool,
                grad,
                parent_activation(0),
            )]),
            Operator::MaxPool(attrs) => {
                let dx =
                    P::max_pool_input_grad(&self.thread_pool, grad, parent_activation(0), attrs)?;
                Ok(vec![dx])
            }
            Operator::Concat(attrs) => {
                let shapes: Vec<&[usize]> = (0..parents.len())
                    .map(|i| parent_activation(i).shape())
                    .collect();
                P::concat_input_grads(&self.thread_pool, grad, &shapes, attrs.axis)
            }
            Operator::Add => Ok(vec![grad.clone(), grad.clone()]),
            Operator::BatchNorm(inits, attrs) => {
                let dx = P::batch_norm_input_grad(&self.thread_pool, grad, inits, attrs)?;
                Ok(vec![dx])
            }
            Operator::Gemm(inits, attrs) => {
                let dx = P::gemm_input_grad(&self.thread_pool, grad, &inits.b, attrs)?;
                Ok(vec![dx])
            }
            Operator::GlobalAveragePool => {
                let dx = P::global_average_pool_input_grad(
                    &self.thread_pool,
                    grad,
                    parent_activation(0).shape(),
                )?;
                Ok(vec![dx])
            }
            Operator::Reshape(_) => {
                let dx = grad
                    .clone()
                    .into_shape(parent_activation(0).raw_dim())
                    .map_err(|_| OperationError::InvalidOperator)?;
                Ok(vec![dx])
            }
            Operator::InputFeed(_) => Err(OperationError::InvalidOperator),
        }
    }

    /// The raw scores of a trace as a `[batch, classes]` matrix.
    pub fn scores(&self, trace: &Trace) -> Result<Array2<f32>, ServiceError> {
        squeeze_scores(trace.output().clone())
    }

    /// Builds a gradient seed at the score node from a `[batch, classes]`
    /// matrix, reshaped to whatever shape the model emits its scores in.
    pub fn score_seed(
        &self,
        trace: &Trace,
        grad: Array2<f32>,
    ) -> Result<(NodeIndex, ArrayD<f32>), ServiceError> {
        let output_node = self.network.output_node();
        let target_dim = trace.activation(output_node).raw_dim();
        let seed = grad
            .into_dyn()
            .into_shape(target_dim)
            .map_err(|e| ServiceError::InvalidInput(Box::new(e)))?;
        Ok((output_node, seed))
    }
}

fn accumulate(slot: &mut Option<ArrayD<f32>>, grad: ArrayD<f32>) {
    match slot {
        Some(existing) => *existing += &grad,
        None => *slot = Some(grad),
    }
}

fn check_declared_shape(declared: &DeclaredShape, actual: &[usize]) -> Result<(), ServiceError> {
    if declared.is_empty() {
        return Ok(());
    }
    if declared.len() != actual.len() {
        return Err(ServiceError::InvalidOutputShape {
            expected: declared.iter().map(|d| d.unwrap_or(0)).collect(),
            actual: actual.to_vec(),
        });
    }
    // the batch axis is never validated
    for (dim, &size) in declared.iter().zip(actual).skip(1) {
        if let Some(expected) = dim {
            if *expected != size {
                return Err(ServiceError::InvalidOutputShape {
                    expected: declared.iter().map(|d| d.unwrap_or(0)).collect(),
                    actual: actual.to_vec(),
                });
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operators::{ConvAttributes, ConvInits, Operator, ReshapeInits};
    use ndarray::{arr1, arr2, Array4};

    /// 1x1 convolution over 2 input channels into `classes` feature maps,
    /// averaged over space and flattened: a minimal linear classifier.
    fn linear_classifier(weights: Vec<f32>, classes: usize) -> Service {
        let kernel =
            Array4::from_shape_vec((classes, 2, 1, 1), weights).expect("kernel shape");
        let network = crate::graph::Network::sequential(
            vec![None, Some(2), None, None],
            vec![
                (
                    "score_conv",
                    Operator::Convolution(
                        ConvInits::new(kernel, None),
                        ConvAttributes::new([1, 1], 1, [1, 1], [0, 0, 0, 0], [1, 1]),
                    ),
                ),
                ("pool", Operator::GlobalAveragePool),
                (
                    "flatten",
                    Operator::Reshape(ReshapeInits::new(arr1(&[0, -1]))),
                ),
            ],
        )
        .unwrap();
        Service::from_network(network, Config::default())
    }

    #[test]
    fn forward_trace_records_every_layer() {
        let service = linear_classifier(vec![1.0, 0.0, 0.0, 1.0, 1.0, -1.0], 3);
        let input = Array4::from_elem((1, 2, 4, 4), 0.5);
        let trace = service.forward_trace(&input).unwrap();

        let conv_node = service.feature_node("score_conv").unwrap();
        assert_eq!(trace.activation(conv_node).shape(), &[1, 3, 4, 4]);
        assert_eq!(trace.output().shape(), &[1, 3]);
    }

    #[test]
    fn classification_probabilities_sum_to_one() {
        let service = linear_classifier(vec![1.0, 0.0, 0.0, 1.0, 1.0, -1.0], 3);
        let input = Array4::from_elem((2, 2, 4, 4), 0.25);
        let output = service.classify(&input).unwrap();

        for row in output.probabilities().outer_iter() {
            assert!((row.sum() - 1.0).abs() < 1e-6);
        }
        let top = output.get_top_k_predictions(3);
        assert_eq!(top.len(), 2);
        assert!(top[0][0].probability >= top[0][1].probability);
    }

    #[test]
    fn wrong_channel_count_is_rejected() {
        let service = linear_classifier(vec![1.0, 0.0, 0.0, 1.0, 1.0, -1.0], 3);
        let input = Array4::from_elem((1, 4, 4, 4), 0.5);
        let err = service.forward_trace(&input).unwrap_err();
        assert!(matches!(
            err,
            ServiceError::InvalidChannelCount {
                expected: 2,
                actual: 4
            }
        ));
    }

    #[test]
    fn input_gradient_of_linear_model_matches_weights() {
        // with a 1x1 conv + global average pool, the gradient of one class
        // score w.r.t. every pixel of channel c is w[class, c] / (h * w)
        let service = linear_classifier(vec![1.0, 2.0, -0.5, 0.25], 2);
        let input = Array4::from_elem((1, 2, 2, 2), 0.3);
        let trace = service.forward_trace(&input).unwrap();

        let seed = service
            .score_seed(&trace, arr2(&[[1.0_f32, 0.0]]))
            .unwrap();
        let grad = service.input_gradient(&trace, vec![seed]).unwrap();

        let area = 4.0;
        for (c, expected) in [1.0_f32, 2.0].iter().enumerate() {
            for i in 0..2 {
                for j in 0..2 {
                    assert!((grad[[0, c, i, j]] - expected / area).abs() < 1e-6);
                }
            }
        }
    }

    #[test]
    fn seeds_at_interior_layers_accumulate() {
        let service = linear_classifier(vec![1.0, 0.0, 0.0, 1.0], 2);
        let input = Array4::from_elem((1, 2, 2, 2), 0.1);
        let trace = service.forward_trace(&input).unwrap();

        let conv_node = service.feature_node("score_conv").unwrap();
        let conv_seed = ArrayD::from_elem(trace.activation(conv_node).raw_dim(), 1.0);
        let score_seed = service
            .score_seed(&trace, arr2(&[[1.0_f32, 1.0]]))
            .unwrap();

        let combined = service
            .input_gradient(&trace, vec![(conv_node, conv_seed.clone()), score_seed])
            .unwrap();
        let only_conv = service
            .input_gradient(&trace, vec![(conv_node, conv_seed)])
            .unwrap();

        // identity weights: both seeds contribute to channel 0
        assert!(combined[[0, 0, 0, 0]] > only_conv[[0, 0, 0, 0]]);
    }

    #[test]
    fn bad_seed_shape_is_rejected() {
        let service = linear_classifier(vec![1.0, 0.0, 0.0, 1.0], 2);
        let input = Array4::from_elem((1, 2, 2, 2), 0.1);
        let trace = service.forward_trace(&input).unwrap();

        let conv_node = service.feature_node("score_conv").unwrap();
        let bad_seed = ArrayD::from_elem(ndarray::IxDyn(&[1, 2, 3, 3]), 1.0);
        let err = service
            .input_gradient(&trace, vec![(conv_node, bad_seed)])
            .unwrap_err();
        assert!(matches!(err, ServiceError::InvalidSeedShape { .. }));
    }

    #[test]
    fn scores_squeeze_trailing_spatial_dims() {
        let scores =
            ArrayD::from_shape_vec(ndarray::IxDyn(&[1, 3, 1, 1]), vec![1.0, 2.0, 3.0]).unwrap();
        let squeezed = squeeze_scores(scores).unwrap();
        assert_eq!(squeezed, arr2(&[[1.0, 2.0, 3.0]]));
    }
}
