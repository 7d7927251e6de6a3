//! Executable graph built from a parsed ONNX model.
//!
//! The [`Network`] owns a DAG of typed operators together with its
//! topological order and, for every node, the ordered list of data parents.
//! Both are computed once at translation time: the gradient loops re-walk
//! the same structure hundreds of times, forward and reversed.

mod translator;

pub use translator::create_network;

use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::algo::toposort;
use thiserror::Error;

use crate::operators::{DeclaredShape, Operator};
use crate::tensor::TensorError;

#[derive(Error, Debug)]
pub enum GraphError {
    #[error("Unable to translate the model: {0}")]
    ConversionError(String),
    #[error("The parsed model carries no graph")]
    MissingGraph,
    #[error("Could not parse the model input node")]
    InputNodeParsingError,
    #[error("Could not parse the model output node")]
    OutputNodeParsingError,
    #[error("Unsupported operator {0}")]
    UnsupportedOperator(String),
    #[error("Missing attribute {attribute} on operator {operator}")]
    MissingAttribute {
        attribute: String,
        operator: String,
    },
    #[error("Missing initializer {initializer} for operator {operator}")]
    MissingInitializer {
        initializer: String,
        operator: String,
    },
    #[error("Initializer {initializer} for operator {operator} has the wrong type or rank")]
    InvalidInitializer {
        initializer: String,
        operator: String,
    },
    #[error("The producer of tensor {tensor}, consumed by {consumer}, was not found")]
    ParentNotFound { tensor: String, consumer: String },
    #[error("The model's graph is not a DAG")]
    NotADag,
    #[error(transparent)]
    InvalidTensor(#[from] TensorError),
}

#[derive(Debug)]
pub struct Layer {
    pub name: String,
    pub op: Operator,
}

#[derive(Debug)]
pub struct Network {
    graph: DiGraph<Layer, ()>,
    order: Vec<NodeIndex>,
    inputs: Vec<Vec<NodeIndex>>,
    input_node: NodeIndex,
    output_node: NodeIndex,
}

impl Network {
    pub(crate) fn from_parts(
        graph: DiGraph<Layer, ()>,
        inputs: Vec<Vec<NodeIndex>>,
        input_node: NodeIndex,
        output_node: NodeIndex,
    ) -> Result<Self, GraphError> {
        let order = toposort(&graph, None).map_err(|_| GraphError::NotADag)?;
        Ok(Self {
            graph,
            order,
            inputs,
            input_node,
            output_node,
        })
    }

    /// Builds a linear chain of layers, mainly useful to assemble small
    /// networks programmatically.
    pub fn sequential(
        declared_input: DeclaredShape,
        layers: Vec<(&str, Operator)>,
    ) -> Result<Self, GraphError> {
        let mut graph = DiGraph::<Layer, ()>::new();
        let mut inputs: Vec<Vec<NodeIndex>> = Vec::new();

        let input_node = graph.add_node(Layer {
            name: String::from("input"),
            op: Operator::InputFeed(declared_input),
        });
        inputs.push(Vec::new());

        let mut previous = input_node;
        for (name, op) in layers {
            let node = graph.add_node(Layer {
                name: String::from(name),
                op,
            });
            graph.add_edge(previous, node, ());
            inputs.push(vec![previous]);
            previous = node;
        }

        let output_node = graph.add_node(Layer {
            name: String::from("output"),
            op: Operator::OutputCollector(Vec::new()),
        });
        graph.add_edge(previous, output_node, ());
        inputs.push(vec![previous]);

        Self::from_parts(graph, inputs, input_node, output_node)
    }

    pub fn layer(&self, node: NodeIndex) -> &Layer {
        &self.graph[node]
    }

    /// Topologically sorted node indexes, input first.
    pub fn order(&self) -> &[NodeIndex] {
        &self.order
    }

    /// Ordered data parents of a node (initializers excluded).
    pub fn parents(&self, node: NodeIndex) -> &[NodeIndex] {
        &self.inputs[node.index()]
    }

    pub fn input_node(&self) -> NodeIndex {
        self.input_node
    }

    pub fn output_node(&self) -> NodeIndex {
        self.output_node
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    /// Looks a layer up by its name in the source model.
    pub fn find_layer(&self, name: &str) -> Option<NodeIndex> {
        self.graph
            .node_indices()
            .find(|&idx| self.graph[idx].name == name)
    }

    pub fn layer_names(&self) -> impl Iterator<Item = &str> + '_ {
        self.order.iter().map(|&idx| self.graph[idx].name.as_str())
    }

    /// Channel count declared for the model input, when the model declares one.
    pub fn declared_input_channels(&self) -> Option<usize> {
        match &self.graph[self.input_node].op {
            Operator::InputFeed(shape) => shape.get(1).copied().flatten(),
            _ => None,
        }
    }
}
