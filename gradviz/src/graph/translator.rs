use std::collections::{HashMap, HashSet};

use petgraph::graph::{DiGraph, NodeIndex};

use crate::onnx_format::{
    tensor_shape_proto::dimension, type_proto, AttributeProto, ModelProto, NodeProto, TensorProto,
    ValueInfoProto,
};
use crate::operators::*;
use crate::tensor::{Tensor, TensorData};

use super::{GraphError, Layer, Network};

/// Translates a parsed ONNX model into an executable [`Network`].
///
/// Attributes are resolved by name and initializers by the tensor names
/// referenced in each node's input list, so the translation does not depend
/// on the order in which a particular exporter serialized them.
pub fn create_network(model_proto: ModelProto) -> Result<Network, GraphError> {
    let graph_proto = model_proto.graph.ok_or(GraphError::MissingGraph)?;

    let initializers: HashMap<String, TensorProto> = graph_proto
        .initializer
        .into_iter()
        .map(|t| (t.name.clone().unwrap_or_default(), t))
        .collect();

    // older opsets list initializers among the graph inputs as well
    let (input_name, input_shape) =
        parse_io_value_info(&graph_proto.input, &initializers)
            .ok_or(GraphError::InputNodeParsingError)?;
    let (output_name, output_shape) =
        parse_io_value_info(&graph_proto.output, &initializers)
            .ok_or(GraphError::OutputNodeParsingError)?;

    let mut graph = DiGraph::<Layer, ()>::new();
    let mut inputs: Vec<Vec<NodeIndex>> = Vec::new();

    let input_node = graph.add_node(Layer {
        name: input_name.clone(),
        op: Operator::InputFeed(input_shape),
    });
    inputs.push(Vec::new());

    // producer of every intermediate tensor name
    let mut producers: HashMap<String, NodeIndex> = HashMap::new();
    producers.insert(input_name, input_node);

    let mut pending_edges: Vec<(String, NodeIndex)> = Vec::new();
    let mut output_producers: Vec<NodeIndex> = Vec::new();

    for node in &graph_proto.node {
        let op_type = node
            .op_type
            .clone()
            .ok_or_else(|| GraphError::ConversionError(String::from("node without op_type")))?;
        let node_name = node
            .name
            .clone()
            .filter(|n| !n.is_empty())
            .or_else(|| node.output.first().cloned())
            .ok_or_else(|| GraphError::ConversionError(String::from("unnamed node")))?;

        // omitted optional inputs are encoded as empty names
        let data_inputs: Vec<String> = node
            .input
            .iter()
            .filter(|name| !name.is_empty() && !initializers.contains_key(*name))
            .cloned()
            .collect();

        let operator = translate_operator(node, &op_type, &node_name, &data_inputs, &initializers)?;

        let idx = graph.add_node(Layer {
            name: node_name,
            op: operator,
        });
        inputs.push(Vec::new());

        for tensor in data_inputs {
            pending_edges.push((tensor, idx));
        }
        for out in &node.output {
            producers.insert(out.clone(), idx);
            if *out == output_name {
                output_producers.push(idx);
            }
        }
    }

    let output_node = graph.add_node(Layer {
        name: output_name,
        op: Operator::OutputCollector(output_shape),
    });
    inputs.push(Vec::new());

    for (tensor, consumer) in pending_edges {
        let producer = *producers.get(&tensor).ok_or_else(|| GraphError::ParentNotFound {
            tensor: tensor.clone(),
            consumer: graph[consumer].name.clone(),
        })?;
        graph.add_edge(producer, consumer, ());
        inputs[consumer.index()].push(producer);
    }
    for producer in output_producers {
        graph.add_edge(producer, output_node, ());
        inputs[output_node.index()].push(producer);
    }
    if inputs[output_node.index()].is_empty() {
        return Err(GraphError::OutputNodeParsingError);
    }

    Network::from_parts(graph, inputs, input_node, output_node)
}

fn translate_operator(
    node: &NodeProto,
    op_type: &str,
    node_name: &str,
    data_inputs: &[String],
    initializers: &HashMap<String, TensorProto>,
) -> Result<Operator, GraphError> {
    let expect_data_inputs = |count: usize| -> Result<(), GraphError> {
        if data_inputs.len() != count {
            return Err(GraphError::ConversionError(format!(
                "operator {} expects {} data inputs, found {}",
                node_name,
                count,
                data_inputs.len()
            )));
        }
        Ok(())
    };

    let operator = match op_type {
        "Conv" => {
            expect_data_inputs(1)?;
            let kernel_shape = attr_ints_2(node, "kernel_shape", node_name)?;
            let attrs = ConvAttributes::new(
                attr_ints_2(node, "dilations", node_name).unwrap_or([1, 1]),
                attr_i(node, "group").unwrap_or(1) as usize,
                kernel_shape,
                attr_ints_4(node, "pads", node_name).unwrap_or([0, 0, 0, 0]),
                attr_ints_2(node, "strides", node_name).unwrap_or([1, 1]),
            );

            let mut weight_inits = initializer_inputs(node, data_inputs, initializers, node_name)?;
            if weight_inits.is_empty() || weight_inits.len() > 2 {
                return Err(GraphError::MissingInitializer {
                    initializer: String::from("weights"),
                    operator: String::from(node_name),
                });
            }
            let bias = if weight_inits.len() == 2 {
                Some(
                    flatten_to_1d(weight_inits.pop().unwrap()).ok_or_else(|| {
                        GraphError::InvalidInitializer {
                            initializer: String::from("bias"),
                            operator: String::from(node_name),
                        }
                    })?,
                )
            } else {
                None
            };
            let weights = float_of_rank(weight_inits.pop().unwrap(), 4)
                .and_then(|w| w.into_dimensionality::<ndarray::Ix4>().ok())
                .ok_or_else(|| GraphError::InvalidInitializer {
                    initializer: String::from("weights"),
                    operator: String::from(node_name),
                })?;

            Operator::Convolution(ConvInits::new(weights, bias), attrs)
        }
        "Relu" => {
            expect_data_inputs(1)?;
            Operator::ReLU
        }
        "MaxPool" => {
            expect_data_inputs(1)?;
            let attrs = MaxPoolAttributes::new(
                attr_ints_2(node, "kernel_shape", node_name)?,
                attr_ints_4(node, "pads", node_name).unwrap_or([0, 0, 0, 0]),
                attr_ints_2(node, "strides", node_name).unwrap_or([1, 1]),
            );
            Operator::MaxPool(attrs)
        }
        "Concat" => {
            let axis = attr_i(node, "axis").ok_or_else(|| GraphError::MissingAttribute {
                attribute: String::from("axis"),
                operator: String::from(node_name),
            })?;
            Operator::Concat(ConcatAttributes::new(axis as usize))
        }
        "Add" => {
            expect_data_inputs(2)?;
            Operator::Add
        }
        "BatchNormalization" => {
            expect_data_inputs(1)?;
            let attrs = BatchNormAttributes::new(
                attr_f(node, "epsilon").unwrap_or(1e-5),
                attr_f(node, "momentum").unwrap_or(0.9),
                attr_i(node, "spatial").unwrap_or(1),
            );
            let mut inits = initializer_inputs(node, data_inputs, initializers, node_name)?
                .into_iter()
                .map(flatten_to_1d);
            let (Some(Some(scale)), Some(Some(bias)), Some(Some(mean)), Some(Some(var))) =
                (inits.next(), inits.next(), inits.next(), inits.next())
            else {
                return Err(GraphError::MissingInitializer {
                    initializer: String::from("scale/bias/mean/var"),
                    operator: String::from(node_name),
                });
            };
            Operator::BatchNorm(BatchNormInits::new(scale, bias, mean, var), attrs)
        }
        "Gemm" => {
            expect_data_inputs(1)?;
            let attrs = GemmAttributes::new(
                attr_f(node, "alpha").unwrap_or(1.0),
                attr_f(node, "beta").unwrap_or(1.0),
                attr_i(node, "transA").unwrap_or(0),
                attr_i(node, "transB").unwrap_or(0),
            );
            let mut inits = initializer_inputs(node, data_inputs, initializers, node_name)?;
            if inits.len() != 2 {
                return Err(GraphError::MissingInitializer {
                    initializer: String::from("B/C"),
                    operator: String::from(node_name),
                });
            }
            let c = flatten_to_1d(inits.pop().unwrap()).ok_or_else(|| {
                GraphError::InvalidInitializer {
                    initializer: String::from("C"),
                    operator: String::from(node_name),
                }
            })?;
            let b = float_of_rank(inits.pop().unwrap(), 2)
                .and_then(|b| b.into_dimensionality::<ndarray::Ix2>().ok())
                .ok_or_else(|| GraphError::InvalidInitializer {
                    initializer: String::from("B"),
                    operator: String::from(node_name),
                })?;
            Operator::Gemm(GemmInits::new(b, c), attrs)
        }
        "GlobalAveragePool" => {
            expect_data_inputs(1)?;
            Operator::GlobalAveragePool
        }
        "Reshape" => {
            expect_data_inputs(1)?;
            let mut inits = initializer_inputs(node, data_inputs, initializers, node_name)?;
            let Some(TensorData::Int64(shape)) = inits.pop() else {
                return Err(GraphError::MissingInitializer {
                    initializer: String::from("shape"),
                    operator: String::from(node_name),
                });
            };
            let shape = shape
                .into_dimensionality::<ndarray::Ix1>()
                .map_err(|_| GraphError::InvalidInitializer {
                    initializer: String::from("shape"),
                    operator: String::from(node_name),
                })?;
            Operator::Reshape(ReshapeInits::new(shape))
        }
        "Flatten" => {
            // lowered to a reshape; only the classifier-head form is needed
            expect_data_inputs(1)?;
            let axis = attr_i(node, "axis").unwrap_or(1);
            if axis != 1 {
                return Err(GraphError::UnsupportedOperator(format!(
                    "Flatten with axis {axis}"
                )));
            }
            Operator::Reshape(ReshapeInits::new(ndarray::arr1(&[0, -1])))
        }
        "Dropout" => {
            expect_data_inputs(1)?;
            Operator::Dropout
        }
        op => return Err(GraphError::UnsupportedOperator(String::from(op))),
    };
    Ok(operator)
}

/// Collects the initializer inputs of a node, converted to tensor data, in
/// the order they appear in the node's input list.
fn initializer_inputs(
    node: &NodeProto,
    data_inputs: &[String],
    initializers: &HashMap<String, TensorProto>,
    node_name: &str,
) -> Result<Vec<TensorData>, GraphError> {
    let data_names: HashSet<&String> = data_inputs.iter().collect();
    node.input
        .iter()
        .filter(|name| !name.is_empty() && !data_names.contains(name))
        .map(|name| {
            let proto = initializers
                .get(name)
                .cloned()
                .ok_or_else(|| GraphError::MissingInitializer {
                    initializer: name.clone(),
                    operator: String::from(node_name),
                })?;
            Ok(Tensor::try_from(proto)?.data)
        })
        .collect()
}

fn attr<'a>(node: &'a NodeProto, name: &str) -> Option<&'a AttributeProto> {
    node.attribute
        .iter()
        .find(|a| a.name.as_deref() == Some(name))
}

fn attr_f(node: &NodeProto, name: &str) -> Option<f32> {
    attr(node, name).and_then(|a| a.f)
}

fn attr_i(node: &NodeProto, name: &str) -> Option<i64> {
    attr(node, name).and_then(|a| a.i)
}

fn attr_ints_2(node: &NodeProto, name: &str, operator: &str) -> Result<[usize; 2], GraphError> {
    let ints = &attr(node, name)
        .ok_or_else(|| GraphError::MissingAttribute {
            attribute: String::from(name),
            operator: String::from(operator),
        })?
        .ints;
    match ints.as_slice() {
        [a, b] => Ok([*a as usize, *b as usize]),
        _ => Err(GraphError::MissingAttribute {
            attribute: String::from(name),
            operator: String::from(operator),
        }),
    }
}

fn attr_ints_4(node: &NodeProto, name: &str, operator: &str) -> Result<[usize; 4], GraphError> {
    let ints = &attr(node, name)
        .ok_or_else(|| GraphError::MissingAttribute {
            attribute: String::from(name),
            operator: String::from(operator),
        })?
        .ints;
    match ints.as_slice() {
        [a, b, c, d] => Ok([*a as usize, *b as usize, *c as usize, *d as usize]),
        _ => Err(GraphError::MissingAttribute {
            attribute: String::from(name),
            operator: String::from(operator),
        }),
    }
}

fn parse_io_value_info(
    io_value_infos: &[ValueInfoProto],
    initializers: &HashMap<String, TensorProto>,
) -> Option<(String, DeclaredShape)> {
    io_value_infos
        .iter()
        .find(|value_info| {
            let name = value_info.name.as_deref().unwrap_or_default();
            !name.is_empty() && !initializers.contains_key(name)
        })
        .map(|value_info| {
            let name = value_info.name.clone().unwrap_or_default();
            (name, declared_shape(value_info))
        })
}

fn declared_shape(value_info: &ValueInfoProto) -> DeclaredShape {
    let Some(type_proto) = &value_info.r#type else {
        return Vec::new();
    };
    let Some(type_proto::Value::TensorType(tensor_type)) = &type_proto.value else {
        return Vec::new();
    };
    let Some(shape) = &tensor_type.shape else {
        return Vec::new();
    };
    shape
        .dim
        .iter()
        .map(|dim| match &dim.value {
            Some(dimension::Value::DimValue(v)) if *v > 0 => Some(*v as usize),
            _ => None,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::onnx_format::{
        tensor_shape_proto, GraphProto, TensorShapeProto, TypeProto,
    };

    fn value_info(name: &str, dims: &[Option<i64>]) -> ValueInfoProto {
        ValueInfoProto {
            name: Some(String::from(name)),
            r#type: Some(TypeProto {
                value: Some(type_proto::Value::TensorType(type_proto::Tensor {
                    elem_type: Some(1),
                    shape: Some(TensorShapeProto {
                        dim: dims
                            .iter()
                            .map(|d| tensor_shape_proto::Dimension {
                                value: Some(match d {
                                    Some(v) => {
                                        tensor_shape_proto::dimension::Value::DimValue(*v)
                                    }
                                    None => tensor_shape_proto::dimension::Value::DimParam(
                                        String::from("N"),
                                    ),
                                }),
                            })
                            .collect(),
                    }),
                })),
            }),
            doc_string: None,
        }
    }

    fn float_initializer(name: &str, dims: &[i64], data: Vec<f32>) -> TensorProto {
        TensorProto {
            dims: dims.to_vec(),
            data_type: Some(1),
            float_data: data,
            name: Some(String::from(name)),
            ..Default::default()
        }
    }

    fn conv_relu_model() -> ModelProto {
        let conv = NodeProto {
            input: vec![String::from("data"), String::from("conv_w")],
            output: vec![String::from("conv_out")],
            name: Some(String::from("conv1")),
            op_type: Some(String::from("Conv")),
            attribute: vec![
                AttributeProto {
                    name: Some(String::from("kernel_shape")),
                    ints: vec![1, 1],
                    ..Default::default()
                },
                AttributeProto {
                    name: Some(String::from("strides")),
                    ints: vec![1, 1],
                    ..Default::default()
                },
            ],
            ..Default::default()
        };
        let relu = NodeProto {
            input: vec![String::from("conv_out")],
            output: vec![String::from("scores")],
            name: Some(String::from("relu1")),
            op_type: Some(String::from("Relu")),
            ..Default::default()
        };
        ModelProto {
            ir_version: Some(7),
            graph: Some(GraphProto {
                node: vec![conv, relu],
                name: Some(String::from("tiny")),
                initializer: vec![float_initializer("conv_w", &[2, 3, 1, 1], vec![0.5; 6])],
                input: vec![value_info("data", &[None, Some(3), Some(4), Some(4)])],
                output: vec![value_info("scores", &[None, Some(2), Some(4), Some(4)])],
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    #[test]
    fn translated_network_node_count() {
        let network = create_network(conv_relu_model()).unwrap();
        // input + conv + relu + output
        assert_eq!(network.node_count(), 4);
        assert_eq!(network.declared_input_channels(), Some(3));
    }

    #[test]
    fn translated_network_is_ordered() {
        let network = create_network(conv_relu_model()).unwrap();
        let names: Vec<&str> = network.layer_names().collect();
        assert_eq!(names, vec!["data", "conv1", "relu1", "scores"]);
    }

    #[test]
    fn unsupported_operator_is_reported() {
        let mut model = conv_relu_model();
        model.graph.as_mut().unwrap().node[1].op_type = Some(String::from("LSTM"));
        let err = create_network(model).unwrap_err();
        assert!(matches!(err, GraphError::UnsupportedOperator(op) if op == "LSTM"));
    }
}
