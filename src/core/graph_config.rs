// Graph configuration: parsed declarations and their validated form

use crate::core::calculator::{CalculatorFactory, CalculatorRegistry};
use crate::core::text_format::{self, TextMessage, TextValue};
use crate::models::graph::{GraphError, GraphResult};
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::fmt;
use std::sync::Arc;
use tracing::debug;

// ==============================================================================
// Declarations
// ==============================================================================

/// A stream or side packet reference: `name`, `TAG:name` or `TAG:index:name`
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StreamRef {
    pub tag: String,
    pub index: usize,
    pub name: String,
}

impl StreamRef {
    pub fn parse(spec: &str) -> GraphResult<Self> {
        let invalid = |reason: &str| {
            GraphError::InvalidArgument(format!("invalid stream reference {:?}: {}", spec, reason))
        };

        let parts: Vec<&str> = spec.split(':').collect();
        let (tag, index, name) = match parts.as_slice() {
            [name] => ("", 0, *name),
            [tag, name] => (*tag, 0, *name),
            [tag, index, name] => {
                let index = index.parse::<usize>().map_err(|_| invalid("index is not a number"))?;
                (*tag, index, *name)
            }
            _ => return Err(invalid("too many ':' separators")),
        };

        let tag_ok = tag
            .chars()
            .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_');
        if !tag_ok {
            return Err(invalid("tags use uppercase letters, digits and '_'"));
        }

        let mut chars = name.chars();
        let name_ok = matches!(chars.next(), Some(c) if c.is_ascii_alphabetic() || c == '_')
            && chars.all(|c| c.is_ascii_alphanumeric() || c == '_');
        if !name_ok {
            return Err(invalid("names start with a letter or '_' and use letters, digits and '_'"));
        }

        Ok(Self {
            tag: tag.to_string(),
            index,
            name: name.to_string(),
        })
    }
}

impl fmt::Display for StreamRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.tag.is_empty(), self.index) {
            (true, _) => write!(f, "{}", self.name),
            (false, 0) => write!(f, "{}:{}", self.tag, self.name),
            (false, index) => write!(f, "{}:{}:{}", self.tag, index, self.name),
        }
    }
}

/// One `node { ... }` block
#[derive(Debug, Clone, PartialEq, Default)]
pub struct NodeConfig {
    pub name: Option<String>,
    pub calculator: String,
    pub input_streams: Vec<StreamRef>,
    pub output_streams: Vec<StreamRef>,
    pub input_side_packets: Vec<StreamRef>,
    /// `options` and `node_options` merged
    pub options: TextMessage,
}

// Node fields accepted but not used by this runtime
const IGNORED_NODE_FIELDS: &[&str] = &[
    "input_stream_handler",
    "output_stream_handler",
    "input_stream_info",
    "executor",
    "max_in_flight",
    "source_layer",
    "buffer_size_hint",
    "profiler_config",
];

impl NodeConfig {
    fn from_message(message: &TextMessage, position: usize) -> GraphResult<Self> {
        let mut node = NodeConfig::default();

        for (field, value) in message.fields() {
            match field.as_str() {
                "calculator" => node.calculator = string_field(field, value)?.to_string(),
                "name" => node.name = Some(string_field(field, value)?.to_string()),
                "input_stream" => node.input_streams.push(stream_field(field, value)?),
                "output_stream" => node.output_streams.push(stream_field(field, value)?),
                "input_side_packet" => node.input_side_packets.push(stream_field(field, value)?),
                "output_side_packet" => {
                    return Err(GraphError::InvalidArgument(format!(
                        "node {} declares output side packets, which are not supported",
                        position
                    )))
                }
                "options" | "node_options" => {
                    let options = value.as_message().ok_or_else(|| {
                        GraphError::InvalidArgument(format!("{} must be a message", field))
                    })?;
                    node.options.extend(options.clone());
                }
                other if IGNORED_NODE_FIELDS.contains(&other) => {
                    debug!("Ignoring node field {} in node {}", other, position);
                }
                other => {
                    return Err(GraphError::InvalidArgument(format!(
                        "unknown field {} in node {}",
                        other, position
                    )))
                }
            }
        }

        if node.calculator.is_empty() {
            return Err(GraphError::InvalidArgument(format!(
                "node {} has no calculator",
                position
            )));
        }
        Ok(node)
    }

    /// Name used in diagnostics
    pub fn label(&self, position: usize) -> String {
        match &self.name {
            Some(name) => name.clone(),
            None => format!("{}#{}", self.calculator, position),
        }
    }

    pub fn input_by_tag(&self, tag: &str) -> Option<&StreamRef> {
        self.input_streams.iter().find(|stream| stream.tag == tag)
    }

    pub fn output_by_tag(&self, tag: &str) -> Option<&StreamRef> {
        self.output_streams.iter().find(|stream| stream.tag == tag)
    }
}

fn string_field<'a>(field: &str, value: &'a TextValue) -> GraphResult<&'a str> {
    value
        .as_str()
        .ok_or_else(|| GraphError::InvalidArgument(format!("{} must be a string", field)))
}

fn stream_field(field: &str, value: &TextValue) -> GraphResult<StreamRef> {
    StreamRef::parse(string_field(field, value)?)
}

/// A whole graph declaration
#[derive(Debug, Clone, PartialEq, Default)]
pub struct GraphConfig {
    pub input_streams: Vec<String>,
    pub output_streams: Vec<String>,
    pub input_side_packets: Vec<String>,
    pub nodes: Vec<NodeConfig>,
    pub max_queue_size: Option<i64>,
}

impl GraphConfig {
    /// Parse the text form of a graph declaration
    pub fn parse_text(text: &str) -> GraphResult<Self> {
        let message = text_format::parse(text)?;
        let mut config = GraphConfig::default();

        for (field, value) in message.fields() {
            match field.as_str() {
                "input_stream" => config.input_streams.push(stream_field(field, value)?.name),
                "output_stream" => config.output_streams.push(stream_field(field, value)?.name),
                "input_side_packet" => config
                    .input_side_packets
                    .push(stream_field(field, value)?.name),
                "node" => {
                    let node = value.as_message().ok_or_else(|| {
                        GraphError::InvalidArgument("node must be a message".to_string())
                    })?;
                    let position = config.nodes.len();
                    config.nodes.push(NodeConfig::from_message(node, position)?);
                }
                "max_queue_size" => {
                    config.max_queue_size = Some(value.as_i64().ok_or_else(|| {
                        GraphError::InvalidArgument("max_queue_size must be an integer".to_string())
                    })?);
                }
                other => debug!("Ignoring graph field {}", other),
            }
        }

        Ok(config)
    }
}

// ==============================================================================
// Validation
// ==============================================================================

#[derive(Debug, Clone, Copy)]
enum Producer {
    GraphInput,
    Node(usize),
}

/// A graph declaration checked against a calculator registry.
///
/// Only needed while building a `CalculatorGraph`; drop it afterwards.
pub struct ValidatedGraphConfig {
    config: GraphConfig,
    order: Vec<usize>,
    required_side_packets: BTreeSet<String>,
    gpu_required: bool,
    factories: Vec<Arc<dyn CalculatorFactory>>,
}

impl ValidatedGraphConfig {
    pub fn initialize(config: GraphConfig, registry: &CalculatorRegistry) -> GraphResult<Self> {
        let mut producers: HashMap<String, Producer> = HashMap::new();
        for name in &config.input_streams {
            if producers.insert(name.clone(), Producer::GraphInput).is_some() {
                return Err(GraphError::AlreadyExists(format!(
                    "graph input stream {} is declared twice",
                    name
                )));
            }
        }

        let mut factories = Vec::with_capacity(config.nodes.len());
        for (position, node) in config.nodes.iter().enumerate() {
            let label = node.label(position);
            let factory = registry.get(&node.calculator).ok_or_else(|| {
                GraphError::NotFound(format!(
                    "calculator {} used by {} is not registered",
                    node.calculator, label
                ))
            })?;

            if node.input_streams.is_empty() {
                return Err(GraphError::InvalidArgument(format!(
                    "{} has no input streams",
                    label
                )));
            }
            factory.validate(node).map_err(|e| GraphError::Calculator {
                node: label.clone(),
                message: e.to_string(),
            })?;

            for output in &node.output_streams {
                let previous = producers.insert(output.name.clone(), Producer::Node(position));
                if let Some(previous) = previous {
                    let previous = match previous {
                        Producer::GraphInput => "the graph input".to_string(),
                        Producer::Node(other) => config.nodes[other].label(other),
                    };
                    return Err(GraphError::AlreadyExists(format!(
                        "stream {} is produced by both {} and {}",
                        output.name, previous, label
                    )));
                }
            }
            factories.push(factory);
        }

        let count = config.nodes.len();
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); count];
        let mut in_degree = vec![0usize; count];
        for (position, node) in config.nodes.iter().enumerate() {
            for input in &node.input_streams {
                match producers.get(&input.name) {
                    None => {
                        return Err(GraphError::NotFound(format!(
                            "input stream {} of {} has no producer",
                            input.name,
                            node.label(position)
                        )))
                    }
                    Some(Producer::Node(producer)) => {
                        dependents[*producer].push(position);
                        in_degree[position] += 1;
                    }
                    Some(Producer::GraphInput) => {}
                }
            }
        }
        for output in &config.output_streams {
            if !producers.contains_key(output) {
                return Err(GraphError::NotFound(format!(
                    "graph output stream {} has no producer",
                    output
                )));
            }
        }

        let mut ready: VecDeque<usize> = (0..count).filter(|i| in_degree[*i] == 0).collect();
        let mut order = Vec::with_capacity(count);
        while let Some(position) = ready.pop_front() {
            order.push(position);
            for &dependent in &dependents[position] {
                in_degree[dependent] -= 1;
                if in_degree[dependent] == 0 {
                    ready.push_back(dependent);
                }
            }
        }
        if order.len() != count {
            let stuck: Vec<String> = (0..count)
                .filter(|i| in_degree[*i] > 0)
                .map(|i| config.nodes[i].label(i))
                .collect();
            return Err(GraphError::InvalidArgument(format!(
                "graph contains a cycle through {}",
                stuck.join(", ")
            )));
        }

        let mut required_side_packets: BTreeSet<String> =
            config.input_side_packets.iter().cloned().collect();
        for node in &config.nodes {
            required_side_packets.extend(node.input_side_packets.iter().map(|s| s.name.clone()));
        }
        let gpu_required = factories.iter().any(|factory| factory.requires_gpu());

        debug!(
            "Validated graph: {} node(s), {} side packet(s), gpu {}",
            count,
            required_side_packets.len(),
            gpu_required
        );

        Ok(Self {
            config,
            order,
            required_side_packets,
            gpu_required,
            factories,
        })
    }

    pub fn config(&self) -> &GraphConfig {
        &self.config
    }

    /// Node positions such that every producer precedes its consumers
    pub fn topological_order(&self) -> &[usize] {
        &self.order
    }

    pub fn required_side_packets(&self) -> &BTreeSet<String> {
        &self.required_side_packets
    }

    pub fn gpu_required(&self) -> bool {
        self.gpu_required
    }

    pub(crate) fn factory(&self, position: usize) -> Option<&Arc<dyn CalculatorFactory>> {
        self.factories.get(position)
    }
}

impl fmt::Debug for ValidatedGraphConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ValidatedGraphConfig")
            .field("config", &self.config)
            .field("order", &self.order)
            .field("required_side_packets", &self.required_side_packets)
            .field("gpu_required", &self.gpu_required)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const FLIP_GRAPH: &str = r#"
        # Flips the camera image before display
        input_stream: "input_video"
        output_stream: "output_video"
        input_side_packet: "output_vertically_flipped"
        max_queue_size: 2

        node {
          calculator: "ImageTransformationCalculator"
          input_stream: "IMAGE:input_video"
          input_side_packet: "FLIP_VERTICALLY:output_vertically_flipped"
          output_stream: "IMAGE:flipped_video"
          node_options: {
            [type.googleapis.com/mediapipe.ImageTransformationCalculatorOptions] {
              rotation_mode: ROTATION_0
            }
          }
        }

        node {
          calculator: "PassThroughCalculator"
          input_stream: "flipped_video"
          output_stream: "output_video"
        }
    "#;

    fn validate(text: &str) -> GraphResult<ValidatedGraphConfig> {
        let config = GraphConfig::parse_text(text)?;
        ValidatedGraphConfig::initialize(config, &CalculatorRegistry::with_builtins())
    }

    #[test]
    fn test_stream_ref_forms() {
        let plain = StreamRef::parse("input_video").unwrap();
        assert_eq!((plain.tag.as_str(), plain.index, plain.name.as_str()), ("", 0, "input_video"));

        let tagged = StreamRef::parse("IMAGE:input_video").unwrap();
        assert_eq!(tagged.tag, "IMAGE");
        assert_eq!(tagged.to_string(), "IMAGE:input_video");

        let indexed = StreamRef::parse("LANDMARKS:1:pose").unwrap();
        assert_eq!(indexed.index, 1);
        assert_eq!(indexed.to_string(), "LANDMARKS:1:pose");

        assert!(StreamRef::parse("image:input").is_err());
        assert!(StreamRef::parse("IMAGE:").is_err());
        assert!(StreamRef::parse("A:1:b:c").is_err());
    }

    #[test]
    fn test_parse_graph() {
        let config = GraphConfig::parse_text(FLIP_GRAPH).unwrap();
        assert_eq!(config.input_streams, vec!["input_video"]);
        assert_eq!(config.output_streams, vec!["output_video"]);
        assert_eq!(config.max_queue_size, Some(2));
        assert_eq!(config.nodes.len(), 2);

        let flip = &config.nodes[0];
        assert_eq!(flip.input_by_tag("IMAGE").unwrap().name, "input_video");
        assert_eq!(flip.label(0), "ImageTransformationCalculator#0");
        assert_eq!(flip.options.fields().len(), 1);
    }

    #[test]
    fn test_validated_order_and_side_packets() {
        let validated = validate(FLIP_GRAPH).unwrap();
        assert_eq!(validated.topological_order(), &[0, 1]);
        assert!(validated.required_side_packets().contains("output_vertically_flipped"));
        assert!(!validated.gpu_required());
    }

    #[test]
    fn test_bundled_graph_validates() {
        let validated = validate(include_str!("../../graphs/pose_tracking_cpu.pbtxt")).unwrap();
        assert_eq!(validated.topological_order(), &[0, 1]);
        assert_eq!(validated.required_side_packets().len(), 6);
        assert_eq!(validated.config().nodes[1].label(1), "output_transform");
    }

    #[test]
    fn test_order_follows_dependencies_not_declaration() {
        let validated = validate(
            r#"
            input_stream: "a"
            output_stream: "c"
            node { calculator: "PassThroughCalculator" input_stream: "b" output_stream: "c" }
            node { calculator: "PassThroughCalculator" input_stream: "a" output_stream: "b" }
            "#,
        )
        .unwrap();
        assert_eq!(validated.topological_order(), &[1, 0]);
    }

    #[test]
    fn test_missing_producer() {
        let result = validate(
            r#"
            input_stream: "input_video"
            node {
              calculator: "PassThroughCalculator"
              input_stream: "nowhere"
              output_stream: "out"
            }
            "#,
        );
        assert!(matches!(result, Err(GraphError::NotFound(msg)) if msg.contains("nowhere")));
    }

    #[test]
    fn test_unknown_calculator() {
        let result = validate(
            r#"
            input_stream: "in"
            node { calculator: "PoseLandmarkCpu" input_stream: "in" output_stream: "out" }
            "#,
        );
        assert!(matches!(
            result,
            Err(GraphError::NotFound(msg)) if msg.contains("PoseLandmarkCpu")
        ));
    }

    #[test]
    fn test_duplicate_producer() {
        let result = validate(
            r#"
            input_stream: "in"
            node { calculator: "PassThroughCalculator" input_stream: "in" output_stream: "out" }
            node {
              name: "second"
              calculator: "PassThroughCalculator"
              input_stream: "in"
              output_stream: "out"
            }
            "#,
        );
        assert!(matches!(result, Err(GraphError::AlreadyExists(msg)) if msg.contains("second")));
    }

    #[test]
    fn test_cycle_is_rejected() {
        let result = validate(
            r#"
            input_stream: "in"
            node {
              name: "left"
              calculator: "PassThroughCalculator"
              input_stream: "b"
              output_stream: "a"
            }
            node {
              name: "right"
              calculator: "PassThroughCalculator"
              input_stream: "a"
              output_stream: "b"
            }
            "#,
        );
        assert!(matches!(result, Err(GraphError::InvalidArgument(msg)) if msg.contains("cycle")));
    }

    #[test]
    fn test_calculator_contract_failure_names_node() {
        let result = validate(
            r#"
            input_stream: "in"
            node {
              name: "flip"
              calculator: "ImageTransformationCalculator"
              input_stream: "in"
              output_stream: "out"
            }
            "#,
        );
        assert!(matches!(result, Err(GraphError::Calculator { node, .. }) if node == "flip"));
    }

    #[test]
    fn test_unknown_node_field() {
        let result = GraphConfig::parse_text(
            r#"node { calculator: "PassThroughCalculator" colour: "blue" }"#,
        );
        assert!(matches!(result, Err(GraphError::InvalidArgument(msg)) if msg.contains("colour")));
    }

    #[test]
    fn test_syntax_error_propagates() {
        let result = GraphConfig::parse_text("node { calculator: }");
        assert!(matches!(result, Err(GraphError::Parse { .. })));
    }
}
