// Calculator graph runtime
//
// Packets pushed into graph input streams are queued to an executor task that
// runs every node in dependency order for each timestamp. Output streams are
// observed through pollers that never block.

use crate::core::calculator::{Calculator, CalculatorContext};
use crate::core::gpu::GpuResources;
use crate::core::graph_config::ValidatedGraphConfig;
use crate::models::graph::{GraphError, GraphResult, Packet, SidePacket, Timestamp};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

/// Input queue capacity when the graph does not set `max_queue_size`
pub const DEFAULT_MAX_QUEUE_SIZE: usize = 100;
const QUEUE_SIZE_LIMIT: usize = 1 << 16;

type InputEvent = (String, Packet);
type PollerSenders = HashMap<String, Vec<mpsc::UnboundedSender<Packet>>>;

struct NodeRuntime {
    label: String,
    inputs: Vec<String>,
    outputs: Vec<String>,
    calculator: Box<dyn Calculator>,
}

#[derive(Debug, Default)]
struct InputStreamState {
    last_timestamp: Option<Timestamp>,
    closed: bool,
}

enum RunState {
    Idle,
    Running {
        /// Dropped once every input stream is closed
        sender: Option<mpsc::Sender<InputEvent>>,
        executor: JoinHandle<GraphResult<()>>,
    },
    Finished,
}

/// First error raised by the run, shared with the executor
#[derive(Clone, Default)]
struct ErrorSlot(Arc<Mutex<Option<GraphError>>>);

impl ErrorSlot {
    fn record(&self, error: GraphError) {
        if let Ok(mut slot) = self.0.lock() {
            if slot.is_none() {
                *slot = Some(error);
            }
        }
    }

    fn get(&self) -> Option<GraphError> {
        self.0.lock().ok().and_then(|slot| slot.clone())
    }
}

fn calculator_error(label: &str, error: GraphError) -> GraphError {
    match error {
        GraphError::Calculator { .. } => error,
        other => GraphError::Calculator {
            node: label.to_string(),
            message: other.to_string(),
        },
    }
}

/// A runnable instance of a validated graph
pub struct CalculatorGraph {
    run_id: Uuid,
    order: Vec<usize>,
    required_side_packets: BTreeSet<String>,
    gpu_required: bool,
    output_streams: Vec<String>,
    max_queue_size: usize,
    nodes: Vec<NodeRuntime>,
    gpu: Option<GpuResources>,
    pollers: PollerSenders,
    inputs: HashMap<String, InputStreamState>,
    state: RunState,
    errors: ErrorSlot,
}

impl CalculatorGraph {
    /// Instantiate every calculator of `validated`
    pub fn new(validated: &ValidatedGraphConfig) -> GraphResult<Self> {
        let config = validated.config();

        let mut nodes = Vec::with_capacity(config.nodes.len());
        for (position, node) in config.nodes.iter().enumerate() {
            let label = node.label(position);
            let factory = validated.factory(position).ok_or_else(|| {
                GraphError::Internal(format!("no factory recorded for {}", label))
            })?;
            let calculator = factory
                .create(node)
                .map_err(|e| calculator_error(&label, e))?;
            nodes.push(NodeRuntime {
                inputs: node.input_streams.iter().map(|s| s.name.clone()).collect(),
                outputs: node.output_streams.iter().map(|s| s.name.clone()).collect(),
                label,
                calculator,
            });
        }

        let graph = Self {
            run_id: Uuid::new_v4(),
            order: validated.topological_order().to_vec(),
            required_side_packets: validated.required_side_packets().clone(),
            gpu_required: validated.gpu_required(),
            output_streams: config.output_streams.clone(),
            max_queue_size: queue_capacity(config.max_queue_size),
            nodes,
            gpu: None,
            pollers: HashMap::new(),
            inputs: config
                .input_streams
                .iter()
                .map(|name| (name.clone(), InputStreamState::default()))
                .collect(),
            state: RunState::Idle,
            errors: ErrorSlot::default(),
        };
        debug!("Created graph run {} with {} node(s)", graph.run_id, graph.nodes.len());
        Ok(graph)
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    /// Packets the input queue holds before `add_packet_to_input_stream` refuses more
    pub fn max_queue_size(&self) -> usize {
        self.max_queue_size
    }

    /// Bind GPU resources; only allowed before the run starts
    pub fn set_gpu_resources(&mut self, resources: GpuResources) -> GraphResult<()> {
        if !matches!(self.state, RunState::Idle) {
            return Err(GraphError::FailedPrecondition(
                "GPU resources must be bound before the run starts".to_string(),
            ));
        }
        if !resources.is_alive() {
            return Err(GraphError::FailedPrecondition(
                "GPU resources were already shut down".to_string(),
            ));
        }
        self.gpu = Some(resources);
        Ok(())
    }

    /// Observe a graph output stream; only allowed before the run starts
    pub fn add_output_stream_poller(&mut self, stream: &str) -> GraphResult<OutputStreamPoller> {
        if !matches!(self.state, RunState::Idle) {
            return Err(GraphError::FailedPrecondition(
                "pollers must be added before the run starts".to_string(),
            ));
        }
        if !self.output_streams.iter().any(|name| name == stream) {
            return Err(GraphError::NotFound(format!(
                "{} is not a graph output stream",
                stream
            )));
        }

        let (sender, receiver) = mpsc::unbounded_channel();
        self.pollers.entry(stream.to_string()).or_default().push(sender);
        Ok(OutputStreamPoller {
            stream: stream.to_string(),
            receiver,
        })
    }

    /// Open every calculator with `side_packets` and start accepting packets
    pub fn start_run(&mut self, side_packets: SidePacket) -> GraphResult<()> {
        if !matches!(self.state, RunState::Idle) {
            return Err(GraphError::FailedPrecondition(
                "graph has already been started".to_string(),
            ));
        }

        let missing: Vec<&str> = self
            .required_side_packets
            .iter()
            .filter(|name| !side_packets.contains(name))
            .map(String::as_str)
            .collect();
        if !missing.is_empty() {
            return Err(GraphError::InvalidArgument(format!(
                "missing required input side packets: {}",
                missing.join(", ")
            )));
        }

        match &self.gpu {
            Some(gpu) if !gpu.is_alive() => {
                return Err(GraphError::FailedPrecondition(
                    "bound GPU resources were shut down".to_string(),
                ))
            }
            None if self.gpu_required => {
                return Err(GraphError::FailedPrecondition(
                    "graph uses GPU calculators but no GPU resources are bound".to_string(),
                ))
            }
            _ => {}
        }

        let runtime = tokio::runtime::Handle::try_current().map_err(|_| {
            GraphError::FailedPrecondition("graph runs need a tokio runtime".to_string())
        })?;

        for &position in &self.order {
            let node = &mut self.nodes[position];
            node.calculator
                .open(&side_packets, self.gpu.as_ref())
                .map_err(|e| calculator_error(&node.label, e))?;
        }

        let (sender, receiver) = mpsc::channel(self.max_queue_size);
        let executor = Executor {
            order: self.order.clone(),
            nodes: std::mem::take(&mut self.nodes),
            gpu: self.gpu.clone(),
            pollers: std::mem::take(&mut self.pollers),
            errors: self.errors.clone(),
        };
        let handle = runtime.spawn(executor.run(receiver));

        self.state = RunState::Running {
            sender: Some(sender),
            executor: handle,
        };
        info!(
            "Graph run {} started with {} side packet(s)",
            self.run_id,
            side_packets.len()
        );
        Ok(())
    }

    /// Queue `packet` on a graph input stream without waiting for it to be processed.
    ///
    /// Fails with `GraphError::Unavailable` when `max_queue_size` packets are
    /// already waiting; the packet is dropped and the stream's timestamp is unchanged.
    pub fn add_packet_to_input_stream(&mut self, stream: &str, packet: Packet) -> GraphResult<()> {
        if let Some(error) = self.errors.get() {
            return Err(error);
        }

        let sender = match &self.state {
            RunState::Running {
                sender: Some(sender),
                ..
            } => sender,
            _ => {
                return Err(GraphError::FailedPrecondition(
                    "graph is not accepting packets".to_string(),
                ))
            }
        };

        let input = self.inputs.get_mut(stream).ok_or_else(|| {
            GraphError::NotFound(format!("{} is not a graph input stream", stream))
        })?;
        if input.closed {
            return Err(GraphError::FailedPrecondition(format!(
                "input stream {} is closed",
                stream
            )));
        }

        let timestamp = packet.timestamp();
        if let Some(last) = input.last_timestamp {
            if timestamp <= last {
                return Err(GraphError::InvalidArgument(format!(
                    "timestamp {} on stream {} is not greater than the previous {}",
                    timestamp, stream, last
                )));
            }
        }

        match sender.try_send((stream.to_string(), packet)) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                return Err(GraphError::Unavailable(format!(
                    "input queue is full ({} packets) at {} on {}",
                    self.max_queue_size, timestamp, stream
                )))
            }
            Err(TrySendError::Closed(_)) => {
                return Err(self
                    .errors
                    .get()
                    .unwrap_or_else(|| GraphError::Internal("graph executor stopped".to_string())))
            }
        }
        input.last_timestamp = Some(timestamp);
        trace!("Queued packet at {} on {}", timestamp, stream);
        Ok(())
    }

    /// Signal that no more packets will arrive on `stream`
    pub fn close_input_stream(&mut self, stream: &str) -> GraphResult<()> {
        if !matches!(self.state, RunState::Running { .. }) {
            return Err(GraphError::FailedPrecondition(
                "graph is not running".to_string(),
            ));
        }

        let input = self.inputs.get_mut(stream).ok_or_else(|| {
            GraphError::NotFound(format!("{} is not a graph input stream", stream))
        })?;
        if input.closed {
            return Ok(());
        }
        input.closed = true;
        debug!("Closed input stream {}", stream);

        if self.inputs.values().all(|input| input.closed) {
            if let RunState::Running { sender, .. } = &mut self.state {
                sender.take();
            }
        }
        Ok(())
    }

    pub fn close_all_input_streams(&mut self) -> GraphResult<()> {
        let names: Vec<String> = self.inputs.keys().cloned().collect();
        for name in names {
            self.close_input_stream(&name)?;
        }
        Ok(())
    }

    /// Wait for every queued packet to be processed and the calculators closed.
    ///
    /// All input streams must be closed first. Returns the first error the run hit.
    pub async fn wait_until_done(&mut self) -> GraphResult<()> {
        match std::mem::replace(&mut self.state, RunState::Finished) {
            RunState::Idle => {
                self.state = RunState::Idle;
                Ok(())
            }
            RunState::Finished => match self.errors.get() {
                Some(error) => Err(error),
                None => Ok(()),
            },
            RunState::Running { sender, executor } => {
                if sender.is_some() {
                    self.state = RunState::Running { sender, executor };
                    return Err(GraphError::FailedPrecondition(
                        "input streams must be closed before waiting for the graph".to_string(),
                    ));
                }

                let result = match executor.await {
                    Ok(result) => result,
                    Err(e) => Err(GraphError::Internal(format!("graph executor failed: {}", e))),
                };
                if let Err(e) = &result {
                    self.errors.record(e.clone());
                }
                info!("Graph run {} finished", self.run_id);
                result
            }
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(self.state, RunState::Running { .. })
    }

    /// First error the run reported, if any
    pub fn error(&self) -> Option<GraphError> {
        self.errors.get()
    }

    /// Release the graph and everything it holds
    pub fn dispose(self) {
        info!("Disposing graph run {}", self.run_id);
    }
}

/// Non-positive or missing sizes fall back to the default
fn queue_capacity(max_queue_size: Option<i64>) -> usize {
    match max_queue_size {
        Some(size) if size > 0 => usize::try_from(size)
            .unwrap_or(QUEUE_SIZE_LIMIT)
            .min(QUEUE_SIZE_LIMIT),
        _ => DEFAULT_MAX_QUEUE_SIZE,
    }
}

impl Drop for CalculatorGraph {
    fn drop(&mut self) {
        if let RunState::Running { executor, .. } = &self.state {
            warn!("Graph run {} dropped while running; aborting", self.run_id);
            executor.abort();
        }
    }
}

// ==============================================================================
// Executor
// ==============================================================================

struct Executor {
    order: Vec<usize>,
    nodes: Vec<NodeRuntime>,
    gpu: Option<GpuResources>,
    pollers: PollerSenders,
    errors: ErrorSlot,
}

fn deliver(pollers: &PollerSenders, stream: &str, packet: &Packet) {
    if let Some(senders) = pollers.get(stream) {
        for sender in senders {
            // A dropped poller just stops observing
            let _ = sender.send(packet.clone());
        }
    }
}

impl Executor {
    async fn run(mut self, mut receiver: mpsc::Receiver<InputEvent>) -> GraphResult<()> {
        while let Some((stream, packet)) = receiver.recv().await {
            if let Err(e) = self.propagate(stream, packet) {
                error!("Graph execution failed: {}", e);
                self.errors.record(e);
                break;
            }
        }
        receiver.close();

        for &position in &self.order {
            let node = &mut self.nodes[position];
            if let Err(e) = node.calculator.close() {
                self.errors.record(calculator_error(&node.label, e));
            }
        }

        match self.errors.get() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn propagate(&mut self, stream: String, packet: Packet) -> GraphResult<()> {
        let timestamp = packet.timestamp();
        let mut available: HashMap<String, Packet> = HashMap::new();
        deliver(&self.pollers, &stream, &packet);
        available.insert(stream, packet);

        for &position in &self.order {
            let node = &mut self.nodes[position];
            let inputs: Vec<Option<Packet>> = node
                .inputs
                .iter()
                .map(|name| available.get(name).cloned())
                .collect();
            if inputs.iter().all(Option::is_none) {
                continue;
            }

            let mut cc =
                CalculatorContext::new(timestamp, &inputs, node.outputs.len(), self.gpu.as_ref());
            node.calculator
                .process(&mut cc)
                .map_err(|e| calculator_error(&node.label, e))?;

            for (name, output) in node.outputs.iter().zip(cc.into_outputs()) {
                if let Some(output) = output {
                    deliver(&self.pollers, name, &output);
                    available.insert(name.clone(), output);
                }
            }
        }
        Ok(())
    }
}

/// Non-blocking reader of one graph output stream
pub struct OutputStreamPoller {
    stream: String,
    receiver: mpsc::UnboundedReceiver<Packet>,
}

impl OutputStreamPoller {
    pub fn stream_name(&self) -> &str {
        &self.stream
    }

    /// Next available packet, or `None` when nothing is ready yet
    pub fn try_get_next(&mut self) -> Option<Packet> {
        self.receiver.try_recv().ok()
    }

    /// Wait for the next packet; `None` once the run has finished
    pub async fn next(&mut self) -> Option<Packet> {
        self.receiver.recv().await
    }
}
