// Calculator abstraction and the built-in image calculators
// Hosts plug inference calculators (pose detection, landmarks) in through the registry

use crate::core::gpu::GpuResources;
use crate::core::graph_config::{NodeConfig, StreamRef};
use crate::core::text_format::{TextMessage, TextValue};
use crate::models::frame::{ImageFormat, ImageFrame};
use crate::models::graph::{GraphError, GraphResult, Packet, PacketData, SidePacket, Timestamp};
use image::{imageops, ImageBuffer, Luma, Pixel, Rgb, Rgba};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

// ==============================================================================
// Calculator contract
// ==============================================================================

/// Inputs and outputs of one `process` call
pub struct CalculatorContext<'a> {
    timestamp: Timestamp,
    inputs: &'a [Option<Packet>],
    outputs: Vec<Option<Packet>>,
    gpu: Option<&'a GpuResources>,
}

impl<'a> CalculatorContext<'a> {
    pub(crate) fn new(
        timestamp: Timestamp,
        inputs: &'a [Option<Packet>],
        output_count: usize,
        gpu: Option<&'a GpuResources>,
    ) -> Self {
        Self {
            timestamp,
            inputs,
            outputs: vec![None; output_count],
            gpu,
        }
    }

    /// Timestamp of the packets being processed
    pub fn timestamp(&self) -> Timestamp {
        self.timestamp
    }

    /// Packet on input `index`, if one arrived at this timestamp
    pub fn input(&self, index: usize) -> Option<&Packet> {
        self.inputs.get(index).and_then(Option::as_ref)
    }

    pub fn input_count(&self) -> usize {
        self.inputs.len()
    }

    /// Emit `data` on output `index` at the current timestamp
    pub fn output(&mut self, index: usize, data: PacketData) -> GraphResult<()> {
        let packet = Packet::new(data, self.timestamp);
        self.set_output(index, packet)
    }

    /// Emit an existing packet's payload on output `index`
    pub fn forward(&mut self, index: usize, packet: &Packet) -> GraphResult<()> {
        let packet = packet.at(self.timestamp);
        self.set_output(index, packet)
    }

    fn set_output(&mut self, index: usize, packet: Packet) -> GraphResult<()> {
        let count = self.outputs.len();
        let slot = self.outputs.get_mut(index).ok_or_else(|| {
            GraphError::InvalidArgument(format!(
                "output index {} out of range ({} outputs)",
                index, count
            ))
        })?;
        *slot = Some(packet);
        Ok(())
    }

    pub fn gpu(&self) -> Option<&GpuResources> {
        self.gpu
    }

    pub(crate) fn into_outputs(self) -> Vec<Option<Packet>> {
        self.outputs
    }
}

/// A node of the dataflow graph
pub trait Calculator: Send {
    /// Called once when the run starts, before any packet
    fn open(&mut self, _side_packets: &SidePacket, _gpu: Option<&GpuResources>) -> GraphResult<()> {
        Ok(())
    }

    /// Called for every timestamp at which at least one input has a packet
    fn process(&mut self, cc: &mut CalculatorContext<'_>) -> GraphResult<()>;

    /// Called once after the last packet
    fn close(&mut self) -> GraphResult<()> {
        Ok(())
    }
}

/// Validates node declarations and builds calculators for them
pub trait CalculatorFactory: Send + Sync {
    /// Check the node's streams, side packets and options
    fn validate(&self, _node: &NodeConfig) -> GraphResult<()> {
        Ok(())
    }

    /// Whether the calculator needs GPU resources bound to the graph
    fn requires_gpu(&self) -> bool {
        false
    }

    fn create(&self, node: &NodeConfig) -> GraphResult<Box<dyn Calculator>>;
}

/// Calculator factories by calculator name
#[derive(Clone, Default)]
pub struct CalculatorRegistry {
    factories: HashMap<String, Arc<dyn CalculatorFactory>>,
}

impl CalculatorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the built-in calculators
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("PassThroughCalculator", PassThroughCalculatorFactory);
        registry.register("ImageTransformationCalculator", ImageTransformationCalculatorFactory);
        registry
    }

    /// Register `factory` under `name`, returning the factory it replaced
    pub fn register(
        &mut self,
        name: impl Into<String>,
        factory: impl CalculatorFactory + 'static,
    ) -> Option<Arc<dyn CalculatorFactory>> {
        self.factories.insert(name.into(), Arc::new(factory))
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn CalculatorFactory>> {
        self.factories.get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    /// Registered calculator names, sorted
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.factories.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl fmt::Debug for CalculatorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CalculatorRegistry")
            .field("calculators", &self.names())
            .finish()
    }
}

/// Options message of type `type_name` inside a node's options,
/// e.g. `[mediapipe.ImageTransformationCalculatorOptions.ext] { ... }`
pub fn find_options<'a>(options: &'a TextMessage, type_name: &str) -> Option<&'a TextMessage> {
    options.fields().iter().find_map(|(name, value)| {
        let is_extension = name.starts_with('[') && name.ends_with(']');
        if is_extension && name.contains(type_name) {
            value.as_message()
        } else {
            None
        }
    })
}

// ==============================================================================
// PassThroughCalculator
// ==============================================================================

/// Forwards input `i` to output `i` unchanged
pub struct PassThroughCalculator;

impl Calculator for PassThroughCalculator {
    fn process(&mut self, cc: &mut CalculatorContext<'_>) -> GraphResult<()> {
        for index in 0..cc.input_count() {
            if let Some(packet) = cc.input(index).cloned() {
                cc.forward(index, &packet)?;
            }
        }
        Ok(())
    }
}

struct PassThroughCalculatorFactory;

impl CalculatorFactory for PassThroughCalculatorFactory {
    fn validate(&self, node: &NodeConfig) -> GraphResult<()> {
        if node.input_streams.is_empty() || node.input_streams.len() != node.output_streams.len() {
            return Err(GraphError::InvalidArgument(format!(
                "PassThroughCalculator needs matching input and output streams, got {} and {}",
                node.input_streams.len(),
                node.output_streams.len()
            )));
        }
        Ok(())
    }

    fn create(&self, _node: &NodeConfig) -> GraphResult<Box<dyn Calculator>> {
        Ok(Box::new(PassThroughCalculator))
    }
}

// ==============================================================================
// ImageTransformationCalculator
// ==============================================================================

const IMAGE_TAG: &str = "IMAGE";
const ROTATION_DEGREES_TAG: &str = "ROTATION_DEGREES";
const FLIP_HORIZONTALLY_TAG: &str = "FLIP_HORIZONTALLY";
const FLIP_VERTICALLY_TAG: &str = "FLIP_VERTICALLY";
const TRANSFORMATION_OPTIONS: &str = "ImageTransformationCalculatorOptions";

/// Counterclockwise rotation in quarter turns
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Rotation {
    #[default]
    Rotate0,
    Rotate90,
    Rotate180,
    Rotate270,
}

impl Rotation {
    pub fn from_degrees(degrees: i64) -> Option<Self> {
        match degrees.rem_euclid(360) {
            0 => Some(Rotation::Rotate0),
            90 => Some(Rotation::Rotate90),
            180 => Some(Rotation::Rotate180),
            270 => Some(Rotation::Rotate270),
            _ => None,
        }
    }

    /// Parse a `rotation_mode` enum value such as `ROTATION_90`
    pub fn from_mode(mode: &str) -> Option<Self> {
        match mode {
            "UNKNOWN" | "ROTATION_0" => Some(Rotation::Rotate0),
            "ROTATION_90" => Some(Rotation::Rotate90),
            "ROTATION_180" => Some(Rotation::Rotate180),
            "ROTATION_270" => Some(Rotation::Rotate270),
            _ => None,
        }
    }
}

/// Rotate counterclockwise, then flip
pub fn transform_frame(
    frame: &ImageFrame,
    rotation: Rotation,
    flip_horizontally: bool,
    flip_vertically: bool,
) -> GraphResult<ImageFrame> {
    match frame.format() {
        ImageFormat::Srgba => {
            transform_pixels::<Rgba<u8>>(frame, rotation, flip_horizontally, flip_vertically)
        }
        ImageFormat::Srgb => {
            transform_pixels::<Rgb<u8>>(frame, rotation, flip_horizontally, flip_vertically)
        }
        ImageFormat::Gray8 => {
            transform_pixels::<Luma<u8>>(frame, rotation, flip_horizontally, flip_vertically)
        }
    }
}

fn transform_pixels<P>(
    frame: &ImageFrame,
    rotation: Rotation,
    flip_horizontally: bool,
    flip_vertically: bool,
) -> GraphResult<ImageFrame>
where
    P: Pixel<Subpixel = u8> + 'static,
{
    // Drop row padding so the buffer is tightly packed
    let packed: Vec<u8> = (0..frame.height())
        .flat_map(|y| frame.row(y).iter().copied())
        .collect();
    let buffer = ImageBuffer::<P, Vec<u8>>::from_raw(frame.width(), frame.height(), packed)
        .ok_or_else(|| GraphError::Internal("frame does not fill its image buffer".to_string()))?;

    // imageops rotates clockwise
    let mut rotated = match rotation {
        Rotation::Rotate0 => buffer,
        Rotation::Rotate90 => imageops::rotate270(&buffer),
        Rotation::Rotate180 => imageops::rotate180(&buffer),
        Rotation::Rotate270 => imageops::rotate90(&buffer),
    };
    if flip_horizontally {
        imageops::flip_horizontal_in_place(&mut rotated);
    }
    if flip_vertically {
        imageops::flip_vertical_in_place(&mut rotated);
    }

    let (width, height) = rotated.dimensions();
    let row_bytes = width as usize * frame.format().bytes_per_pixel();
    ImageFrame::new(frame.format(), width, height, row_bytes, rotated.into_raw())
        .map_err(|e| GraphError::Internal(e.to_string()))
}

/// Rotates and flips IMAGE frames.
///
/// Settings come from `ImageTransformationCalculatorOptions` and are
/// overridden by the ROTATION_DEGREES, FLIP_HORIZONTALLY and
/// FLIP_VERTICALLY side packets when the node declares them.
pub struct ImageTransformationCalculator {
    rotation: Rotation,
    flip_horizontally: bool,
    flip_vertically: bool,
    side_packet_names: HashMap<String, String>,
}

impl ImageTransformationCalculator {
    fn from_node(node: &NodeConfig) -> GraphResult<Self> {
        let mut calculator = Self {
            rotation: Rotation::Rotate0,
            flip_horizontally: false,
            flip_vertically: false,
            side_packet_names: node
                .input_side_packets
                .iter()
                .map(|side| (side.tag.clone(), side.name.clone()))
                .collect(),
        };

        let Some(options) = find_options(&node.options, TRANSFORMATION_OPTIONS) else {
            return Ok(calculator);
        };

        if let Some(mode) = options.get("rotation_mode") {
            let parsed = match mode {
                TextValue::Ident(name) => Rotation::from_mode(name),
                TextValue::Int(value) => match value {
                    0 | 1 => Some(Rotation::Rotate0),
                    2 => Some(Rotation::Rotate90),
                    3 => Some(Rotation::Rotate180),
                    4 => Some(Rotation::Rotate270),
                    _ => None,
                },
                _ => None,
            };
            calculator.rotation = parsed.ok_or_else(|| {
                GraphError::InvalidArgument(format!("invalid rotation_mode {:?}", mode))
            })?;
        }
        calculator.flip_horizontally = bool_option(options, "flip_horizontally")?;
        calculator.flip_vertically = bool_option(options, "flip_vertically")?;

        Ok(calculator)
    }
}

fn bool_option(options: &TextMessage, name: &str) -> GraphResult<bool> {
    match options.get(name) {
        None => Ok(false),
        Some(value) => value
            .as_bool()
            .ok_or_else(|| GraphError::InvalidArgument(format!("{} must be a boolean", name))),
    }
}

impl Calculator for ImageTransformationCalculator {
    fn open(&mut self, side_packets: &SidePacket, _gpu: Option<&GpuResources>) -> GraphResult<()> {
        if let Some(name) = self.side_packet_names.get(ROTATION_DEGREES_TAG) {
            let degrees = side_packets.get_int(name).ok_or_else(|| {
                GraphError::InvalidArgument(format!("side packet {} must be an int", name))
            })?;
            self.rotation = Rotation::from_degrees(degrees).ok_or_else(|| {
                GraphError::InvalidArgument(format!("unsupported rotation {} degrees", degrees))
            })?;
        }
        if let Some(name) = self.side_packet_names.get(FLIP_HORIZONTALLY_TAG) {
            self.flip_horizontally = side_packets.get_bool(name).ok_or_else(|| {
                GraphError::InvalidArgument(format!("side packet {} must be a bool", name))
            })?;
        }
        if let Some(name) = self.side_packet_names.get(FLIP_VERTICALLY_TAG) {
            self.flip_vertically = side_packets.get_bool(name).ok_or_else(|| {
                GraphError::InvalidArgument(format!("side packet {} must be a bool", name))
            })?;
        }
        Ok(())
    }

    fn process(&mut self, cc: &mut CalculatorContext<'_>) -> GraphResult<()> {
        let Some(packet) = cc.input(0) else {
            return Ok(());
        };
        let frame = packet.as_image_frame().ok_or_else(|| {
            GraphError::InvalidArgument(format!(
                "IMAGE expects an ImageFrame, got {}",
                packet.data().type_name()
            ))
        })?;

        if self.rotation == Rotation::Rotate0 && !self.flip_horizontally && !self.flip_vertically {
            let packet = packet.clone();
            return cc.forward(0, &packet);
        }

        let transformed = transform_frame(
            frame,
            self.rotation,
            self.flip_horizontally,
            self.flip_vertically,
        )?;
        cc.output(0, PacketData::Image(transformed))
    }
}

struct ImageTransformationCalculatorFactory;

fn is_single_image(streams: &[StreamRef]) -> bool {
    streams.len() == 1 && streams[0].tag == IMAGE_TAG
}

impl CalculatorFactory for ImageTransformationCalculatorFactory {
    fn validate(&self, node: &NodeConfig) -> GraphResult<()> {
        if !is_single_image(&node.input_streams) || !is_single_image(&node.output_streams) {
            return Err(GraphError::InvalidArgument(
                "ImageTransformationCalculator needs exactly one IMAGE input and one IMAGE output"
                    .to_string(),
            ));
        }

        for side in &node.input_side_packets {
            let known = [ROTATION_DEGREES_TAG, FLIP_HORIZONTALLY_TAG, FLIP_VERTICALLY_TAG];
            if !known.contains(&side.tag.as_str()) {
                return Err(GraphError::InvalidArgument(format!(
                    "ImageTransformationCalculator does not accept side packet tag {:?}",
                    side.tag
                )));
            }
        }

        // Surface option errors at validation time
        ImageTransformationCalculator::from_node(node).map(|_| ())
    }

    fn create(&self, node: &NodeConfig) -> GraphResult<Box<dyn Calculator>> {
        Ok(Box::new(ImageTransformationCalculator::from_node(node)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // 2x1 frame: A B
    fn two_pixels() -> ImageFrame {
        ImageFrame::from_rgba(2, 1, vec![1, 1, 1, 1, 2, 2, 2, 2]).unwrap()
    }

    fn pixels(frame: &ImageFrame) -> Vec<u8> {
        let mut out = vec![0; frame.width() as usize * frame.height() as usize * 4];
        assert!(frame.read_pixel_data(frame.width(), frame.height(), &mut out));
        out.chunks_exact(4).map(|p| p[0]).collect()
    }

    #[test]
    fn test_rotations() {
        let frame = two_pixels();

        let rotated = transform_frame(&frame, Rotation::Rotate90, false, false).unwrap();
        assert_eq!((rotated.width(), rotated.height()), (1, 2));
        assert_eq!(pixels(&rotated), vec![2, 1], "Right side moves to the top");

        let rotated = transform_frame(&frame, Rotation::Rotate180, false, false).unwrap();
        assert_eq!(pixels(&rotated), vec![2, 1]);

        let rotated = transform_frame(&frame, Rotation::Rotate270, false, false).unwrap();
        assert_eq!((rotated.width(), rotated.height()), (1, 2));
        assert_eq!(pixels(&rotated), vec![1, 2]);
    }

    #[test]
    fn test_flips() {
        // 1x2 frame: A over B
        let frame = ImageFrame::from_rgba(1, 2, vec![1, 1, 1, 1, 2, 2, 2, 2]).unwrap();

        let flipped = transform_frame(&frame, Rotation::Rotate0, false, true).unwrap();
        assert_eq!(pixels(&flipped), vec![2, 1]);

        let flipped = transform_frame(&frame, Rotation::Rotate0, true, false).unwrap();
        assert_eq!(pixels(&flipped), vec![1, 2], "Single column is unchanged by a horizontal flip");
    }

    #[test]
    fn test_padded_rgb_rotate_and_flip() {
        // 3x2 RGB, first channel numbers the pixels, 2 bytes of padding per row
        //   0 1 2
        //   3 4 5
        let mut data = Vec::new();
        for row in [[0u8, 1, 2], [3, 4, 5]] {
            for value in row {
                data.extend_from_slice(&[value, 0, 0]);
            }
            data.extend_from_slice(&[0xEE, 0xEE]);
        }
        let frame = ImageFrame::new(ImageFormat::Srgb, 3, 2, 11, data).unwrap();

        let first_channel = |frame: &ImageFrame| -> Vec<u8> {
            let mut values = Vec::new();
            for y in 0..frame.height() {
                for x in 0..frame.width() {
                    values.push(frame.pixel(x, y)[0]);
                }
            }
            values
        };

        let rotated = transform_frame(&frame, Rotation::Rotate90, false, false).unwrap();
        assert_eq!((rotated.width(), rotated.height()), (2, 3));
        assert_eq!(rotated.width_step(), 6);
        assert_eq!(first_channel(&rotated), vec![2, 5, 1, 4, 0, 3]);

        // Flips apply to the rotated image
        let turned = transform_frame(&frame, Rotation::Rotate270, true, false).unwrap();
        assert_eq!(first_channel(&turned), vec![0, 3, 1, 4, 2, 5]);

        let gray = ImageFrame::new(ImageFormat::Gray8, 2, 1, 2, vec![10, 20]).unwrap();
        let flipped = transform_frame(&gray, Rotation::Rotate180, false, true).unwrap();
        assert_eq!(flipped.data(), &[20, 10]);
    }

    #[test]
    fn test_rotation_parsing() {
        assert_eq!(Rotation::from_degrees(-90), Some(Rotation::Rotate270));
        assert_eq!(Rotation::from_degrees(450), Some(Rotation::Rotate90));
        assert_eq!(Rotation::from_degrees(45), None);
        assert_eq!(Rotation::from_mode("ROTATION_180"), Some(Rotation::Rotate180));
        assert_eq!(Rotation::from_mode("SIDEWAYS"), None);
    }

    #[test]
    fn test_transformation_side_packets_override_options() {
        let node = NodeConfig {
            calculator: "ImageTransformationCalculator".to_string(),
            input_streams: vec![StreamRef::parse("IMAGE:input_video").unwrap()],
            output_streams: vec![StreamRef::parse("IMAGE:output_video").unwrap()],
            input_side_packets: vec![
                StreamRef::parse("FLIP_VERTICALLY:output_vertically_flipped").unwrap(),
            ],
            ..Default::default()
        };
        ImageTransformationCalculatorFactory.validate(&node).unwrap();

        let mut calculator = ImageTransformationCalculator::from_node(&node).unwrap();
        let mut side_packets = SidePacket::new();
        side_packets.emplace("output_vertically_flipped", PacketData::Bool(true));
        calculator.open(&side_packets, None).unwrap();

        let frame = ImageFrame::from_rgba(1, 2, vec![1, 1, 1, 1, 2, 2, 2, 2]).unwrap();
        let inputs = vec![Some(Packet::image(frame, Timestamp::from_micros(5)))];
        let mut cc = CalculatorContext::new(Timestamp::from_micros(5), &inputs, 1, None);
        calculator.process(&mut cc).unwrap();

        let outputs = cc.into_outputs();
        let output = outputs[0].as_ref().expect("Frame should be emitted");
        assert_eq!(output.timestamp().micros(), 5);
        assert_eq!(pixels(output.as_image_frame().unwrap()), vec![2, 1]);
    }

    #[test]
    fn test_pass_through_contract() {
        let node = NodeConfig {
            calculator: "PassThroughCalculator".to_string(),
            input_streams: vec![StreamRef::parse("a").unwrap(), StreamRef::parse("b").unwrap()],
            output_streams: vec![StreamRef::parse("c").unwrap()],
            ..Default::default()
        };
        assert!(matches!(
            PassThroughCalculatorFactory.validate(&node),
            Err(GraphError::InvalidArgument(_))
        ));
    }

    #[test]
    fn test_registry_builtins() {
        let registry = CalculatorRegistry::with_builtins();
        assert_eq!(
            registry.names(),
            vec!["ImageTransformationCalculator", "PassThroughCalculator"]
        );
        assert!(registry.get("PoseLandmarkCpu").is_none());
    }
}
