// Data models for camera capture, image frames, graph packets and pose options

pub mod camera;
pub mod frame;
pub mod graph;
pub mod pose;
