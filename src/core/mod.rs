pub mod config;
pub mod camera;
pub mod gpu;
pub mod asset_provisioner;

// Graph runtime
pub mod text_format;
pub mod graph_config;
pub mod calculator;
pub mod calculator_graph;

// Session
pub mod scheduler;
pub mod tracking_solution;
