// Runs a tracking session against the synthetic camera for two seconds
// and saves the last displayed frame as a PNG.
//
//   cargo run --example synthetic_session [output.png]

use pose_tracker_lib::core::asset_provisioner::pose_assets;
use pose_tracker_lib::models::pose::ModelComplexity;
use pose_tracker_lib::platform::{HeadlessGpu, SyntheticCamera, TestPattern};
use pose_tracker_lib::{
    CalculatorRegistry, IntervalScheduler, SessionParts, TrackingConfig, TrackingSolution,
};
use std::path::PathBuf;
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    let output = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("synthetic_session.png"));

    // Stand-in model files; the built-in calculators never read them
    let workdir = std::env::temp_dir().join("pose_tracker_demo");
    let source_dir = workdir.join("models");
    std::fs::create_dir_all(&source_dir)?;
    for spec in pose_assets(ModelComplexity::Full) {
        std::fs::write(source_dir.join(&spec.name), spec.name.as_bytes())?;
    }

    let mut config = TrackingConfig::default();
    let graph_path =
        PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("graphs/pose_tracking_cpu.pbtxt");
    config.graph.config_path = Some(graph_path);
    config.assets.source_dir = source_dir;
    config.assets.cache_dir = workdir.join("cache");

    let parts = SessionParts {
        camera: Box::new(SyntheticCamera::new(TestPattern::Gradient).with_warmup_polls(5)),
        gpu: Box::new(HeadlessGpu::new()),
        registry: CalculatorRegistry::with_builtins(),
    };

    let fps = config.camera.fps;
    let mut solution = TrackingSolution::launch(config, parts).await?;
    let mut scheduler = IntervalScheduler::new(fps);

    let run = solution
        .run_until(&mut scheduler, tokio::time::sleep(Duration::from_secs(2)))
        .await;
    let ticks = solution.ticks();

    if let Some(texture) = solution.output_texture() {
        texture.save(&output)?;
        println!(
            "Saved {}x{} frame to {} after {} ticks ({} uploads)",
            texture.width(),
            texture.height(),
            output.display(),
            ticks,
            texture.upload_count()
        );
    }

    let teardown = solution.destroy().await;
    run?;
    teardown?;
    Ok(())
}
