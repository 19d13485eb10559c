//! Headless model viewer.
//!
//! Renders a scene on the software device for a fixed number of frames and
//! reports what the device saw. Useful to check that a scene loads, uploads
//! and draws without validation errors.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;
use glam::Mat4;

use model_viewer::backend::{ExecutionMode, SoftwareDevice};
use model_viewer::scene::{MaterialRecord, MeshRecord, SceneDescription, SceneNode};
use model_viewer::{Viewer, ViewerConfig, ViewerResult};

/// Model viewer command line arguments.
#[derive(Parser, Debug)]
#[command(
    name = "model-viewer",
    about = "Headless descriptor-table model viewer",
    long_about = "Loads a glTF scene, uploads it through staging buffers and renders it on the \
        software device.\n\n\
        EXAMPLES:\n\
          # Render the built-in cube for 10 frames\n\
          model-viewer --frames 10\n\
        \n\
          # Let the CPU run ahead of a deferred GPU timeline\n\
          model-viewer scene.gltf --deferred --ring-depth 3",
    version
)]
struct Args {
    /// glTF scene to load. Without one a single cube is shown.
    scene: Option<PathBuf>,

    /// Initial width in pixels.
    #[arg(long, default_value = "1280")]
    width: u32,

    /// Initial height in pixels.
    #[arg(long, default_value = "720")]
    height: u32,

    /// Frames to render before exiting.
    #[arg(long, default_value = "3")]
    frames: u64,

    /// Frames in flight.
    #[arg(long, default_value = "2")]
    ring_depth: usize,

    /// Meshes across all loaded models.
    #[arg(long, default_value = "64")]
    max_meshes: usize,

    /// Only execute GPU work when a fence wait needs it.
    #[arg(long)]
    deferred: bool,

    /// Switch to full screen before the first frame.
    #[arg(long)]
    full_screen: bool,
}

impl From<&Args> for ViewerConfig {
    fn from(args: &Args) -> Self {
        Self {
            width: args.width,
            height: args.height,
            ring_depth: args.ring_depth,
            max_meshes: args.max_meshes,
            ..Default::default()
        }
    }
}

fn cube_scene() -> SceneDescription {
    SceneDescription {
        nodes: vec![SceneNode::new("cube", Mat4::from_scale(glam::Vec3::splat(4.0))).with_meshes(vec![0])],
        root: 0,
        meshes: vec![MeshRecord::cube(0)],
        materials: vec![MaterialRecord {
            name: "default".to_string(),
            ..Default::default()
        }],
    }
}

fn run(args: &Args) -> ViewerResult<()> {
    let mode = if args.deferred {
        ExecutionMode::Deferred
    } else {
        ExecutionMode::Immediate
    };
    let mut viewer = Viewer::new(SoftwareDevice::new(mode), ViewerConfig::from(args))?;

    match &args.scene {
        Some(path) => viewer.load_model(path)?,
        None => viewer.load_scene(&cube_scene(), "cube")?,
    };
    if args.full_screen {
        viewer.toggle_full_screen()?;
    }

    let mut draws = 0;
    for _ in 0..args.frames {
        viewer.on_update();
        draws += viewer.on_render()?;
    }
    log::info!(
        "Rendered {} frames, {} draws, {} fence stalls",
        viewer.frame_count(),
        draws,
        viewer.frame_sync().stall_count()
    );

    let device = viewer.shutdown()?;
    let messages = device.validation_messages();
    for message in &messages {
        log::error!("validation: {}", message);
    }
    log::info!(
        "Device: {} submissions, {} presents, {} validation messages",
        device.submissions().len(),
        device.presents(),
        messages.len()
    );
    Ok(())
}

fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            log::error!("{}", err);
            ExitCode::FAILURE
        }
    }
}
