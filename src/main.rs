use std::path::PathBuf;

use clap::Parser;
use env_logger::Env;
use itugl::{AppConfig, Backend, Frame, Vec4};

mod map;

use map::{MapDemo, MapSettings};

/// Procedural terrain rendered by the itugl forward renderer.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Window width in pixels.
    #[arg(long, default_value_t = 960)]
    width: u32,

    /// Window height in pixels.
    #[arg(long, default_value_t = 540)]
    height: u32,

    /// Render resolution relative to the window.
    #[arg(long, default_value_t = 0.5)]
    scale: f32,

    /// Terrain chunks per side.
    #[arg(long, default_value_t = 2)]
    chunks: u32,

    /// Grid cells per chunk side.
    #[arg(long, default_value_t = 48)]
    grid: u32,

    /// Terrain noise seed.
    #[arg(long, default_value_t = 7)]
    seed: u32,

    /// Directory holding the terrain, water and sky textures.
    #[arg(long)]
    textures: Option<PathBuf>,

    /// Render without a window and save the last frame.
    #[arg(long)]
    headless: bool,

    /// Frames to render in headless mode.
    #[arg(long, default_value_t = 1)]
    frames: u32,

    /// Where draw calls run.
    #[arg(long, value_enum, default_value_t = Backend::Gpu)]
    backend: Backend,

    /// Output image for headless mode.
    #[arg(long, default_value = "map.png")]
    output: PathBuf,
}

fn main() {
    env_logger::Builder::from_env(Env::default().default_filter_or("info"))
        .filter_module("wgpu_core", log::LevelFilter::Warn)
        .filter_module("wgpu_hal", log::LevelFilter::Warn)
        .init();

    let args = Args::parse();
    if let Err(err) = run(args) {
        log::error!("{err}");
        std::process::exit(1);
    }
}

fn run(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    let settings = MapSettings {
        chunks: args.chunks,
        grid: args.grid,
        seed: args.seed,
        textures: args.textures,
    };
    let config = AppConfig::new()
        .title("itugl map")
        .size(args.width, args.height)
        .render_scale(args.scale)
        .clear_color(Vec4::new(0.0, 0.0, 0.0, 1.0))
        .backend(args.backend);

    if args.headless {
        let frame = itugl::run_headless(config, args.frames.max(1), move |ctx| {
            let mut demo = MapDemo::new(ctx, &settings)?;
            Ok(move |frame: &mut Frame| demo.update(frame))
        })?;
        frame.save_png(&args.output)?;
        log::info!("wrote {}", args.output.display());
        return Ok(());
    }

    itugl::run(config, move |ctx| {
        let mut demo = MapDemo::new(ctx, &settings)?;
        Ok(move |frame: &mut Frame| demo.update(frame))
    })?;
    Ok(())
}
