// =============================================================================
// OFFSCREEN RENDERER DEMO - textured triangle to a PPM file
// =============================================================================
//
// FLOW:
// 1. Load config.toml, set up logging
// 2. Create the context, a 2x2 checkerboard texture and a 512x512 target
// 3. Load the precompiled SPIR-V stages (build.rs runs glslc)
// 4. One render, read the attachment back, write output.ppm
//
// =============================================================================

use anyhow::{Context, Result};
use bytemuck::{Pod, Zeroable};
use glam::Vec2;
use offscreen_renderer::{
    pack, BindingKind, Config, DeviceContext, Filter, PipelineDesc, RenderTargetDesc, SamplerDesc,
    ShaderDesc, StageKind, Wrap,
};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::Path;
use std::time::Instant;

const WIDTH: u32 = 512;
const HEIGHT: u32 = 512;
const OUTPUT: &str = "output.ppm";

#[repr(C)]
#[derive(Clone, Copy, Pod, Zeroable)]
struct Vertex {
    position: Vec2,
    uv: Vec2,
}

// =============================================================================
// ENTRY POINT
// =============================================================================

fn main() -> Result<()> {
    let config = Config::load();
    init_logging(&config);
    log::info!("Starting offscreen renderer demo");

    let ctx = DeviceContext::with_config(config).context("Failed to create device context")?;
    log::info!("Rendering on {}", ctx.device_name());

    // -------------------------------------------------------------------------
    // Texture
    // -------------------------------------------------------------------------
    let white = [255u8, 255, 255, 255];
    let black = [0u8, 0, 0, 255];
    let checkerboard = [white, black, black, white].concat();
    let texture = ctx.create_image_with_data((2, 2), "4b", &checkerboard)?;
    let sampler = ctx.create_sampler_with(
        texture,
        SamplerDesc { filter: Filter::Nearest, wrap: Wrap::Repeat },
    )?;

    // -------------------------------------------------------------------------
    // Target and pipeline
    // -------------------------------------------------------------------------
    let target = ctx.create_render_target_with(
        RenderTargetDesc::new(WIDTH, HEIGHT).clear_color([0.0, 0.0, 1.0, 1.0]),
    )?;

    let vertex_shader = ctx.create_shader_stage(
        ShaderDesc::new(StageKind::Vertex, read_spirv("shaders/textured.vert.spv")?)
            .vertex_inputs(&[2, 2]),
    )?;
    let fragment_shader = ctx.create_shader_stage(
        ShaderDesc::new(StageKind::Fragment, read_spirv("shaders/textured.frag.spv")?)
            .binding(1, BindingKind::CombinedImageSampler, 1),
    )?;

    let pipeline = ctx.pipeline(
        target,
        PipelineDesc::new(vertex_shader, fragment_shader)
            .vertex_format("2f 2f")
            .vertex_count(3)
            .samplers(1, vec![sampler]),
    )?;

    // Vulkan clip space has +y pointing down
    let vertices = [
        Vertex { position: Vec2::new(-1.0, 1.0), uv: Vec2::new(0.0, 1.0) },
        Vertex { position: Vec2::new(1.0, 1.0), uv: Vec2::new(1.0, 1.0) },
        Vertex { position: Vec2::new(0.0, -1.0), uv: Vec2::new(0.5, 0.0) },
    ];
    ctx.update(pipeline, [("vertex_buffer", pack(&vertices).as_slice())])?;

    // -------------------------------------------------------------------------
    // Render and read back
    // -------------------------------------------------------------------------
    let start = Instant::now();
    ctx.render().context("Render failed")?;
    log::info!("Rendered {}x{} in {:?}", WIDTH, HEIGHT, start.elapsed());

    let output = ctx
        .output(target)?
        .first()
        .copied()
        .context("Render target has no outputs")?;
    let pixels = ctx.read(output)?;
    write_ppm(OUTPUT, WIDTH, HEIGHT, &pixels)?;
    log::info!("Wrote {} ({} bytes of RGBA read back)", OUTPUT, pixels.len());
    log::info!("GPU memory in use: {} bytes", ctx.allocated_bytes());

    Ok(())
}

/// Initialize env_logger, optionally writing to the configured log file
fn init_logging(config: &Config) {
    use env_logger::{Builder, Target};
    use log::LevelFilter;

    let mut builder = Builder::from_default_env();
    builder.filter_level(LevelFilter::Info);

    if config.debug.log_to_file {
        match OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&config.debug.log_file)
        {
            Ok(mut file) => {
                let _ = writeln!(file, "=== Offscreen Renderer Log ===");
                let _ = writeln!(file, "Started: {:?}", std::time::SystemTime::now());
                let _ = writeln!(file);
                builder.target(Target::Pipe(Box::new(file)));
            }
            Err(e) => eprintln!("Cannot open log file {}: {}", config.debug.log_file, e),
        }
    }

    builder.init();
}

fn read_spirv(path: &str) -> Result<Vec<u8>> {
    std::fs::read(Path::new(path)).with_context(|| {
        format!("Failed to read {} (compile the shaders with glslc first)", path)
    })
}

/// Binary PPM, alpha dropped
fn write_ppm(path: &str, width: u32, height: u32, rgba: &[u8]) -> Result<()> {
    let file = File::create(path).with_context(|| format!("Failed to create {}", path))?;
    let mut out = BufWriter::new(file);
    write!(out, "P6\n{} {}\n255\n", width, height)?;
    for pixel in rgba.chunks_exact(4) {
        out.write_all(&pixel[..3])?;
    }
    out.flush()?;
    Ok(())
}
