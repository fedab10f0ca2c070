// Shared helpers for the GPU integration tests
//
// Shaders are written in WGSL and compiled to SPIR-V with naga at test time.
// Every test asks for a context first and returns early when the machine has
// no Vulkan device.

#![allow(dead_code)]

use offscreen_renderer::{Config, DeviceContext, Error, ShaderDesc, ShaderHandle, StageKind};

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn context() -> Option<DeviceContext> {
    context_with(Config::default())
}

pub fn context_with(config: Config) -> Option<DeviceContext> {
    init_logging();
    match DeviceContext::with_config(config) {
        Ok(ctx) => Some(ctx),
        Err(Error::DeviceUnavailable(reason)) => {
            eprintln!("skipping, no Vulkan device: {}", reason);
            None
        }
        Err(e) => panic!("unexpected context failure: {e}"),
    }
}

pub fn spirv(source: &str, stage: naga::ShaderStage) -> Vec<u8> {
    let module = naga::front::wgsl::parse_str(source).expect("test WGSL parses");
    let info = naga::valid::Validator::new(
        naga::valid::ValidationFlags::all(),
        naga::valid::Capabilities::all(),
    )
    .validate(&module)
    .expect("test WGSL validates");
    let pipeline_options = naga::back::spv::PipelineOptions {
        shader_stage: stage,
        entry_point: "main".to_string(),
    };
    let words = naga::back::spv::write_vec(
        &module,
        &info,
        &naga::back::spv::Options::default(),
        Some(&pipeline_options),
    )
    .expect("SPIR-V generation");
    bytemuck::cast_slice(&words).to_vec()
}

pub fn vertex_desc(source: &str) -> ShaderDesc {
    ShaderDesc::new(StageKind::Vertex, spirv(source, naga::ShaderStage::Vertex))
}

pub fn fragment_desc(source: &str) -> ShaderDesc {
    ShaderDesc::new(StageKind::Fragment, spirv(source, naga::ShaderStage::Fragment))
}

pub fn compute_desc(source: &str) -> ShaderDesc {
    ShaderDesc::new(StageKind::Compute, spirv(source, naga::ShaderStage::Compute))
}

pub fn load(ctx: &DeviceContext, desc: ShaderDesc) -> ShaderHandle {
    ctx.create_shader_stage(desc).expect("shader stage loads")
}

/// RGBA8 pixel at (x, y) of a tightly packed image
pub fn pixel(data: &[u8], width: u32, x: u32, y: u32) -> [u8; 4] {
    let i = ((y * width + x) * 4) as usize;
    [data[i], data[i + 1], data[i + 2], data[i + 3]]
}

pub const RED: [u8; 4] = [255, 0, 0, 255];
pub const GREEN: [u8; 4] = [0, 255, 0, 255];
pub const BLUE: [u8; 4] = [0, 0, 255, 255];
pub const WHITE: [u8; 4] = [255, 255, 255, 255];
pub const BLACK: [u8; 4] = [0, 0, 0, 255];

// =============================================================================
// SHADERS
// =============================================================================

/// One triangle covering the whole target, no vertex inputs
pub const FULLSCREEN_VS: &str = r#"
@vertex
fn main(@builtin(vertex_index) i: u32) -> @builtin(position) vec4<f32> {
    let x = f32((i << 1u) & 2u) * 2.0 - 1.0;
    let y = f32(i & 2u) * 2.0 - 1.0;
    return vec4<f32>(x, y, 0.0, 1.0);
}
"#;

/// Positions from a "2f" vertex buffer
pub const POSITION_VS: &str = r#"
@vertex
fn main(@location(0) pos: vec2<f32>) -> @builtin(position) vec4<f32> {
    return vec4<f32>(pos, 0.0, 1.0);
}
"#;

/// Solid color from the uniform at binding 0
pub const SOLID_FS: &str = r#"
struct Params {
    color: vec4<f32>,
}

@group(0) @binding(0) var<uniform> params: Params;

@fragment
fn main() -> @location(0) vec4<f32> {
    return params.color;
}
"#;

/// Fullscreen triangle at the depth given by the uniform at binding 0
pub const DEPTH_VS: &str = r#"
struct Params {
    color: vec4<f32>,
    depth: vec4<f32>,
}

@group(0) @binding(0) var<uniform> params: Params;

@vertex
fn main(@builtin(vertex_index) i: u32) -> @builtin(position) vec4<f32> {
    let x = f32((i << 1u) & 2u) * 2.0 - 1.0;
    let y = f32(i & 2u) * 2.0 - 1.0;
    return vec4<f32>(x, y, params.depth.x, 1.0);
}
"#;

pub const DEPTH_FS: &str = r#"
struct Params {
    color: vec4<f32>,
    depth: vec4<f32>,
}

@group(0) @binding(0) var<uniform> params: Params;

@fragment
fn main() -> @location(0) vec4<f32> {
    return params.color;
}
"#;

/// "2f 2f" position + texcoord
pub const TEXTURED_VS: &str = r#"
struct VsOut {
    @builtin(position) pos: vec4<f32>,
    @location(0) uv: vec2<f32>,
}

@vertex
fn main(@location(0) pos: vec2<f32>, @location(1) uv: vec2<f32>) -> VsOut {
    var out: VsOut;
    out.pos = vec4<f32>(pos, 0.0, 1.0);
    out.uv = uv;
    return out;
}
"#;

/// Texture at binding 1, sampler at binding 2
pub const TEXTURED_FS: &str = r#"
@group(0) @binding(1) var tex: texture_2d<f32>;
@group(0) @binding(2) var samp: sampler;

@fragment
fn main(@location(0) uv: vec2<f32>) -> @location(0) vec4<f32> {
    return textureSample(tex, samp, uv);
}
"#;

/// Textured triangle: apex at the top center, base along the bottom edge
pub fn triangle_vertices() -> Vec<f32> {
    vec![
        -1.0, -1.0, 0.0, 1.0, //
        1.0, -1.0, 1.0, 1.0, //
        0.0, 1.0, 0.5, 0.0,
    ]
}

/// 2x2 white/black checkerboard, RGBA8
pub fn checkerboard() -> Vec<u8> {
    [WHITE, BLACK, BLACK, WHITE].concat()
}
