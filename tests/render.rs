// Render targets, pipelines and the render loop against a real device

mod common;

use common::*;
use offscreen_renderer::{
    pack, BindingKind, Config, DeviceContext, Error, Filter, PipelineDesc, RenderTargetDesc,
    SamplerDesc, Wrap,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;

const NEAREST_CLAMP: SamplerDesc = SamplerDesc { filter: Filter::Nearest, wrap: Wrap::ClampToEdge };

fn solid_pipeline_desc(ctx: &DeviceContext) -> PipelineDesc {
    let vs = load(ctx, vertex_desc(FULLSCREEN_VS));
    let fs = load(ctx, fragment_desc(SOLID_FS).binding(0, BindingKind::UniformBuffer, 1));
    PipelineDesc::new(vs, fs)
        .vertex_count(3)
        .uniform_buffer(0, "params", 16)
}

#[test]
fn empty_target_reads_back_its_clear_color() {
    let Some(ctx) = context() else { return };
    let target = ctx
        .create_render_target_with(RenderTargetDesc::new(4, 4).clear_color([0.0, 0.0, 1.0, 1.0]))
        .unwrap();
    let output = ctx.output(target).unwrap();
    assert_eq!(output.len(), 1);

    let blue: Vec<u8> = BLUE.repeat(16);
    assert_eq!(ctx.read(output[0]).unwrap(), blue);
    ctx.render().unwrap();
    ctx.render().unwrap();
    assert_eq!(ctx.read(output[0]).unwrap(), blue);
}

#[test]
fn render_without_work_succeeds() {
    let Some(ctx) = context() else { return };
    ctx.render().unwrap();
    ctx.render().unwrap();
}

#[test]
fn consecutive_renders_are_byte_identical() {
    let Some(ctx) = context() else { return };
    let target = ctx.create_render_target((32, 32)).unwrap();
    let pipeline = ctx.pipeline(target, solid_pipeline_desc(&ctx)).unwrap();
    ctx.update(pipeline, [("params", pack(&[0.2f32, 0.4, 0.6, 1.0]).as_slice())])
        .unwrap();

    let output = ctx.output(target).unwrap()[0];
    ctx.render().unwrap();
    let first = ctx.read(output).unwrap();
    ctx.render().unwrap();
    let second = ctx.read(output).unwrap();
    assert_eq!(first, second);
    assert_eq!(pixel(&first, 32, 16, 16), [51, 102, 153, 255]);
}

#[test]
fn pipelines_draw_in_append_order() {
    let Some(ctx) = context() else { return };
    let (w, h) = (64, 64);
    let target = ctx.create_render_target((w, h)).unwrap();

    // A covers everything in red
    let background = ctx.pipeline(target, solid_pipeline_desc(&ctx)).unwrap();
    ctx.update(background, [("params", pack(&[1.0f32, 0.0, 0.0, 1.0]).as_slice())])
        .unwrap();

    // B is a centered quad in green
    let vs = load(&ctx, vertex_desc(POSITION_VS).vertex_inputs(&[2]));
    let fs = load(&ctx, fragment_desc(SOLID_FS).binding(0, BindingKind::UniformBuffer, 1));
    let quad = ctx
        .pipeline(
            target,
            PipelineDesc::new(vs, fs)
                .vertex_format("2f")
                .vertex_count(6)
                .uniform_buffer(0, "params", 16),
        )
        .unwrap();
    let corners: [f32; 12] = [-0.5, -0.5, 0.5, -0.5, 0.5, 0.5, -0.5, -0.5, 0.5, 0.5, -0.5, 0.5];
    ctx.update(
        quad,
        [
            ("vertex_buffer", pack(&corners).as_slice()),
            ("params", pack(&[0.0f32, 1.0, 0.0, 1.0]).as_slice()),
        ],
    )
    .unwrap();

    assert_eq!(ctx.pipelines(target).unwrap(), vec![background, quad]);
    ctx.render().unwrap();

    let data = ctx.read(ctx.output(target).unwrap()[0]).unwrap();
    assert_eq!(pixel(&data, w, 32, 32), GREEN);
    assert_eq!(pixel(&data, w, 20, 40), GREEN);
    for (x, y) in [(0, 0), (63, 0), (0, 63), (63, 63), (4, 32), (32, 60)] {
        assert_eq!(pixel(&data, w, x, y), RED, "pixel ({x}, {y})");
    }
}

#[test]
fn textured_triangle_scenario() {
    let Some(ctx) = context() else { return };

    let texture = ctx.create_image_with_data((2, 2), "4b", &checkerboard()).unwrap();
    let sampler = ctx
        .create_sampler_with(texture, NEAREST_CLAMP)
        .unwrap();

    let target = ctx
        .create_render_target_with(
            RenderTargetDesc::new(512, 512).clear_color([0.0, 0.0, 1.0, 1.0]),
        )
        .unwrap();
    let vs = load(&ctx, vertex_desc(TEXTURED_VS).vertex_inputs(&[2, 2]));
    let fs = load(
        &ctx,
        fragment_desc(TEXTURED_FS)
            .binding(1, BindingKind::SampledImage, 1)
            .binding(2, BindingKind::Sampler, 1),
    );
    let pipeline = ctx
        .pipeline(
            target,
            PipelineDesc::new(vs, fs)
                .vertex_format("2f 2f")
                .vertex_count(3)
                .textures(1, vec![sampler])
                .sampler_states(2, vec![sampler]),
        )
        .unwrap();
    ctx.update(pipeline, [("vertex_buffer", pack(&triangle_vertices()).as_slice())])
        .unwrap();

    ctx.render().unwrap();
    let data = ctx.read(ctx.output(target).unwrap()[0]).unwrap();
    assert_eq!(data.len(), 512 * 512 * 4);

    // Outside the triangle: clear color
    for (x, y) in [(0, 0), (511, 0), (10, 200), (500, 200)] {
        assert_eq!(pixel(&data, 512, x, y), BLUE, "pixel ({x}, {y})");
    }

    // Inside: checkerboard texels only, and both of them
    let mut seen_white = false;
    let mut seen_black = false;
    for y in (260..510).step_by(25) {
        for x in (200..312).step_by(16) {
            let p = pixel(&data, 512, x, y);
            assert!(p == WHITE || p == BLACK, "pixel ({x}, {y}) = {p:?}");
            seen_white |= p == WHITE;
            seen_black |= p == BLACK;
        }
    }
    assert!(seen_white && seen_black);
}

#[test]
fn depth_test_keeps_nearer_fragments() {
    let Some(ctx) = context() else { return };
    let target = ctx
        .create_render_target_with(RenderTargetDesc::new(8, 8).depth(true))
        .unwrap();

    let vs = load(&ctx, vertex_desc(DEPTH_VS).binding(0, BindingKind::UniformBuffer, 1));
    let fs = load(&ctx, fragment_desc(DEPTH_FS).binding(0, BindingKind::UniformBuffer, 1));
    let desc = PipelineDesc::new(vs, fs).vertex_count(3).uniform_buffer(0, "params", 32);

    let near = ctx.pipeline(target, desc.clone()).unwrap();
    let far = ctx.pipeline(target, desc).unwrap();
    ctx.update(near, [("params", pack(&[0.0f32, 1.0, 0.0, 1.0, 0.2, 0.0, 0.0, 0.0]).as_slice())])
        .unwrap();
    ctx.update(far, [("params", pack(&[1.0f32, 0.0, 0.0, 1.0, 0.5, 0.0, 0.0, 0.0]).as_slice())])
        .unwrap();

    ctx.render().unwrap();
    let data = ctx.read(ctx.output(target).unwrap()[0]).unwrap();
    assert_eq!(pixel(&data, 8, 4, 4), GREEN);
}

#[test]
fn indexed_draws_use_the_index_buffer() {
    let Some(ctx) = context() else { return };
    let target = ctx
        .create_render_target_with(RenderTargetDesc::new(16, 16).clear_color([0.0, 0.0, 0.0, 1.0]))
        .unwrap();
    let vs = load(&ctx, vertex_desc(POSITION_VS).vertex_inputs(&[2]));
    let fs = load(&ctx, fragment_desc(SOLID_FS).binding(0, BindingKind::UniformBuffer, 1));
    let pipeline = ctx
        .pipeline(
            target,
            PipelineDesc::new(vs, fs)
                .vertex_format("2f")
                .vertex_count(4)
                .index_count(6)
                .uniform_buffer(0, "params", 16),
        )
        .unwrap();

    let corners: [f32; 8] = [-1.0, -1.0, 1.0, -1.0, 1.0, 1.0, -1.0, 1.0];
    ctx.update(
        pipeline,
        [
            ("vertex_buffer", pack(&corners).as_slice()),
            ("index_buffer", pack(&[0u32, 1, 2, 0, 2, 3]).as_slice()),
            ("params", pack(&[1.0f32, 1.0, 1.0, 1.0]).as_slice()),
        ],
    )
    .unwrap();
    ctx.render().unwrap();

    let data = ctx.read(ctx.output(target).unwrap()[0]).unwrap();
    assert!(data.chunks_exact(4).all(|p| p == WHITE));
}

#[test]
fn update_is_validated_before_writing() {
    let Some(ctx) = context() else { return };
    let target = ctx.create_render_target((4, 4)).unwrap();
    let pipeline = ctx.pipeline(target, solid_pipeline_desc(&ctx)).unwrap();

    let red = pack(&[1.0f32, 0.0, 0.0, 1.0]);
    ctx.update(pipeline, [("params", red.as_slice())]).unwrap();

    let green = pack(&[0.0f32, 1.0, 0.0, 1.0]);
    let err = ctx
        .update(pipeline, [("params", green.as_slice()), ("colour", green.as_slice())])
        .unwrap_err();
    assert!(matches!(err, Error::UnknownBinding(ref key) if key == "colour"));

    // No vertex format, no vertex buffer; no index count, no index buffer
    assert!(matches!(
        ctx.update(pipeline, [("vertex_buffer", green.as_slice())]),
        Err(Error::UnknownBinding(_))
    ));
    assert!(matches!(
        ctx.update(pipeline, [("index_buffer", green.as_slice())]),
        Err(Error::UnknownBinding(_))
    ));
    assert!(matches!(
        ctx.update(pipeline, [("params", &green[..8])]),
        Err(Error::SizeMismatch { expected: 16, actual: 8 })
    ));

    // Zero-length data leaves the uniform alone
    ctx.update(pipeline, [("params", &[] as &[u8])]).unwrap();

    // None of the failed updates reached the uniform
    ctx.render().unwrap();
    let data = ctx.read(ctx.output(target).unwrap()[0]).unwrap();
    assert_eq!(pixel(&data, 4, 1, 1), RED);
}

#[test]
fn construction_rejects_mismatched_bindings() {
    let Some(ctx) = context() else { return };
    let target = ctx.create_render_target((4, 4)).unwrap();
    let vs = load(&ctx, vertex_desc(FULLSCREEN_VS));
    let fs = load(&ctx, fragment_desc(SOLID_FS).binding(0, BindingKind::UniformBuffer, 1));

    // Nothing bound at slot 0
    let missing = PipelineDesc::new(vs, fs).vertex_count(3);
    assert!(matches!(ctx.pipeline(target, missing), Err(Error::BindingMismatch(_))));

    // Wrong kind at slot 0
    let buffer = ctx.create_buffer(16).unwrap();
    let wrong_kind = PipelineDesc::new(vs, fs).vertex_count(3).storage_buffer(0, buffer);
    assert!(matches!(ctx.pipeline(target, wrong_kind), Err(Error::BindingMismatch(_))));

    // Extra binding nobody declared
    let extra = PipelineDesc::new(vs, fs)
        .vertex_count(3)
        .uniform_buffer(0, "params", 16)
        .uniform_buffer(4, "unused", 16);
    assert!(matches!(ctx.pipeline(target, extra), Err(Error::BindingMismatch(_))));

    assert!(ctx.pipelines(target).unwrap().is_empty());
}

#[test]
fn construction_rejects_mismatched_vertex_layouts() {
    let Some(ctx) = context() else { return };
    let target = ctx.create_render_target((4, 4)).unwrap();
    let vs = load(&ctx, vertex_desc(TEXTURED_VS).vertex_inputs(&[2, 2]));
    let fs = load(&ctx, fragment_desc(SOLID_FS).binding(0, BindingKind::UniformBuffer, 1));

    for format in ["2f", "2f 2f 2f", "3f 2f", ""] {
        let desc = PipelineDesc::new(vs, fs)
            .vertex_format(format)
            .vertex_count(3)
            .uniform_buffer(0, "params", 16);
        assert!(
            matches!(ctx.pipeline(target, desc), Err(Error::VertexLayoutMismatch(_))),
            "format {format:?}"
        );
    }
}

#[test]
fn malformed_shader_binaries_are_rejected() {
    let Some(ctx) = context() else { return };
    for code in [vec![], vec![1, 2, 3], vec![0u8; 64]] {
        let desc = offscreen_renderer::ShaderDesc::new(offscreen_renderer::StageKind::Vertex, code);
        assert!(matches!(
            ctx.create_shader_stage(desc),
            Err(Error::ShaderCompilationRejected(_))
        ));
    }
}

#[test]
fn destroying_bound_resources_is_refused_until_released() {
    let Some(ctx) = context() else { return };
    let texture = ctx.create_image_with_data((2, 2), "4b", &checkerboard()).unwrap();
    let sampler = ctx.create_sampler(texture).unwrap();
    let target = ctx.create_render_target((8, 8)).unwrap();

    let vs = load(&ctx, vertex_desc(TEXTURED_VS).vertex_inputs(&[2, 2]));
    let fs = load(
        &ctx,
        fragment_desc(TEXTURED_FS)
            .binding(1, BindingKind::SampledImage, 1)
            .binding(2, BindingKind::Sampler, 1),
    );
    let pipeline = ctx
        .pipeline(
            target,
            PipelineDesc::new(vs, fs)
                .vertex_format("2f 2f")
                .vertex_count(3)
                .textures(1, vec![sampler])
                .sampler_states(2, vec![sampler]),
        )
        .unwrap();

    // Shader stages are not referenced once the pipeline exists
    ctx.destroy_shader(vs).unwrap();
    ctx.destroy_shader(fs).unwrap();
    ctx.render().unwrap();

    assert!(matches!(ctx.destroy(texture), Err(Error::ResourceInUse(_))));
    assert!(matches!(ctx.destroy_sampler(sampler), Err(Error::ResourceInUse(_))));

    let attachment = ctx.output(target).unwrap()[0];
    assert!(matches!(ctx.destroy(attachment), Err(Error::ResourceInUse(_))));

    ctx.destroy_pipeline(pipeline).unwrap();
    assert!(ctx.pipelines(target).unwrap().is_empty());
    ctx.destroy_sampler(sampler).unwrap();
    ctx.destroy(texture).unwrap();

    // Attachments go with their target
    ctx.destroy_render_target(target).unwrap();
    assert!(matches!(ctx.read(attachment), Err(Error::InvalidResource(_))));
    assert!(matches!(
        ctx.update(pipeline, std::iter::empty()),
        Err(Error::InvalidResource(_))
    ));
}

#[test]
fn storage_buffers_stay_alive_while_bound() {
    let Some(ctx) = context() else { return };
    let target = ctx.create_render_target((4, 4)).unwrap();
    let fs_source = r#"
struct Colors {
    values: array<vec4<f32>>,
}

@group(0) @binding(3) var<storage, read> colors: Colors;

@fragment
fn main() -> @location(0) vec4<f32> {
    return colors.values[1];
}
"#;
    let vs = load(&ctx, vertex_desc(FULLSCREEN_VS));
    let fs = load(&ctx, fragment_desc(fs_source).binding(3, BindingKind::StorageBuffer, 1));
    let buffer = ctx.create_buffer_with_format(2, "4f").unwrap();
    ctx.write(buffer, &pack(&[0.0f32, 0.0, 0.0, 1.0, 0.0, 1.0, 0.0, 1.0])).unwrap();

    let pipeline = ctx
        .pipeline(target, PipelineDesc::new(vs, fs).vertex_count(3).storage_buffer(3, buffer))
        .unwrap();
    ctx.render().unwrap();
    let data = ctx.read(ctx.output(target).unwrap()[0]).unwrap();
    assert_eq!(pixel(&data, 4, 2, 2), GREEN);

    assert!(matches!(ctx.destroy(buffer), Err(Error::ResourceInUse("buffer"))));
    ctx.destroy_pipeline(pipeline).unwrap();
    ctx.destroy(buffer).unwrap();
}

#[test]
fn pipelines_cannot_sample_their_own_target() {
    let Some(ctx) = context() else { return };
    let target = ctx.create_render_target((4, 4)).unwrap();
    let attachment = ctx.output(target).unwrap()[0];
    let sampler = ctx.create_sampler(attachment).unwrap();

    let vs = load(&ctx, vertex_desc(TEXTURED_VS).vertex_inputs(&[2, 2]));
    let fs = load(
        &ctx,
        fragment_desc(TEXTURED_FS)
            .binding(1, BindingKind::SampledImage, 1)
            .binding(2, BindingKind::Sampler, 1),
    );
    let desc = PipelineDesc::new(vs, fs)
        .vertex_format("2f 2f")
        .vertex_count(3)
        .textures(1, vec![sampler])
        .sampler_states(2, vec![sampler]);
    assert!(matches!(
        ctx.pipeline(target, desc.clone()),
        Err(Error::InvalidResourceDescriptor(_))
    ));

    // Another target may sample it
    let other = ctx.create_render_target((4, 4)).unwrap();
    ctx.pipeline(other, desc).unwrap();
    ctx.render().unwrap();
}

#[test]
fn sampled_target_outlives_the_pipelines_reading_it() {
    let Some(ctx) = context() else { return };
    let source = ctx.create_render_target((4, 4)).unwrap();
    let attachment = ctx.output(source).unwrap()[0];
    let sampler = ctx.create_sampler(attachment).unwrap();

    let vs = load(&ctx, vertex_desc(TEXTURED_VS).vertex_inputs(&[2, 2]));
    let fs = load(
        &ctx,
        fragment_desc(TEXTURED_FS)
            .binding(1, BindingKind::SampledImage, 1)
            .binding(2, BindingKind::Sampler, 1),
    );
    let desc = PipelineDesc::new(vs, fs)
        .vertex_format("2f 2f")
        .vertex_count(3)
        .textures(1, vec![sampler])
        .sampler_states(2, vec![sampler]);
    let reader = ctx.create_render_target((4, 4)).unwrap();
    let pipeline = ctx.pipeline(reader, desc).unwrap();
    ctx.render().unwrap();

    assert!(matches!(ctx.destroy_render_target(source), Err(Error::ResourceInUse("image"))));
    // Nothing was torn down by the refusal
    assert_eq!(ctx.output(source).unwrap(), vec![attachment]);
    ctx.render().unwrap();

    ctx.destroy_pipeline(pipeline).unwrap();
    ctx.destroy_render_target(source).unwrap();
    assert!(matches!(ctx.read(attachment), Err(Error::InvalidResource("image"))));
    ctx.render().unwrap();
}

#[test]
fn multiple_outputs_all_receive_the_clear() {
    let Some(ctx) = context() else { return };
    let target = ctx
        .create_render_target_with(
            RenderTargetDesc::new(2, 2).outputs(3).clear_color([1.0, 0.0, 0.0, 1.0]),
        )
        .unwrap();
    let outputs = ctx.output(target).unwrap();
    assert_eq!(outputs.len(), 3);
    for output in outputs {
        assert_eq!(ctx.read(output).unwrap(), RED.repeat(4));
    }
    assert!(matches!(
        ctx.create_render_target_with(RenderTargetDesc::new(2, 2).outputs(0)),
        Err(Error::InvalidResourceDescriptor(_))
    ));
}

#[test]
fn bottom_up_row_order_flips_render_output() {
    let config = Config::from_toml_str("[render]\nrow_order = \"bottom_up\"").unwrap();
    let Some(ctx) = context_with(config) else { return };
    let target = ctx.create_render_target((8, 8)).unwrap();

    // Covers the top half of the target only
    let vs = load(&ctx, vertex_desc(POSITION_VS).vertex_inputs(&[2]));
    let fs = load(&ctx, fragment_desc(SOLID_FS).binding(0, BindingKind::UniformBuffer, 1));
    let pipeline = ctx
        .pipeline(
            target,
            PipelineDesc::new(vs, fs)
                .vertex_format("2f")
                .vertex_count(6)
                .uniform_buffer(0, "params", 16),
        )
        .unwrap();
    let top_half: [f32; 12] = [-1.0, 0.0, 1.0, 0.0, 1.0, 1.0, -1.0, 0.0, 1.0, 1.0, -1.0, 1.0];
    ctx.update(
        pipeline,
        [
            ("vertex_buffer", pack(&top_half).as_slice()),
            ("params", pack(&[1.0f32, 0.0, 0.0, 1.0]).as_slice()),
        ],
    )
    .unwrap();
    ctx.render().unwrap();

    // First row returned is the bottom of the image
    let data = ctx.read(ctx.output(target).unwrap()[0]).unwrap();
    assert_eq!(pixel(&data, 8, 4, 0), BLACK);
    assert_eq!(pixel(&data, 8, 4, 7), RED);
}

#[test]
fn concurrent_renders_are_rejected_not_queued() {
    let Some(ctx) = context() else { return };
    let ctx = Arc::new(ctx);
    let target = ctx.create_render_target((256, 256)).unwrap();
    let pipeline = ctx.pipeline(target, solid_pipeline_desc(&ctx)).unwrap();
    ctx.update(pipeline, [("params", pack(&[0.0f32, 1.0, 0.0, 1.0]).as_slice())])
        .unwrap();

    let threads = 4;
    let barrier = Arc::new(Barrier::new(threads));
    let turned_away = Arc::new(AtomicBool::new(false));
    let handles: Vec<_> = (0..threads)
        .map(|_| {
            let ctx = Arc::clone(&ctx);
            let barrier = Arc::clone(&barrier);
            let turned_away = Arc::clone(&turned_away);
            thread::spawn(move || {
                barrier.wait();
                // Keep overlapping until some thread has been turned away
                let done = |n: usize| n >= 2000 || (n >= 20 && turned_away.load(Ordering::Acquire));
                let mut results = Vec::new();
                while !done(results.len()) {
                    let result = ctx.render();
                    if matches!(result, Err(Error::ConcurrentRenderNotPermitted)) {
                        turned_away.store(true, Ordering::Release);
                    }
                    results.push(result);
                }
                results
            })
        })
        .collect();

    let (mut completed, mut rejected) = (0, 0);
    for handle in handles {
        for result in handle.join().unwrap() {
            match result {
                Ok(()) => completed += 1,
                Err(Error::ConcurrentRenderNotPermitted) => rejected += 1,
                Err(e) => panic!("unexpected render failure: {e}"),
            }
        }
    }
    assert!(completed > 0);
    assert!(rejected > 0, "{completed} renders all ran without overlapping");

    // The context is still usable and the output is intact
    ctx.render().unwrap();
    let data = ctx.read(ctx.output(target).unwrap()[0]).unwrap();
    assert!(data.chunks_exact(4).all(|p| p == GREEN));
}

#[test]
fn independent_contexts_render_in_parallel() {
    init_logging();
    let handles: Vec<_> = (0..2)
        .map(|i| {
            thread::spawn(move || {
                let Some(ctx) = context() else { return true };
                let target = ctx
                    .create_render_target_with(
                        RenderTargetDesc::new(16, 16).clear_color([i as f32, 0.0, 0.0, 1.0]),
                    )
                    .unwrap();
                let _ = ctx.pipeline(target, solid_pipeline_desc(&ctx)).unwrap();
                for _ in 0..10 {
                    ctx.render().unwrap();
                }
                ctx.read(ctx.output(target).unwrap()[0]).unwrap().len() == 16 * 16 * 4
            })
        })
        .collect();
    for handle in handles {
        assert!(handle.join().unwrap());
    }
}
