//! End-to-end pipeline tests: submit real draws through the public API and
//! assert on the produced pixels. Shaders are plain functions implementing
//! the public contracts; geometry avoids pixel centers exactly on edges
//! except where a test exercises the tie-break rules on purpose.

use std::sync::atomic::Ordering;

use model::simd::LANES;
use model::{VS_SLOT_COLOR0, VS_SLOT_POSITION};

use crate::config::{ContextConfig, ThreadingMode};
use crate::context::Context;
use crate::resource::LockMode;
use crate::shader::{
    ATTACHMENT_COLOR, ATTACHMENT_DEPTH, FetchInfo, PixelOutput, TriangleDesc, VertexInput,
    VertexOutput,
};
use crate::state::Viewport;
use crate::{Bbox, ClearMask, CullMode, DriverType, IndexType, PrimitiveTopology, SurfaceFormat};

// ------------------------------------------------------------- test shaders

/// Fetch: positions only, 4 floats per vertex in stream 0.
fn fetch_positions(info: &FetchInfo, out: &mut VertexInput) {
    for lane in 0..info.active_lanes {
        let base = unsafe { info.streams[0].add(info.indices[lane] as usize * 4) };
        let pos = unsafe { [*base, *base.add(1), *base.add(2), *base.add(3)] };
        out.attributes[VS_SLOT_POSITION].set_lane(lane, pos);
    }
}

/// Fetch: position + color, 8 floats per vertex in stream 0.
fn fetch_positions_colors(info: &FetchInfo, out: &mut VertexInput) {
    for lane in 0..info.active_lanes {
        let base = unsafe { info.streams[0].add(info.indices[lane] as usize * 8) };
        unsafe {
            out.attributes[VS_SLOT_POSITION]
                .set_lane(lane, [*base, *base.add(1), *base.add(2), *base.add(3)]);
            out.attributes[VS_SLOT_COLOR0].set_lane(
                lane,
                [*base.add(4), *base.add(5), *base.add(6), *base.add(7)],
            );
        }
    }
}

fn vertex_passthrough(input: &VertexInput, out: &mut VertexOutput) {
    out.position = input.attributes[VS_SLOT_POSITION];
    out.attributes = input.attributes;
}

/// Pixel: write opaque white wherever covered.
fn ps_solid_white(desc: &TriangleDesc, out: &mut PixelOutput) {
    let color = out.render_targets[ATTACHMENT_COLOR];
    desc.for_each_covered_pixel(|_, _, offset| unsafe {
        color.add(offset).cast::<u32>().write(0xffff_ffff);
    });
}

/// Pixel: constant color from the first word of the pixel constants.
fn ps_const_color(desc: &TriangleDesc, out: &mut PixelOutput) {
    let value = unsafe { *(desc.constants as *const u32) };
    let color = out.render_targets[ATTACHMENT_COLOR];
    desc.for_each_covered_pixel(|_, _, offset| unsafe {
        color.add(offset).cast::<u32>().write(value);
    });
}

/// Pixel: constant color with a LESS depth test against the depth target.
fn ps_const_color_depth_less(desc: &TriangleDesc, out: &mut PixelOutput) {
    let value = unsafe { *(desc.constants as *const u32) };
    let color = out.render_targets[ATTACHMENT_COLOR];
    let depth = out.render_targets[ATTACHMENT_DEPTH];
    desc.for_each_covered_pixel(|x, y, offset| {
        let (i, j) = desc.barycentric(x as f32 + 0.5, y as f32 + 0.5);
        let z = desc.interpolate_z(i, j);
        unsafe {
            let stored = depth.add(offset).cast::<f32>();
            if z < *stored {
                *stored = z;
                color.add(offset).cast::<u32>().write(value);
            }
        }
    });
}

/// Pixel: perspective-interpolated first linked attribute packed as BGRA.
fn ps_vertex_color(desc: &TriangleDesc, out: &mut PixelOutput) {
    let color = out.render_targets[ATTACHMENT_COLOR];
    desc.for_each_covered_pixel(|x, y, offset| {
        let (i, j) = desc.barycentric(x as f32 + 0.5, y as f32 + 0.5);
        let w = 1.0 / desc.one_over_w_at(i, j);
        let rgba = desc.attribute(0, i, j, w);
        let to_byte = |v: f32| (v.clamp(0.0, 1.0) * 255.0 + 0.5) as u32;
        let packed = to_byte(rgba[2])
            | (to_byte(rgba[1]) << 8)
            | (to_byte(rgba[0]) << 16)
            | (to_byte(rgba[3]) << 24);
        unsafe { color.add(offset).cast::<u32>().write(packed) };
    });
}

// ------------------------------------------------------------------ helpers

fn single_context(driver: DriverType) -> Context {
    Context::new(ContextConfig {
        driver,
        threading: ThreadingMode::Single,
        pin_threads: false,
        ..ContextConfig::default()
    })
}

fn pool_context(workers: usize) -> Context {
    Context::new(ContextConfig {
        driver: DriverType::Dx,
        threading: ThreadingMode::Pool,
        worker_threads: Some(workers),
        pin_threads: false,
        ..ContextConfig::default()
    })
}

/// Clip-space position that lands on screen pixel (x, y) with screen depth
/// `z` under the DX convention and the given viewport size.
fn dx_pixel_to_clip(x: f32, y: f32, z: f32, width: f32, height: f32) -> [f32; 4] {
    let half_w = width * 0.5;
    let half_h = height * 0.5;
    [x / half_w - 1.0, 1.0 - y / half_h, 2.0 * z - 1.0, 1.0]
}

fn gl_pixel_to_clip(x: f32, y: f32, z: f32, width: f32, height: f32) -> [f32; 4] {
    let half_w = width * 0.5;
    let half_h = height * 0.5;
    [x / half_w - 1.0, y / half_h - 1.0, 2.0 * z - 1.0, 1.0]
}

fn upload_f32(ctx: &mut Context, data: &[f32]) -> crate::BufferHandle {
    let handle = ctx.create_buffer(data.len() * 4, 0);
    let ptr = ctx.lock_buffer(handle, LockMode::Wait).expect("lock buffer");
    unsafe { std::ptr::copy_nonoverlapping(data.as_ptr(), ptr.cast::<f32>(), data.len()) };
    handle
}

fn upload_u32(ctx: &mut Context, data: &[u32]) -> crate::BufferHandle {
    let handle = ctx.create_buffer(data.len() * 4, 0);
    let ptr = ctx.lock_buffer(handle, LockMode::Wait).expect("lock buffer");
    unsafe { std::ptr::copy_nonoverlapping(data.as_ptr(), ptr.cast::<u32>(), data.len()) };
    handle
}

/// Bind fresh color (+ optional depth) targets and a matching viewport.
fn bind_targets(ctx: &mut Context, width: u32, height: u32, with_depth: bool) {
    let color = ctx
        .create_render_target(width, height, SurfaceFormat::Bgra8Unorm)
        .expect("color target");
    ctx.set_render_target(ATTACHMENT_COLOR, Some(color));
    if with_depth {
        let depth = ctx
            .create_render_target(width, height, SurfaceFormat::R32Float)
            .expect("depth target");
        ctx.set_render_target(ATTACHMENT_DEPTH, Some(depth));
    } else {
        ctx.set_render_target(ATTACHMENT_DEPTH, None);
    }
    ctx.set_viewport(Viewport {
        x: 0.0,
        y: 0.0,
        width: width as f32,
        height: height as f32,
        min_z: 0.0,
        max_z: 1.0,
    });
}

fn bind_draw_shaders(ctx: &mut Context, verts: &[f32]) -> crate::BufferHandle {
    let buffer = upload_f32(ctx, verts);
    ctx.set_vertex_buffer(0, Some(buffer));
    ctx.set_fetch_fn(fetch_positions);
    ctx.set_vertex_fn(vertex_passthrough);
    buffer
}

fn read_color(ctx: &mut Context, width: u32, height: u32) -> Vec<u32> {
    let mut linear = vec![0u8; (width * height * 4) as usize];
    ctx.present_to_linear(&mut linear, width as usize * 4)
        .expect("present");
    linear
        .chunks_exact(4)
        .map(|px| u32::from_le_bytes([px[0], px[1], px[2], px[3]]))
        .collect()
}

fn triangle_verts(points: &[(f32, f32)], width: f32, height: f32) -> Vec<f32> {
    points
        .iter()
        .flat_map(|&(x, y)| dx_pixel_to_clip(x, y, 0.5, width, height))
        .collect()
}

// ----------------------------------------------------------------- scenarios

#[test]
fn single_tile_triangle_covers_the_lower_left_half() {
    let mut ctx = single_context(DriverType::Dx);
    bind_targets(&mut ctx, 8, 8, false);
    let verts = triangle_verts(&[(0.0, 0.0), (8.5, 0.0), (0.0, 8.5)], 8.0, 8.0);
    let _vb = bind_draw_shaders(&mut ctx, &verts);
    ctx.set_pixel_fn(ps_solid_white);

    ctx.clear(ClearMask::COLOR, [0.0, 0.0, 0.0, 1.0], 1.0, false);
    ctx.draw(PrimitiveTopology::TriangleList, 0, 1);
    ctx.finish();

    let pixels = read_color(&mut ctx, 8, 8);
    let mut covered = 0;
    for y in 0..8u32 {
        for x in 0..8u32 {
            let value = pixels[(y * 8 + x) as usize];
            let expected = if x + y <= 7 { 0xffff_ffff } else { 0xff00_0000 };
            assert_eq!(value, expected, "pixel ({x}, {y})");
            if value == 0xffff_ffff {
                covered += 1;
            }
        }
    }
    assert_eq!(covered, 36);
}

#[test]
fn reversed_winding_is_backface_culled() {
    let mut ctx = single_context(DriverType::Dx);
    bind_targets(&mut ctx, 8, 8, false);
    // Swap two vertices to flip the winding of the scenario triangle.
    let verts = triangle_verts(&[(0.0, 0.0), (0.0, 8.5), (8.5, 0.0)], 8.0, 8.0);
    let _vb = bind_draw_shaders(&mut ctx, &verts);
    ctx.set_pixel_fn(ps_solid_white);
    ctx.set_cull_mode(CullMode::Ccw);

    ctx.clear(ClearMask::COLOR, [0.0, 0.0, 0.0, 1.0], 1.0, false);
    ctx.draw(PrimitiveTopology::TriangleList, 0, 1);
    ctx.finish();

    let pixels = read_color(&mut ctx, 8, 8);
    assert!(
        pixels.iter().all(|&px| px == 0xff00_0000),
        "culled triangle must leave the clear color untouched"
    );
    assert_eq!(ctx.counters().triangles_binned, 0);
}

#[test]
fn kept_winding_survives_backface_culling() {
    let mut ctx = single_context(DriverType::Dx);
    bind_targets(&mut ctx, 8, 8, false);
    let verts = triangle_verts(&[(0.0, 0.0), (8.5, 0.0), (0.0, 8.5)], 8.0, 8.0);
    let _vb = bind_draw_shaders(&mut ctx, &verts);
    ctx.set_pixel_fn(ps_solid_white);
    ctx.set_cull_mode(CullMode::Ccw);

    ctx.clear(ClearMask::COLOR, [0.0, 0.0, 0.0, 1.0], 1.0, false);
    ctx.draw(PrimitiveTopology::TriangleList, 0, 1);
    ctx.finish();

    assert_eq!(ctx.counters().triangles_binned, 1);
    let pixels = read_color(&mut ctx, 8, 8);
    assert_eq!(pixels[0], 0xffff_ffff);
}

#[test]
fn small_triangle_never_shades_outside_its_bounding_box() {
    let mut ctx = single_context(DriverType::Dx);
    bind_targets(&mut ctx, 32, 32, false);
    let verts = triangle_verts(&[(0.0, 0.0), (16.5, 0.0), (0.0, 16.5)], 32.0, 32.0);
    let _vb = bind_draw_shaders(&mut ctx, &verts);
    ctx.set_pixel_fn(ps_solid_white);

    ctx.clear(ClearMask::COLOR, [0.0, 0.0, 0.0, 1.0], 1.0, false);
    ctx.draw(PrimitiveTopology::TriangleList, 0, 1);
    ctx.finish();

    let pixels = read_color(&mut ctx, 32, 32);
    for y in 0..32u32 {
        for x in 0..32u32 {
            let value = pixels[(y * 32 + x) as usize];
            let expected = if x + y <= 15 { 0xffff_ffff } else { 0xff00_0000 };
            assert_eq!(value, expected, "pixel ({x}, {y})");
        }
    }
    assert!(ctx.counters().tiles_rasterized > 0);
}

/// Two full-screen triangles per color; the depth test decides the winner.
fn fullscreen_quad(width: f32, height: f32, z: f32) -> Vec<f32> {
    let corners = [
        (0.0, 0.0),
        (width, 0.0),
        (width, height),
        (0.0, 0.0),
        (width, height),
        (0.0, height),
    ];
    corners
        .iter()
        .flat_map(|&(x, y)| dx_pixel_to_clip(x, y, z, width, height))
        .collect()
}

fn depth_ordering_scenario(mut ctx: Context) {
    bind_targets(&mut ctx, 16, 16, true);
    ctx.set_fetch_fn(fetch_positions);
    ctx.set_vertex_fn(vertex_passthrough);
    ctx.set_pixel_fn(ps_const_color_depth_less);

    let green = upload_u32(&mut ctx, &[0xff00_ff00]);
    let blue = upload_u32(&mut ctx, &[0xff00_00ff]);
    let quad_half = fullscreen_quad(16.0, 16.0, 0.5);
    let quad_near = fullscreen_quad(16.0, 16.0, 0.3);
    let vb_half = upload_f32(&mut ctx, &quad_half);
    let vb_near = upload_f32(&mut ctx, &quad_near);

    // Red background, depth cleared to the far plane.
    ctx.clear(
        ClearMask::COLOR | ClearMask::DEPTH,
        [1.0, 0.0, 0.0, 1.0],
        1.0,
        false,
    );

    ctx.set_vertex_buffer(0, Some(vb_half));
    ctx.set_pixel_constants(Some(green));
    ctx.draw(PrimitiveTopology::TriangleList, 0, 2);

    ctx.set_vertex_buffer(0, Some(vb_near));
    ctx.set_pixel_constants(Some(blue));
    ctx.draw(PrimitiveTopology::TriangleList, 0, 2);
    ctx.finish();

    let pixels = read_color(&mut ctx, 16, 16);
    assert!(
        pixels.iter().all(|&px| px == 0xff00_00ff),
        "nearer second draw must win every pixel"
    );
}

#[test]
fn depth_ordering_across_draws_single_threaded() {
    depth_ordering_scenario(single_context(DriverType::Dx));
}

#[test]
fn depth_ordering_across_draws_with_worker_pool() {
    depth_ordering_scenario(pool_context(4));
}

#[test]
fn guardband_crossing_triangle_is_clipped_not_dropped() {
    let mut ctx = single_context(DriverType::Dx);
    bind_targets(&mut ctx, 16, 16, false);
    // Two vertices far outside the guardband; the visible portion covers
    // the whole target.
    let verts = triangle_verts(&[(0.0, 0.0), (10000.0, 0.0), (0.0, 10000.0)], 16.0, 16.0);
    let _vb = bind_draw_shaders(&mut ctx, &verts);
    ctx.set_pixel_fn(ps_solid_white);

    ctx.clear(ClearMask::COLOR, [0.0, 0.0, 0.0, 1.0], 1.0, false);
    ctx.draw(PrimitiveTopology::TriangleList, 0, 1);
    ctx.finish();

    // The clipper fanned the polygon into several triangles.
    assert!(
        ctx.counters().triangles_binned >= 2,
        "expected a clipped fan, got {} triangles",
        ctx.counters().triangles_binned
    );
    let pixels = read_color(&mut ctx, 16, 16);
    assert!(pixels.iter().all(|&px| px == 0xffff_ffff));
}

#[test]
fn in_frustum_triangle_skips_the_clipper() {
    let mut ctx = single_context(DriverType::Dx);
    bind_targets(&mut ctx, 16, 16, false);
    let verts = triangle_verts(&[(2.0, 2.0), (10.0, 3.0), (3.0, 11.0)], 16.0, 16.0);
    let _vb = bind_draw_shaders(&mut ctx, &verts);
    ctx.set_pixel_fn(ps_solid_white);

    ctx.clear(ClearMask::COLOR, [0.0, 0.0, 0.0, 1.0], 1.0, false);
    ctx.draw(PrimitiveTopology::TriangleList, 0, 1);
    ctx.finish();

    // One triangle in, one triangle binned: no clipper fan.
    assert_eq!(ctx.counters().triangles_binned, 1);
}

#[test]
fn scissored_clear_only_touches_the_scissor_rect() {
    let mut ctx = single_context(DriverType::Dx);
    bind_targets(&mut ctx, 16, 16, false);

    ctx.clear(ClearMask::COLOR, [1.0, 0.0, 0.0, 1.0], 1.0, false);
    ctx.enable_scissor(true);
    ctx.set_scissor_rect(4, 4, 12, 12);
    ctx.clear(ClearMask::COLOR, [0.0, 0.0, 1.0, 1.0], 1.0, true);
    ctx.enable_scissor(false);
    ctx.finish();

    let pixels = read_color(&mut ctx, 16, 16);
    let mut inside = 0;
    for y in 0..16i32 {
        for x in 0..16i32 {
            let value = pixels[(y * 16 + x) as usize];
            let in_scissor = (4..12).contains(&x) && (4..12).contains(&y);
            if in_scissor {
                assert_eq!(value, 0xff00_00ff, "pixel ({x}, {y}) inside scissor");
                inside += 1;
            } else {
                assert_eq!(value, 0xffff_0000, "pixel ({x}, {y}) outside scissor");
            }
        }
    }
    assert_eq!(inside, 64);
}

#[test]
fn scissor_clips_triangle_coverage() {
    let mut ctx = single_context(DriverType::Dx);
    bind_targets(&mut ctx, 16, 16, false);
    let verts = triangle_verts(&[(0.0, 0.0), (40.0, 0.0), (0.0, 40.0)], 16.0, 16.0);
    let _vb = bind_draw_shaders(&mut ctx, &verts);
    ctx.set_pixel_fn(ps_solid_white);

    ctx.clear(ClearMask::COLOR, [0.0, 0.0, 0.0, 1.0], 1.0, false);
    ctx.enable_scissor(true);
    ctx.set_scissor_rect(4, 4, 12, 12);
    ctx.draw(PrimitiveTopology::TriangleList, 0, 1);
    ctx.enable_scissor(false);
    ctx.finish();

    let pixels = read_color(&mut ctx, 16, 16);
    for y in 0..16i32 {
        for x in 0..16i32 {
            let value = pixels[(y * 16 + x) as usize];
            let in_scissor = (4..12).contains(&x) && (4..12).contains(&y);
            // The triangle covers the whole scissor window.
            let expected = if in_scissor { 0xffff_ffff } else { 0xff00_0000 };
            assert_eq!(value, expected, "pixel ({x}, {y})");
        }
    }
}

#[test]
fn triangle_strip_decomposes_into_n_triangles() {
    let mut ctx = single_context(DriverType::Dx);
    bind_targets(&mut ctx, 8, 8, false);
    // Strip quad: 4 vertices, 2 triangles, full coverage.
    let verts = triangle_verts(
        &[(0.0, 0.0), (0.0, 8.5), (8.5, 0.0), (8.5, 8.5)],
        8.0,
        8.0,
    );
    let _vb = bind_draw_shaders(&mut ctx, &verts);
    ctx.set_pixel_fn(ps_solid_white);

    ctx.clear(ClearMask::COLOR, [0.0, 0.0, 0.0, 1.0], 1.0, false);
    ctx.draw(PrimitiveTopology::TriangleStrip, 0, 2);
    ctx.finish();

    assert_eq!(ctx.counters().triangles_binned, 2);
    let pixels = read_color(&mut ctx, 8, 8);
    assert!(pixels.iter().all(|&px| px == 0xffff_ffff));
}

#[test]
fn quad_list_diagonal_covers_each_pixel_once() {
    let mut ctx = single_context(DriverType::Dx);
    bind_targets(&mut ctx, 8, 8, false);
    let verts = triangle_verts(
        &[(0.0, 0.0), (8.5, 0.0), (8.5, 8.5), (0.0, 8.5)],
        8.0,
        8.0,
    );
    let _vb = bind_draw_shaders(&mut ctx, &verts);
    ctx.set_pixel_fn(ps_solid_white);

    ctx.clear(ClearMask::COLOR, [0.0, 0.0, 0.0, 1.0], 1.0, false);
    ctx.draw(PrimitiveTopology::QuadList, 0, 1);
    ctx.finish();

    assert_eq!(ctx.counters().triangles_binned, 2);
    let pixels = read_color(&mut ctx, 8, 8);
    assert!(pixels.iter().all(|&px| px == 0xffff_ffff));
}

#[test]
fn points_fatten_to_one_pixel_squares() {
    let mut ctx = single_context(DriverType::Dx);
    bind_targets(&mut ctx, 16, 16, false);
    let verts = triangle_verts(&[(3.5, 3.5)], 16.0, 16.0);
    let _vb = bind_draw_shaders(&mut ctx, &verts);
    ctx.set_pixel_fn(ps_solid_white);

    ctx.clear(ClearMask::COLOR, [0.0, 0.0, 0.0, 1.0], 1.0, false);
    ctx.draw(PrimitiveTopology::PointList, 0, 1);
    ctx.finish();

    let pixels = read_color(&mut ctx, 16, 16);
    for y in 0..16u32 {
        for x in 0..16u32 {
            let expected = if (x, y) == (3, 3) { 0xffff_ffff } else { 0xff00_0000 };
            assert_eq!(pixels[(y * 16 + x) as usize], expected, "pixel ({x}, {y})");
        }
    }
}

#[test]
fn lines_fatten_to_half_pixel_quads() {
    let mut ctx = single_context(DriverType::Dx);
    bind_targets(&mut ctx, 16, 16, false);
    let verts = triangle_verts(&[(2.0, 4.5), (14.0, 4.5)], 16.0, 16.0);
    let _vb = bind_draw_shaders(&mut ctx, &verts);
    ctx.set_pixel_fn(ps_solid_white);

    ctx.clear(ClearMask::COLOR, [0.0, 0.0, 0.0, 1.0], 1.0, false);
    ctx.draw(PrimitiveTopology::LineList, 0, 1);
    ctx.finish();

    let pixels = read_color(&mut ctx, 16, 16);
    for y in 0..16u32 {
        for x in 0..16u32 {
            let expected = if y == 4 && (2..14).contains(&x) {
                0xffff_ffff
            } else {
                0xff00_0000
            };
            assert_eq!(pixels[(y * 16 + x) as usize], expected, "pixel ({x}, {y})");
        }
    }
}

#[test]
fn indexed_draws_follow_the_index_buffer() {
    let mut ctx = single_context(DriverType::Dx);
    bind_targets(&mut ctx, 8, 8, false);
    // Four vertices; indices pick the lower-left triangle.
    let verts = triangle_verts(
        &[(8.5, 8.5), (0.0, 0.0), (8.5, 0.0), (0.0, 8.5)],
        8.0,
        8.0,
    );
    let _vb = bind_draw_shaders(&mut ctx, &verts);
    ctx.set_pixel_fn(ps_solid_white);

    // u16 indices [1, 2, 3], two per little-endian word.
    let index_words = [1u32 | (2 << 16), 3];
    let ib = upload_u32(&mut ctx, &index_words);
    ctx.set_index_buffer(Some(ib));

    ctx.clear(ClearMask::COLOR, [0.0, 0.0, 0.0, 1.0], 1.0, false);
    ctx.draw_indexed(PrimitiveTopology::TriangleList, IndexType::U16, 3, 0);
    ctx.finish();

    let pixels = read_color(&mut ctx, 8, 8);
    let mut covered = 0;
    for y in 0..8u32 {
        for x in 0..8u32 {
            if pixels[(y * 8 + x) as usize] == 0xffff_ffff {
                covered += 1;
            }
        }
    }
    assert_eq!(covered, 36);
}

#[test]
fn instanced_draws_submit_one_chunk_per_instance() {
    let mut ctx = single_context(DriverType::Dx);
    bind_targets(&mut ctx, 8, 8, false);
    let verts = triangle_verts(&[(0.0, 0.0), (8.5, 0.0), (0.0, 8.5)], 8.0, 8.0);
    let _vb = bind_draw_shaders(&mut ctx, &verts);
    ctx.set_pixel_fn(ps_solid_white);
    let ib = upload_u32(&mut ctx, &[0, 1, 2]);
    ctx.set_index_buffer(Some(ib));

    let before = ctx.counters().draws_submitted;
    ctx.draw_indexed_instanced(PrimitiveTopology::TriangleList, IndexType::U32, 3, 3, 0);
    ctx.finish();
    assert_eq!(ctx.counters().draws_submitted - before, 3);
    assert_eq!(ctx.counters().triangles_binned, 3);
}

#[test]
fn vertex_colors_interpolate_across_the_triangle() {
    let mut ctx = single_context(DriverType::Dx);
    bind_targets(&mut ctx, 8, 8, false);

    // Position + color per vertex; red at the top-left corner fading to
    // black at the far corners.
    let positions = [(0.0f32, 0.0f32), (8.5, 0.0), (0.0, 8.5)];
    let colors = [[1.0f32, 0.0, 0.0, 1.0], [0.0; 4], [0.0; 4]];
    let mut verts = Vec::new();
    for (pos, color) in positions.iter().zip(colors.iter()) {
        verts.extend_from_slice(&dx_pixel_to_clip(pos.0, pos.1, 0.5, 8.0, 8.0));
        verts.extend_from_slice(color);
    }
    let vb = upload_f32(&mut ctx, &verts);
    ctx.set_vertex_buffer(0, Some(vb));
    ctx.set_fetch_fn(fetch_positions_colors);
    ctx.set_vertex_fn(vertex_passthrough);
    ctx.set_pixel_fn(ps_vertex_color);
    let color_mask = model::vs_slot_mask(VS_SLOT_COLOR0);
    ctx.set_linkage_mask_front(color_mask);
    ctx.set_linkage_mask_back(color_mask);

    ctx.clear(ClearMask::COLOR, [0.0, 0.0, 0.0, 1.0], 1.0, false);
    ctx.draw(PrimitiveTopology::TriangleList, 0, 1);
    ctx.finish();

    let pixels = read_color(&mut ctx, 8, 8);
    // Red falls off with distance from the top-left vertex.
    let red = |px: u32| (px >> 16) & 0xff;
    assert!(red(pixels[0]) > 200, "corner should be near-red");
    assert!(red(pixels[3]) > red(pixels[6]), "red must fade along x");
    assert!(red(pixels[8]) > red(pixels[4 * 8]), "red must fade along y");
}

#[test]
fn gl_driver_flips_y_on_store() {
    let mut ctx = single_context(DriverType::Gl);
    bind_targets(&mut ctx, 8, 8, false);
    // Cover only screen pixel (0, 0) (GL origin bottom-left).
    let verts: Vec<f32> = [(0.0, 0.0), (1.5, 0.0), (0.0, 1.5)]
        .iter()
        .flat_map(|&(x, y)| gl_pixel_to_clip(x, y, 0.5, 8.0, 8.0))
        .collect();
    let _vb = bind_draw_shaders(&mut ctx, &verts);
    ctx.set_pixel_fn(ps_solid_white);

    ctx.clear(ClearMask::COLOR, [0.0, 0.0, 0.0, 1.0], 1.0, false);
    ctx.draw(PrimitiveTopology::TriangleList, 0, 1);
    ctx.finish();

    let pixels = read_color(&mut ctx, 8, 8);
    // Screen row 0 is stored as the bottom row of the linear image.
    assert_eq!(pixels[7 * 8], 0xffff_ffff);
    assert_eq!(pixels[0], 0xff00_0000);
}

#[test]
fn many_draws_preserve_pixel_order_and_all_retire() {
    let mut ctx = pool_context(4);
    bind_targets(&mut ctx, 16, 16, false);
    ctx.set_fetch_fn(fetch_positions);
    ctx.set_vertex_fn(vertex_passthrough);
    ctx.set_pixel_fn(ps_const_color);
    let quad = fullscreen_quad(16.0, 16.0, 0.5);
    let vb = upload_f32(&mut ctx, &quad);
    ctx.set_vertex_buffer(0, Some(vb));

    let (sender, receiver) = crossbeam_channel::unbounded();

    ctx.clear(ClearMask::COLOR, [0.0, 0.0, 0.0, 1.0], 1.0, false);
    let draws = 24u32;
    let mut constants = Vec::new();
    for i in 0..draws {
        let color = 0xff00_0000 | i;
        let constant = upload_u32(&mut ctx, &[color]);
        constants.push(constant);
        ctx.set_pixel_constants(Some(constant));
        let sender = sender.clone();
        ctx.set_on_complete(Box::new(move |dc| {
            let _ = sender.send(dc.draw_index.load(Ordering::Relaxed));
        }));
        ctx.draw(PrimitiveTopology::TriangleList, 0, 2);
    }
    ctx.finish();

    // Every draw's completion callback fired exactly once. (Callback
    // delivery order across workers is not part of the ordering contract;
    // pixel order below is.)
    let mut received: Vec<u64> = receiver.try_iter().collect();
    received.sort_unstable();
    let expected: Vec<u64> = (1..=draws as u64).collect();
    assert_eq!(received, expected);

    // The last draw's color wins every pixel: backend work per tile drains
    // strictly in submission order.
    let pixels = read_color(&mut ctx, 16, 16);
    assert!(pixels.iter().all(|&px| px == 0xff00_0000 | (draws - 1)));
}

#[test]
fn draw_chunking_splits_large_submissions() {
    let mut ctx = single_context(DriverType::Dx);
    bind_targets(&mut ctx, 8, 8, false);

    // One tiny off-screen triangle repeated past the chunk limit.
    let tri = triangle_verts(&[(0.25, 0.25), (0.75, 0.25), (0.25, 0.75)], 8.0, 8.0);
    let reps = crate::config::MAX_PRIMS_PER_DRAW + 100;
    let mut verts = Vec::new();
    for _ in 0..reps {
        verts.extend_from_slice(&tri);
    }
    let _vb = bind_draw_shaders(&mut ctx, &verts);
    ctx.set_pixel_fn(ps_solid_white);

    let before = ctx.counters().draws_submitted;
    ctx.draw(PrimitiveTopology::TriangleList, 0, reps);
    ctx.finish();
    assert_eq!(ctx.counters().draws_submitted - before, 2);
}

#[test]
fn user_pointer_buffers_are_safe_to_reuse_after_draw() {
    let mut ctx = single_context(DriverType::Dx);
    bind_targets(&mut ctx, 8, 8, false);

    let mut verts = triangle_verts(&[(0.0, 0.0), (8.5, 0.0), (0.0, 8.5)], 8.0, 8.0);
    let vb = unsafe { ctx.create_buffer_from_ptr(verts.as_mut_ptr().cast(), verts.len() * 4) };
    ctx.set_vertex_buffer(0, Some(vb));
    ctx.set_fetch_fn(fetch_positions);
    ctx.set_vertex_fn(vertex_passthrough);
    ctx.set_pixel_fn(ps_solid_white);

    ctx.clear(ClearMask::COLOR, [0.0, 0.0, 0.0, 1.0], 1.0, false);
    ctx.draw(PrimitiveTopology::TriangleList, 0, 1);
    // The draw call returned, so the frontend is done with `verts` and the
    // caller may scribble over it.
    verts.fill(0.0);
    ctx.finish();

    let pixels = read_color(&mut ctx, 8, 8);
    assert_eq!(pixels[0], 0xffff_ffff);
    ctx.destroy_buffer(vb);
}

#[test]
fn copy_to_linear_reads_back_the_depth_target() {
    let mut ctx = single_context(DriverType::Dx);
    bind_targets(&mut ctx, 8, 8, true);
    ctx.clear(ClearMask::DEPTH, [0.0; 4], 0.25, false);

    let mut linear = vec![0u8; 8 * 8 * 4];
    ctx.copy_to_linear(
        ATTACHMENT_DEPTH,
        Bbox::new(0, 0, 7, 7),
        &mut linear,
        8 * 4,
        SurfaceFormat::R32Float,
    )
    .expect("depth readback");

    for chunk in linear.chunks_exact(4) {
        let value = f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        assert_eq!(value, 0.25);
    }
}

#[cfg(debug_assertions)]
#[test]
#[should_panic(expected = "submission dropped")]
fn empty_draws_fail_loudly_in_debug() {
    let mut ctx = single_context(DriverType::Dx);
    bind_targets(&mut ctx, 8, 8, false);
    ctx.draw(PrimitiveTopology::TriangleList, 0, 0);
}

#[cfg(debug_assertions)]
#[test]
#[should_panic(expected = "submission dropped")]
fn draws_without_shaders_fail_loudly_in_debug() {
    let mut ctx = single_context(DriverType::Dx);
    bind_targets(&mut ctx, 8, 8, false);
    // No fetch/vertex/pixel shaders bound; the draw must be rejected before
    // it can reach the pipeline.
    ctx.draw(PrimitiveTopology::TriangleList, 0, 1);
}

#[test]
fn lane_width_matches_the_shader_contract() {
    let ctx = single_context(DriverType::Dx);
    assert_eq!(ctx.lane_width(), LANES);
}
