//! Backend triangle rasterization: edge-equation evaluation over pixel
//! tiles, coverage-mask construction and quad-rate pixel dispatch. Three
//! entry points share the same setup; large triangles evaluate the anchor in
//! 64-bit, small ones (bbox <= 128px) stay in 32-bit, one-tile triangles
//! arrive with their mask prebaked by the frontend.

use model::{
    Bbox, FIXED_POINT_ONE, FIXED_POINT_SHIFT, TILE_DIM, TILE_DIM_SHIFT, coverage_bit, to_fixed,
};

use crate::draw::{BeWorkDesc, DrawContext, TriangleWorkDesc};
use crate::shader::{
    ATTACHMENT_COLOR, ATTACHMENT_DEPTH, NUM_ATTACHMENTS, PixelOutput, TriangleDesc,
};
use crate::stats::PipelineCounters;

/// Winding-normalized edge equations of one triangle: the interior always
/// evaluates negative, so coverage is the AND of sign bits.
#[derive(Debug, Clone, Copy)]
pub(crate) struct EdgeSet {
    pub a: [i32; 3],
    pub b: [i32; 3],
    /// Fixed-point vertex coordinates the edges anchor to.
    pub x: [i32; 3],
    pub y: [i32; 3],
}

impl EdgeSet {
    /// Top-left rule bias per edge: left and top edges include their
    /// boundary pixels, right and bottom edges exclude them.
    #[inline]
    fn bias(&self, e: usize) -> i64 {
        if self.a[e] < 0 || (self.a[e] == 0 && self.b[e] < 0) {
            1
        } else {
            0
        }
    }

    /// Evaluate edge `e` at a fixed-point position with 64-bit products and
    /// the top-left adjustment applied.
    #[inline]
    fn eval_64(&self, e: usize, px: i32, py: i32) -> i64 {
        let dx = (px - self.x[e]) as i64;
        let dy = (py - self.y[e]) as i64;
        ((self.a[e] as i64 * dx + self.b[e] as i64 * dy) >> FIXED_POINT_SHIFT) - self.bias(e)
    }

    /// 32-bit variant; valid when the triangle bbox keeps the products in
    /// range (the small-triangle classification guarantees it).
    #[inline]
    fn eval_32(&self, e: usize, px: i32, py: i32) -> i64 {
        let dx = px.wrapping_sub(self.x[e]);
        let dy = py.wrapping_sub(self.y[e]);
        let value = self.a[e].wrapping_mul(dx).wrapping_add(self.b[e].wrapping_mul(dy));
        ((value >> FIXED_POINT_SHIFT) as i64) - self.bias(e)
    }
}

/// Center of the top-left pixel of a tile, in fixed point.
#[inline]
fn tile_anchor(tile: i32) -> i32 {
    (tile << (TILE_DIM_SHIFT + FIXED_POINT_SHIFT)) + FIXED_POINT_ONE / 2
}

/// Walk the 8x8 tile whose anchor edge values are `anchor` and collect the
/// coverage mask; pixel steps add the (shifted-down) edge terms directly.
/// `scissor`, when present, contributes four more inclusive edges evaluated
/// against pixel centers.
fn partial_tile_mask(
    anchor: [i64; 3],
    a: [i64; 3],
    b: [i64; 3],
    tile_px: (i32, i32),
    scissor: Option<&Bbox>,
) -> u64 {
    let mut mask = 0u64;
    for y in 0..TILE_DIM as i64 {
        for x in 0..TILE_DIM as i64 {
            let e0 = anchor[0] + a[0] * x + b[0] * y;
            let e1 = anchor[1] + a[1] * x + b[1] * y;
            let e2 = anchor[2] + a[2] * x + b[2] * y;
            if e0 < 0 && e1 < 0 && e2 < 0 {
                if let Some(rect) = scissor {
                    let cx = ((tile_px.0 as i64 + x) << FIXED_POINT_SHIFT) as i32
                        + FIXED_POINT_ONE / 2;
                    let cy = ((tile_px.1 as i64 + y) << FIXED_POINT_SHIFT) as i32
                        + FIXED_POINT_ONE / 2;
                    if cx < rect.left || cx > rect.right || cy < rect.top || cy > rect.bottom {
                        continue;
                    }
                }
                mask |= 1u64 << coverage_bit(x as u32, y as u32);
            }
        }
    }
    mask
}

/// Early-rast for the frontend: full coverage mask of a triangle whose
/// scissored bounds are a single tile. The anchor uses 64-bit products: the
/// scissor clamp means the vertices themselves may sit far outside the tile.
pub(crate) fn one_tile_coverage(
    edges: &EdgeSet,
    tile_x: i32,
    tile_y: i32,
    scissor: Option<&Bbox>,
) -> u64 {
    let px = tile_anchor(tile_x);
    let py = tile_anchor(tile_y);
    let anchor = [
        edges.eval_64(0, px, py),
        edges.eval_64(1, px, py),
        edges.eval_64(2, px, py),
    ];
    let a = [edges.a[0] as i64, edges.a[1] as i64, edges.a[2] as i64];
    let b = [edges.b[0] as i64, edges.b[1] as i64, edges.b[2] as i64];
    partial_tile_mask(
        anchor,
        a,
        b,
        (tile_x << TILE_DIM_SHIFT, tile_y << TILE_DIM_SHIFT),
        scissor,
    )
}

struct TriangleSetup {
    desc: TriangleDesc,
    output: PixelOutput,
    edges: EdgeSet,
    /// Tile-space bounds: triangle bbox, scissor and owning macro tile
    /// already intersected.
    tile_bounds: Bbox,
    needs_scissor: bool,
}

/// Shared setup for all three rasterizer entry points. Returns `None` when
/// the triangle does not intersect this macro tile after clamping.
fn setup_triangle(dc: &DrawContext, tri: &TriangleWorkDesc) -> Option<TriangleSetup> {
    let state = dc.state();

    // Unpack the arena triangle record written by the binner.
    let buffer = unsafe { std::slice::from_raw_parts(tri.tri_buffer, 16) };
    let sx = [buffer[0], buffer[1], buffer[2]];
    let sy = [buffer[4], buffer[5], buffer[6]];
    let sz = [buffer[8], buffer[9], buffer[10]];
    let rw = [buffer[12], buffer[13], buffer[14]];

    let xi = [to_fixed(sx[0]), to_fixed(sx[1]), to_fixed(sx[2])];
    let yi = [to_fixed(sy[0]), to_fixed(sy[1]), to_fixed(sy[2])];

    let mut edges = EdgeSet {
        a: [yi[0] - yi[1], yi[1] - yi[2], yi[2] - yi[0]],
        b: [xi[1] - xi[0], xi[2] - xi[1], xi[0] - xi[2]],
        x: xi,
        y: yi,
    };
    let det = edges.a[1] as i64 * edges.b[2] as i64 - edges.a[2] as i64 * edges.b[1] as i64;

    // Float edge terms feed the barycentric setup; normalize both
    // representations together so the interior evaluates negative.
    let mut af = [sy[0] - sy[1], sy[1] - sy[2], sy[2] - sy[0]];
    let mut bf = [sx[1] - sx[0], sx[2] - sx[1], sx[0] - sx[2]];
    let mut det_f = (det as f64 / (FIXED_POINT_ONE as f64 * FIXED_POINT_ONE as f64)) as f32;
    if det > 0 {
        for e in 0..3 {
            edges.a[e] = -edges.a[e];
            edges.b[e] = -edges.b[e];
            af[e] = -af[e];
            bf[e] = -bf[e];
        }
        det_f = -det_f;
    }
    let cf = [
        -af[0] * sx[0] - bf[0] * sy[0],
        -af[1] * sx[1] - bf[1] * sy[1],
        -af[2] * sx[2] - bf[2] * sy[2],
    ];
    let recip_det = 1.0 / det_f;

    // Tile-space bounds: triangle bbox clamped to scissor and macro tile.
    let shift = TILE_DIM_SHIFT + FIXED_POINT_SHIFT;
    let bbox = Bbox::new(
        xi[0].min(xi[1]).min(xi[2]) >> shift,
        yi[0].min(yi[1]).min(yi[2]) >> shift,
        xi[0].max(xi[1]).max(xi[2]) >> shift,
        yi[0].max(yi[1]).max(yi[2]) >> shift,
    );
    let macro_left = tri.flags.macro_x as i32 * state.macro_width_in_tiles as i32;
    let macro_top = tri.flags.macro_y as i32 * state.macro_height_in_tiles as i32;
    let macro_box = Bbox::new(
        macro_left,
        macro_top,
        macro_left + state.macro_width_in_tiles as i32 - 1,
        macro_top + state.macro_height_in_tiles as i32 - 1,
    );
    let tile_bounds = bbox
        .intersect(&state.scissor_in_tiles)
        .intersect(&macro_box);
    if tile_bounds.is_empty() {
        return None;
    }
    let needs_scissor = state.scissor_cuts_tiles(&tile_bounds);

    let color = state.render_targets[ATTACHMENT_COLOR].as_ref();
    let depth = state.render_targets[ATTACHMENT_DEPTH].as_ref();
    let row_pitch = color.or(depth).map_or(0, |rt| rt.row_pitch());

    let i = [af[1], bf[1], cf[1]];
    let j = [af[2], bf[2], cf[2]];
    let z = [sz[0] - sz[2], sz[1] - sz[2], sz[2]];
    let one_over_w = [rw[0] - rw[2], rw[1] - rw[2], rw[2]];

    let desc = TriangleDesc {
        i,
        j,
        z,
        one_over_w,
        recip_det,
        z_step_x: (z[0] * i[0] + z[1] * j[0]) * recip_det,
        z_step_y: (z[0] * i[1] + z[1] * j[1]) * recip_det,
        interp_buffer: tri.interp_buffer,
        tile_x: 0,
        tile_y: 0,
        row_pitch,
        coverage_mask: 0,
        back_facing: tri.flags.back_facing,
        constants: state
            .pixel_constants
            .as_ref()
            .map_or(std::ptr::null(), |alloc| alloc.ptr() as *const u8),
        texture_views: state.texture_views,
        samplers: state.samplers,
    };
    let mut output = PixelOutput {
        render_targets: [std::ptr::null_mut(); NUM_ATTACHMENTS],
    };
    if let Some(rt) = color {
        output.render_targets[ATTACHMENT_COLOR] = rt.tile_data();
    }
    if let Some(rt) = depth {
        output.render_targets[ATTACHMENT_DEPTH] = rt.tile_data();
    }

    Some(TriangleSetup {
        desc,
        output,
        edges,
        tile_bounds,
        needs_scissor,
    })
}

fn rasterize_triangle(dc: &DrawContext, tri: &TriangleWorkDesc, use_64bit: bool) {
    let Some(mut setup) = setup_triangle(dc, tri) else {
        return;
    };
    let state = dc.state();
    let bounds = setup.tile_bounds;
    let edges = setup.edges;
    let scissor = setup.needs_scissor.then_some(&state.scissor_in_fixed);

    // Evaluate the three edges once at the top-left pixel center of the
    // bounds, then step across tiles by integer addition.
    let px0 = tile_anchor(bounds.left);
    let py0 = tile_anchor(bounds.top);
    let mut row_e = [0i64; 3];
    for e in 0..3 {
        row_e[e] = if use_64bit {
            edges.eval_64(e, px0, py0)
        } else {
            edges.eval_32(e, px0, py0)
        };
    }
    let a = [edges.a[0] as i64, edges.a[1] as i64, edges.a[2] as i64];
    let b = [edges.b[0] as i64, edges.b[1] as i64, edges.b[2] as i64];
    let tile = TILE_DIM as i64;

    for tile_y in bounds.top..=bounds.bottom {
        let mut e = row_e;
        for tile_x in bounds.left..=bounds.right {
            // Per-edge sign masks at the four tile corners.
            let mut inside = [0u32; 3];
            for k in 0..3 {
                let corners = [
                    e[k],
                    e[k] + a[k] * (tile - 1),
                    e[k] + b[k] * (tile - 1),
                    e[k] + a[k] * (tile - 1) + b[k] * (tile - 1),
                ];
                for (c, value) in corners.iter().enumerate() {
                    if *value < 0 {
                        inside[k] |= 1 << c;
                    }
                }
            }

            let trivially_rejected = inside.iter().any(|&m| m == 0);
            if !trivially_rejected {
                let coverage = if inside.iter().all(|&m| m == 0xf) && !setup.needs_scissor {
                    u64::MAX
                } else {
                    partial_tile_mask(
                        e,
                        a,
                        b,
                        (tile_x << TILE_DIM_SHIFT, tile_y << TILE_DIM_SHIFT),
                        scissor,
                    )
                };
                if coverage != 0 {
                    setup.desc.tile_x = tile_x as u32;
                    setup.desc.tile_y = tile_y as u32;
                    setup.desc.coverage_mask = coverage;
                    (state.pixel_fn)(&setup.desc, &mut setup.output);
                    PipelineCounters::bump(&state.counters.tiles_rasterized, 1);
                }
            }

            for k in 0..3 {
                e[k] += a[k] * tile;
            }
        }
        for k in 0..3 {
            row_e[k] += b[k] * tile;
        }
    }
}

/// Backend entry: triangles whose bbox exceeds the small-triangle bound.
pub(crate) fn rast_large_tri(dc: &DrawContext, _tile_id: u32, desc: &BeWorkDesc) {
    let BeWorkDesc::Triangle(tri) = desc else {
        debug_assert!(false, "triangle rasterizer got non-triangle work");
        return;
    };
    rasterize_triangle(dc, tri, true);
}

/// Backend entry: bbox fits in 128x128 px, 32-bit anchor math is exact.
pub(crate) fn rast_small_tri(dc: &DrawContext, _tile_id: u32, desc: &BeWorkDesc) {
    let BeWorkDesc::Triangle(tri) = desc else {
        debug_assert!(false, "triangle rasterizer got non-triangle work");
        return;
    };
    rasterize_triangle(dc, tri, false);
}

/// Backend entry: single-tile triangle with a frontend-prebaked mask.
pub(crate) fn rast_one_tile_tri(dc: &DrawContext, _tile_id: u32, desc: &BeWorkDesc) {
    let BeWorkDesc::Triangle(tri) = desc else {
        debug_assert!(false, "triangle rasterizer got non-triangle work");
        return;
    };
    let Some(mut setup) = setup_triangle(dc, tri) else {
        return;
    };
    let state = dc.state();
    setup.desc.tile_x = setup.tile_bounds.left as u32;
    setup.desc.tile_y = setup.tile_bounds.top as u32;
    setup.desc.coverage_mask = tri.flags.coverage_mask;
    (state.pixel_fn)(&setup.desc, &mut setup.output);
    PipelineCounters::bump(&state.counters.tiles_rasterized, 1);
}
