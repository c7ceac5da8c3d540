//! Frontend: everything between a claimed draw context and the macro-tile
//! FIFOs. Vertices are shaded in lane batches into a post-transform buffer,
//! assembled into triangles by topology, clipped/culled/set up, and binned
//! as backend work items.

use std::collections::HashMap;
use std::sync::atomic::Ordering;

use model::simd::{LANES, LaneVec4};
use model::{
    Bbox, CullMode, DriverType, FIXED_POINT_SHIFT, IndexType, PrimitiveTopology, SMALL_TRI_TILES,
    TILE_DIM_SHIFT, VS_SLOT_COUNT, to_fixed,
};
use smallvec::SmallVec;

use crate::clip::{ClipVertex, GUARDBAND_CLIP_MASK, clip_triangle};
use crate::clip::{
    FRUSTUM_BOTTOM, FRUSTUM_FAR, FRUSTUM_LEFT, FRUSTUM_NEAR, FRUSTUM_RIGHT, FRUSTUM_TOP,
    GUARDBAND_BOTTOM, GUARDBAND_LEFT, GUARDBAND_RIGHT, GUARDBAND_TOP,
};
use crate::draw::{
    BeWork, BeWorkDesc, DrawContext, FeDrawDesc, FeWorkDesc, TriFlags, TriangleWorkDesc,
    VertexSource,
};
use crate::rasterizer::{self, EdgeSet};
use crate::shader::{FetchInfo, MAX_VERTEX_STREAMS, VertexInput, VertexOutput};
use crate::state::DrawState;
use crate::stats::PipelineCounters;

/// Post-transform vertex buffer: clip-space position plus the union-linkage
/// attributes of every shaded vertex, indexed by dense slot.
pub(crate) struct PostTransform {
    data: Vec<f32>,
    stride: usize,
    slot_offsets: [u8; VS_SLOT_COUNT],
}

const SLOT_ABSENT: u8 = u8::MAX;

impl PostTransform {
    fn new(linkage_union: u32, num_vertices: usize) -> Self {
        let mut slot_offsets = [SLOT_ABSENT; VS_SLOT_COUNT];
        let mut attr_count = 0u8;
        let mut mask = linkage_union;
        while mask != 0 {
            let slot = mask.trailing_zeros() as usize;
            mask &= mask - 1;
            slot_offsets[slot] = attr_count;
            attr_count += 1;
        }
        let stride = 4 + attr_count as usize * 4;
        PostTransform {
            data: vec![0.0; stride * num_vertices],
            stride,
            slot_offsets,
        }
    }

    fn write_vertex_lane(&mut self, vert: usize, out: &VertexOutput, lane: usize) {
        let base = vert * self.stride;
        let position = out.position.lane(lane);
        self.data[base..base + 4].copy_from_slice(&position);
        for slot in 0..VS_SLOT_COUNT {
            let offset = self.slot_offsets[slot];
            if offset == SLOT_ABSENT {
                continue;
            }
            let lane_base = base + 4 + offset as usize * 4;
            self.data[lane_base..lane_base + 4].copy_from_slice(&out.attributes[slot].lane(lane));
        }
    }

    fn position(&self, vert: u32) -> [f32; 4] {
        let base = vert as usize * self.stride;
        [
            self.data[base],
            self.data[base + 1],
            self.data[base + 2],
            self.data[base + 3],
        ]
    }

    fn attr(&self, vert: u32, slot: usize) -> [f32; 4] {
        let offset = self.slot_offsets[slot];
        debug_assert_ne!(offset, SLOT_ABSENT, "attribute slot not linked");
        let base = vert as usize * self.stride + 4 + offset as usize * 4;
        [
            self.data[base],
            self.data[base + 1],
            self.data[base + 2],
            self.data[base + 3],
        ]
    }
}

/// Where triangle attributes come from: the draw's post-transform buffer or
/// the output of the polygon clipper.
pub(crate) enum AttrSource<'a> {
    Post(&'a PostTransform),
    Clipped(&'a [ClipVertex]),
}

impl AttrSource<'_> {
    fn attr(&self, vert: u32, slot: usize) -> [f32; 4] {
        match self {
            AttrSource::Post(pt) => pt.attr(vert, slot),
            AttrSource::Clipped(verts) => verts[vert as usize].attrs[slot],
        }
    }
}

/// Up to `LANES` assembled triangles in SoA form, plus the per-lane vertex
/// references used for attribute gathering.
#[derive(Default)]
pub(crate) struct TriBatch {
    pub pos: [LaneVec4; 3],
    pub corners: [[u32; 3]; LANES],
    /// Triangle parity within its source primitive; selects the bloat
    /// pattern for fattened lines and points.
    pub parity: [u8; LANES],
    pub count: usize,
}

fn compute_clip_code(state: &DrawState, v: [f32; 4]) -> u32 {
    let [x, y, z, w] = v;
    let gb = &state.guardband;
    let mut code = 0;
    if x < -w {
        code |= FRUSTUM_LEFT;
    }
    if y < -w {
        code |= FRUSTUM_TOP;
    }
    if x > w {
        code |= FRUSTUM_RIGHT;
    }
    if y > w {
        code |= FRUSTUM_BOTTOM;
    }
    if z < -w {
        code |= FRUSTUM_NEAR;
    }
    if z > w {
        code |= FRUSTUM_FAR;
    }
    if x < -gb.left * w {
        code |= GUARDBAND_LEFT;
    }
    if y < -gb.top * w {
        code |= GUARDBAND_TOP;
    }
    if x > gb.right * w {
        code |= GUARDBAND_RIGHT;
    }
    if y > gb.bottom * w {
        code |= GUARDBAND_BOTTOM;
    }
    code
}

#[inline]
fn viewport_transform(state: &DrawState, pos: [f32; 4], rw: f32) -> [f32; 3] {
    let vp = &state.viewport;
    let ndc_x = pos[0] * rw;
    let ndc_y = pos[1] * rw;
    let ndc_z = pos[2] * rw;

    let x = vp.half_width() * ndc_x + vp.half_width() + vp.x;
    // DX flips y here; GL flips at tile store instead.
    let y_oriented = match state.driver {
        DriverType::Dx => -ndc_y,
        DriverType::Gl => ndc_y,
    };
    let y = vp.half_height() * y_oriented + vp.half_height() + vp.y;
    let z = 0.5 * (ndc_z + 1.0) * (vp.max_z - vp.min_z) + vp.min_z;
    [x, y, z]
}

/// Frontend entry point for draw work items.
pub(crate) fn process_draw(dc: &DrawContext, desc: &FeWorkDesc) {
    let FeWorkDesc::Draw(draw) = desc else {
        debug_assert!(false, "draw FE invoked with non-draw work");
        return;
    };
    let state = dc.state();
    shade_and_bin(dc, state, draw);
    dc.done_fe.store(true, Ordering::Release);
}

fn shade_and_bin(dc: &DrawContext, state: &DrawState, draw: &FeDrawDesc) {
    let topology = state.topology;
    let tris_per_prim = topology.triangles_per_primitive();
    let num_tris = draw.prim_count * tris_per_prim;
    let first_tri = draw.start_prim * tris_per_prim;
    if num_tris == 0 {
        return;
    }

    let index_reader = match draw.source {
        VertexSource::Direct => None,
        VertexSource::Indexed { index_offset } => {
            let Some(buffer) = state.index_buffer.as_ref() else {
                state
                    .counters
                    .draws_dropped
                    .fetch_add(1, Ordering::Relaxed);
                tracing::error!("indexed draw submitted without an index buffer");
                return;
            };
            Some((buffer.ptr() as *const u8, index_offset, state.index_type))
        }
    };

    // Resolve each triangle corner to a source vertex and deduplicate, so
    // shared vertices are shaded once per chunk.
    let mut slot_of_key: HashMap<u32, u32> = HashMap::new();
    let mut unique_keys: Vec<u32> = Vec::new();
    let mut corners: Vec<u32> = Vec::with_capacity(num_tris as usize * 3);
    for t in 0..num_tris {
        for corner in 0..3 {
            let vid = topology.triangle_vertex(first_tri + t, corner);
            let key = match index_reader {
                None => draw.start_vertex + vid,
                Some((ptr, offset, index_type)) => {
                    read_index(ptr, offset, index_type, vid)
                }
            };
            let slot = *slot_of_key.entry(key).or_insert_with(|| {
                unique_keys.push(key);
                unique_keys.len() as u32 - 1
            });
            corners.push(slot);
        }
    }

    // Shade the unique vertices in lane batches.
    let mut pt = PostTransform::new(state.linkage_union(), unique_keys.len());
    let streams = resolve_streams(state);
    let fetch_constants = constants_ptr(&state.fetch_constants);
    let vertex_constants = constants_ptr(&state.vertex_constants);

    let mut batch_start = 0;
    while batch_start < unique_keys.len() {
        let lanes = LANES.min(unique_keys.len() - batch_start);
        let mut indices = [unique_keys[batch_start + lanes - 1]; LANES];
        indices[..lanes].copy_from_slice(&unique_keys[batch_start..batch_start + lanes]);

        let fetch_info = FetchInfo {
            streams,
            indices,
            active_lanes: lanes,
            instance: draw.instance,
            constants: fetch_constants,
        };
        let mut vertex_input = VertexInput {
            active_lanes: lanes,
            constants: vertex_constants,
            ..VertexInput::default()
        };
        (state.fetch_fn)(&fetch_info, &mut vertex_input);
        vertex_input.active_lanes = lanes;
        vertex_input.constants = vertex_constants;

        let mut vertex_output = VertexOutput::default();
        (state.vertex_fn)(&vertex_input, &mut vertex_output);

        for lane in 0..lanes {
            pt.write_vertex_lane(batch_start + lane, &vertex_output, lane);
        }
        batch_start += lanes;
    }

    // Assemble triangles and hand them to the binner in lane batches.
    let attrs = AttrSource::Post(&pt);
    let mut batch = TriBatch::default();
    for t in 0..num_tris {
        let lane = batch.count;
        for corner in 0..3 {
            let slot = corners[(t * 3 + corner) as usize];
            batch.corners[lane][corner as usize] = slot;
            batch.pos[corner as usize].set_lane(lane, pt.position(slot));
        }
        batch.parity[lane] = ((first_tri + t) & 1) as u8;
        batch.count += 1;
        if batch.count == LANES {
            bin_triangles(dc, state, &attrs, &batch, true);
            batch.count = 0;
        }
    }
    if batch.count > 0 {
        bin_triangles(dc, state, &attrs, &batch, true);
    }
}

fn read_index(ptr: *const u8, index_offset: u32, index_type: IndexType, vid: u32) -> u32 {
    // Bounds were validated against the buffer length at submit.
    unsafe {
        match index_type {
            IndexType::U16 => ptr
                .add((index_offset + vid) as usize * 2)
                .cast::<u16>()
                .read_unaligned() as u32,
            IndexType::U32 => ptr
                .add((index_offset + vid) as usize * 4)
                .cast::<u32>()
                .read_unaligned(),
        }
    }
}

fn resolve_streams(state: &DrawState) -> [*const f32; MAX_VERTEX_STREAMS] {
    let mut streams = [std::ptr::null(); MAX_VERTEX_STREAMS];
    for (stream, buffer) in state.vertex_buffers.iter().enumerate() {
        if let Some(buffer) = buffer {
            streams[stream] = buffer.ptr() as *const f32;
        }
    }
    streams
}

fn constants_ptr(buffer: &Option<std::sync::Arc<crate::resource::BufferAlloc>>) -> *const u8 {
    buffer
        .as_ref()
        .map_or(std::ptr::null(), |alloc| alloc.ptr() as *const u8)
}

/// Clip, cull, set up and bin one batch of triangles.
pub(crate) fn bin_triangles(
    dc: &DrawContext,
    state: &DrawState,
    attrs: &AttrSource,
    batch: &TriBatch,
    allow_clip: bool,
) {
    let count = batch.count;
    let mut tri_mask: u32 = (1 << count) - 1;

    // Clip codes against frustum and guardband.
    let mut clip_mask = 0u32;
    {
        let mut codes = [[0u32; 3]; LANES];
        for lane in 0..count {
            for v in 0..3 {
                codes[lane][v] = compute_clip_code(state, batch.pos[v].lane(lane));
            }
        }
        for lane in 0..count {
            let [c0, c1, c2] = codes[lane];
            if c0 & c1 & c2 != 0 {
                // Trivially outside some frustum or guardband plane.
                tri_mask &= !(1 << lane);
            } else if allow_clip && (c0 | c1 | c2) & GUARDBAND_CLIP_MASK != 0 {
                clip_mask |= 1 << lane;
            }
        }
    }
    if tri_mask == 0 {
        return;
    }
    clip_mask &= tri_mask;

    // Perspective divide and viewport transform.
    let mut recip_w = [[0.0f32; LANES]; 3];
    let mut sx = [[0.0f32; LANES]; 3];
    let mut sy = [[0.0f32; LANES]; 3];
    let mut sz = [[0.0f32; LANES]; 3];
    for v in 0..3 {
        for lane in 0..count {
            let pos = batch.pos[v].lane(lane);
            let rw = 1.0 / pos[3];
            recip_w[v][lane] = rw;
            let screen = viewport_transform(state, pos, rw);
            sx[v][lane] = screen[0];
            sy[v][lane] = screen[1];
            sz[v][lane] = screen[2];
        }
    }

    // Fatten lines and points into screen-space triangle pairs.
    match state.topology {
        PrimitiveTopology::LineList | PrimitiveTopology::LineStrip if allow_clip => {
            for lane in 0..count {
                let dx = (sx[1][lane] - sx[0][lane]).abs();
                let dy = (sy[1][lane] - sy[0][lane]).abs();
                let (ox, oy) = if dx >= dy { (0.0, 0.5) } else { (0.5, 0.0) };
                // Even triangle covers (a-d, b-d, b+d), odd (a-d, b+d, a+d).
                let signs: [f32; 3] = if batch.parity[lane] & 1 == 0 {
                    [-1.0, -1.0, 1.0]
                } else {
                    [-1.0, 1.0, 1.0]
                };
                for v in 0..3 {
                    sx[v][lane] += signs[v] * ox;
                    sy[v][lane] += signs[v] * oy;
                }
            }
        }
        PrimitiveTopology::PointList if allow_clip => {
            for lane in 0..count {
                const EVEN: [[f32; 2]; 3] = [[-0.5, -0.5], [0.5, -0.5], [0.5, 0.5]];
                const ODD: [[f32; 2]; 3] = [[-0.5, -0.5], [0.5, 0.5], [-0.5, 0.5]];
                let offsets = if batch.parity[lane] & 1 == 0 { EVEN } else { ODD };
                for v in 0..3 {
                    sx[v][lane] += offsets[v][0];
                    sy[v][lane] += offsets[v][1];
                }
            }
        }
        _ => {}
    }

    // Fixed-point conversion and edge setup.
    let mut xi = [[0i32; LANES]; 3];
    let mut yi = [[0i32; LANES]; 3];
    for v in 0..3 {
        for lane in 0..count {
            xi[v][lane] = to_fixed(sx[v][lane]);
            yi[v][lane] = to_fixed(sy[v][lane]);
        }
    }
    let mut edge_a = [[0i32; LANES]; 3];
    let mut edge_b = [[0i32; LANES]; 3];
    for e in 0..3 {
        let next = (e + 1) % 3;
        for lane in 0..count {
            edge_a[e][lane] = yi[e][lane].wrapping_sub(yi[next][lane]);
            edge_b[e][lane] = xi[next][lane].wrapping_sub(xi[e][lane]);
        }
    }

    let mut det = [0i64; LANES];
    for lane in 0..count {
        let d = edge_a[1][lane] as i64 * edge_b[2][lane] as i64
            - edge_a[2][lane] as i64 * edge_b[1][lane] as i64;
        det[lane] = match state.driver {
            DriverType::Gl => -d,
            DriverType::Dx => d,
        };
    }

    // Zero-area and backface culling; lanes headed to the clipper survive.
    for lane in 0..count {
        let bit = 1 << lane;
        if tri_mask & bit == 0 || clip_mask & bit != 0 {
            continue;
        }
        let culled = det[lane] == 0
            || match state.cull_mode {
                CullMode::Ccw => det[lane] < 0,
                CullMode::Cw => det[lane] > 0,
                CullMode::None => false,
            };
        if culled {
            tri_mask &= !bit;
        }
    }
    if tri_mask == 0 {
        return;
    }

    // Bounding boxes in fixed point, then tiles.
    let mut bbox_tiles = [Bbox::default(); LANES];
    let mut small_mask = 0u32;
    for lane in 0..count {
        if tri_mask & (1 << lane) == 0 {
            continue;
        }
        let bit = 1 << lane;
        let left = xi[0][lane].min(xi[1][lane]).min(xi[2][lane]);
        let right = xi[0][lane].max(xi[1][lane]).max(xi[2][lane]);
        let top = yi[0][lane].min(yi[1][lane]).min(yi[2][lane]);
        let bottom = yi[0][lane].max(yi[1][lane]).max(yi[2][lane]);

        // Cull triangles falling entirely between pixel centers.
        if clip_mask & bit == 0 {
            let snap_l = (left + 127) & !255;
            let snap_r = (right + 128) & !255;
            let snap_t = (top + 127) & !255;
            let snap_b = (bottom + 128) & !255;
            if snap_l == snap_r || snap_t == snap_b {
                tri_mask &= !bit;
                continue;
            }
        }

        let shift = TILE_DIM_SHIFT + FIXED_POINT_SHIFT;
        let tiles = Bbox::new(left >> shift, top >> shift, right >> shift, bottom >> shift);
        if (tiles.right - tiles.left) < SMALL_TRI_TILES && (tiles.bottom - tiles.top) < SMALL_TRI_TILES
        {
            small_mask |= bit;
        }
        let clipped = tiles.intersect(&state.scissor_in_tiles);
        if clipped.is_empty() {
            tri_mask &= !bit;
            continue;
        }
        bbox_tiles[lane] = clipped;
    }
    if tri_mask == 0 {
        return;
    }

    // One-tile triangles: bake the coverage mask now and cull the ones that
    // touch no pixel center.
    let mut one_tile_mask = 0u32;
    let mut coverage = [0u64; LANES];
    for lane in 0..count {
        let bit = 1 << lane;
        if tri_mask & bit == 0 || clip_mask & bit != 0 {
            continue;
        }
        let tiles = &bbox_tiles[lane];
        if tiles.left != tiles.right || tiles.top != tiles.bottom {
            continue;
        }
        // Winding normalization works off the raw screen-space determinant;
        // the GL negation above only affects culling and facing.
        let raw_det = match state.driver {
            DriverType::Gl => -det[lane],
            DriverType::Dx => det[lane],
        };
        let edges = normalized_edges(lane, &edge_a, &edge_b, &xi, &yi, raw_det);
        let scissor = state
            .scissor_cuts_tiles(tiles)
            .then_some(&state.scissor_in_fixed);
        let mask = rasterizer::one_tile_coverage(&edges, tiles.left, tiles.top, scissor);
        if mask == 0 {
            tri_mask &= !bit;
        } else {
            one_tile_mask |= bit;
            coverage[lane] = mask;
        }
    }
    if tri_mask == 0 {
        return;
    }

    // Emit the survivors one lane at a time.
    let mut remaining = tri_mask;
    while remaining != 0 {
        let lane = remaining.trailing_zeros() as usize;
        remaining &= remaining - 1;
        let bit = 1u32 << lane;

        if clip_mask & bit != 0 {
            clip_and_rebin(dc, state, attrs, batch, lane);
            continue;
        }

        let back_facing = det[lane] > 0;
        let linkage = state.linkage_for_facing(back_facing);
        let rast_fn: crate::draw::BeWorkFn = if one_tile_mask & bit != 0 {
            rasterizer::rast_one_tile_tri
        } else if small_mask & bit != 0 {
            rasterizer::rast_small_tri
        } else {
            rasterizer::rast_large_tri
        };

        let interp_buffer = write_interp_buffer(dc, attrs, &batch.corners[lane], &recip_w, lane, linkage);
        let tri_buffer = write_tri_buffer(dc, &sx, &sy, &sz, &recip_w, lane);

        let tiles = &bbox_tiles[lane];
        let mt_w = state.macro_width_in_tiles as i32;
        let mt_h = state.macro_height_in_tiles as i32;
        let mut work = BeWork {
            func: rast_fn,
            desc: BeWorkDesc::Triangle(TriangleWorkDesc {
                tri_buffer,
                interp_buffer,
                flags: TriFlags {
                    back_facing,
                    macro_x: 0,
                    macro_y: 0,
                    coverage_mask: coverage[lane],
                },
            }),
        };
        for my in (tiles.top / mt_h)..=(tiles.bottom / mt_h) {
            for mx in (tiles.left / mt_w)..=(tiles.right / mt_w) {
                if let BeWorkDesc::Triangle(tri) = &mut work.desc {
                    tri.flags.macro_x = mx as u16;
                    tri.flags.macro_y = my as u16;
                }
                dc.tile_mgr.enqueue(mx as u32, my as u32, work);
            }
        }
        PipelineCounters::bump(&state.counters.triangles_binned, 1);
    }
}

fn normalized_edges(
    lane: usize,
    edge_a: &[[i32; LANES]; 3],
    edge_b: &[[i32; LANES]; 3],
    xi: &[[i32; LANES]; 3],
    yi: &[[i32; LANES]; 3],
    det: i64,
) -> EdgeSet {
    let mut edges = EdgeSet {
        a: [
            edge_a[0][lane],
            edge_a[1][lane],
            edge_a[2][lane],
        ],
        b: [
            edge_b[0][lane],
            edge_b[1][lane],
            edge_b[2][lane],
        ],
        x: [xi[0][lane], xi[1][lane], xi[2][lane]],
        y: [yi[0][lane], yi[1][lane], yi[2][lane]],
    };
    // Normalize winding so the interior always evaluates negative.
    if det > 0 {
        for e in 0..3 {
            edges.a[e] = -edges.a[e];
            edges.b[e] = -edges.b[e];
        }
    }
    edges
}

fn write_interp_buffer(
    dc: &DrawContext,
    attrs: &AttrSource,
    corners: &[u32; 3],
    recip_w: &[[f32; LANES]; 3],
    lane: usize,
    linkage: u32,
) -> *const f32 {
    let attr_count = linkage.count_ones() as usize;
    let ptr = dc.arena.alloc_f32_slice(attr_count * 12);
    // The arena allocation is exclusively ours until published via done_fe.
    let buffer = unsafe { std::slice::from_raw_parts_mut(ptr.as_ptr(), attr_count * 12) };

    let mut mask = linkage;
    let mut base = 0;
    while mask != 0 {
        let slot = mask.trailing_zeros() as usize;
        mask &= mask - 1;
        let a0 = attrs.attr(corners[0], slot);
        let a1 = attrs.attr(corners[1], slot);
        let a2 = attrs.attr(corners[2], slot);
        for c in 0..4 {
            let e0 = a0[c] * recip_w[0][lane];
            let e1 = a1[c] * recip_w[1][lane];
            let e2 = a2[c] * recip_w[2][lane];
            buffer[base + c] = e0 - e2;
            buffer[base + 4 + c] = e1 - e2;
            buffer[base + 8 + c] = e2;
        }
        base += 12;
    }
    ptr.as_ptr()
}

fn write_tri_buffer(
    dc: &DrawContext,
    sx: &[[f32; LANES]; 3],
    sy: &[[f32; LANES]; 3],
    sz: &[[f32; LANES]; 3],
    recip_w: &[[f32; LANES]; 3],
    lane: usize,
) -> *const f32 {
    let ptr = dc.arena.alloc_f32_slice(16);
    let buffer = unsafe { std::slice::from_raw_parts_mut(ptr.as_ptr(), 16) };
    for v in 0..3 {
        buffer[v] = sx[v][lane];
        buffer[4 + v] = sy[v][lane];
        buffer[8 + v] = sz[v][lane];
        buffer[12 + v] = recip_w[v][lane];
    }
    buffer[3] = 0.0;
    buffer[7] = 0.0;
    buffer[11] = 0.0;
    buffer[15] = 0.0;
    ptr.as_ptr()
}

fn clip_and_rebin(
    dc: &DrawContext,
    state: &DrawState,
    attrs: &AttrSource,
    batch: &TriBatch,
    lane: usize,
) {
    let linkage = state.linkage_union();
    let mut verts = [ClipVertex::zeroed(); 3];
    for v in 0..3 {
        verts[v].pos = batch.pos[v].lane(lane);
        let mut mask = linkage;
        while mask != 0 {
            let slot = mask.trailing_zeros() as usize;
            mask &= mask - 1;
            verts[v].attrs[slot] = attrs.attr(batch.corners[lane][v], slot);
        }
    }

    let polygon = clip_triangle(&verts, &state.guardband, linkage);
    if polygon.len() < 3 {
        return;
    }

    // Re-bin the clipped polygon as a fan through the non-clipping path.
    let clipped = AttrSource::Clipped(&polygon);
    let fan: SmallVec<[u32; 9]> = (0..polygon.len() as u32).collect();
    let mut rebatch = TriBatch::default();
    for t in 0..polygon.len() - 2 {
        let lane = rebatch.count;
        let corners = [fan[0], fan[t + 1], fan[t + 2]];
        for v in 0..3 {
            rebatch.corners[lane][v] = corners[v];
            rebatch.pos[v].set_lane(lane, polygon[corners[v] as usize].pos);
        }
        rebatch.parity[lane] = 0;
        rebatch.count += 1;
        if rebatch.count == LANES {
            bin_triangles(dc, state, &clipped, &rebatch, false);
            rebatch.count = 0;
        }
    }
    if rebatch.count > 0 {
        bin_triangles(dc, state, &clipped, &rebatch, false);
    }
}

/// Frontend for clears: one backend clear item per macro tile the clear
/// rectangle touches.
pub(crate) fn process_clear(dc: &DrawContext, desc: &FeWorkDesc) {
    let FeWorkDesc::Clear(clear) = desc else {
        debug_assert!(false, "clear FE invoked with non-clear work");
        return;
    };
    let state = dc.state();
    let macro_px_w = (state.macro_width_in_tiles << TILE_DIM_SHIFT) as i32;
    let macro_px_h = (state.macro_height_in_tiles << TILE_DIM_SHIFT) as i32;
    let rect = clear.rect;
    if !rect.is_empty() {
        let work = BeWork {
            func: crate::backend::process_clear_be,
            desc: BeWorkDesc::Clear(*clear),
        };
        for my in (rect.top / macro_px_h)..=(rect.bottom / macro_px_h) {
            for mx in (rect.left / macro_px_w)..=(rect.right / macro_px_w) {
                dc.tile_mgr.enqueue(mx as u32, my as u32, work);
            }
        }
    }
    dc.done_fe.store(true, Ordering::Release);
}

/// Frontend for present/store: one store item per macro tile of the color
/// target.
pub(crate) fn process_store(dc: &DrawContext, desc: &FeWorkDesc) {
    let FeWorkDesc::Store(store) = desc else {
        debug_assert!(false, "store FE invoked with non-store work");
        return;
    };
    let state = dc.state();
    if let Some(rt) = state.render_targets[crate::shader::ATTACHMENT_COLOR].as_ref() {
        let macro_px_w = state.macro_width_in_tiles << TILE_DIM_SHIFT;
        let macro_px_h = state.macro_height_in_tiles << TILE_DIM_SHIFT;
        let tiles_x = rt.api_width().div_ceil(macro_px_w);
        let tiles_y = rt.api_height().div_ceil(macro_px_h);
        let work = BeWork {
            func: crate::backend::process_store_be,
            desc: BeWorkDesc::Store(*store),
        };
        for my in 0..tiles_y {
            for mx in 0..tiles_x {
                dc.tile_mgr.enqueue(mx, my, work);
            }
        }
    }
    dc.done_fe.store(true, Ordering::Release);
}

/// Frontend for render-target copies.
pub(crate) fn process_copy(dc: &DrawContext, desc: &FeWorkDesc) {
    let FeWorkDesc::Copy(copy) = desc else {
        debug_assert!(false, "copy FE invoked with non-copy work");
        return;
    };
    let state = dc.state();
    let macro_px_w = (state.macro_width_in_tiles << TILE_DIM_SHIFT) as i32;
    let macro_px_h = (state.macro_height_in_tiles << TILE_DIM_SHIFT) as i32;
    let rect = copy.src;
    if !rect.is_empty() {
        let work = BeWork {
            func: crate::backend::process_copy_be,
            desc: BeWorkDesc::Copy(*copy),
        };
        for my in (rect.top / macro_px_h)..=(rect.bottom / macro_px_h) {
            for mx in (rect.left / macro_px_w)..=(rect.right / macro_px_w) {
                dc.tile_mgr.enqueue(mx as u32, my as u32, work);
            }
        }
    }
    dc.done_fe.store(true, Ordering::Release);
}

#[cfg(test)]
mod tests {
    use super::*;
    use model::simd::LaneF32;

    #[test]
    fn post_transform_round_trips_attributes() {
        let linkage = (1 << 1) | (1 << 3);
        let mut pt = PostTransform::new(linkage, 2);
        let mut out = VertexOutput::default();
        out.position = LaneVec4 {
            x: LaneF32::splat(1.0),
            y: LaneF32::splat(2.0),
            z: LaneF32::splat(3.0),
            w: LaneF32::splat(4.0),
        };
        out.attributes[1].set_lane(0, [0.1, 0.2, 0.3, 0.4]);
        out.attributes[3].set_lane(0, [0.5, 0.6, 0.7, 0.8]);
        pt.write_vertex_lane(1, &out, 0);

        assert_eq!(pt.position(1), [1.0, 2.0, 3.0, 4.0]);
        assert_eq!(pt.attr(1, 1), [0.1, 0.2, 0.3, 0.4]);
        assert_eq!(pt.attr(1, 3), [0.5, 0.6, 0.7, 0.8]);
    }

    #[test]
    fn clip_codes_flag_the_crossed_planes() {
        let state = DrawState::new(DriverType::Dx);
        assert_eq!(compute_clip_code(&state, [0.0, 0.0, 0.0, 1.0]), 0);
        let code = compute_clip_code(&state, [2.0, 0.0, 0.0, 1.0]);
        assert_ne!(code & FRUSTUM_RIGHT, 0);
        // Unit guardband: crossing the frustum right plane also crosses the
        // guardband right plane.
        assert_ne!(code & GUARDBAND_RIGHT, 0);
    }
}
