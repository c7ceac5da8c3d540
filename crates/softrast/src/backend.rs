//! Non-triangle backend work: clears, stores to linear memory and
//! render-target copies. Dispatched per macro tile like triangle work, so
//! they interleave with draws in strict submission order per tile.

use model::{Bbox, ClearMask, TILE_DIM, TILE_DIM_SHIFT, macro_tile_coords};
use render_target::TileBuffer;

use crate::draw::{BeWorkDesc, ClearDesc, DrawContext};
use crate::shader::{ATTACHMENT_COLOR, ATTACHMENT_DEPTH};

/// Pixel-tile bounds (inclusive) of one macro tile, clamped to the render
/// target.
fn macro_tile_bounds(dc: &DrawContext, tile_id: u32, rt: &TileBuffer) -> Bbox {
    let state = dc.state();
    let (mx, my) = macro_tile_coords(tile_id);
    let left = (mx * state.macro_width_in_tiles) as i32;
    let top = (my * state.macro_height_in_tiles) as i32;
    let bounds = Bbox::new(
        left,
        top,
        left + state.macro_width_in_tiles as i32 - 1,
        top + state.macro_height_in_tiles as i32 - 1,
    );
    bounds.intersect(&Bbox::new(
        0,
        0,
        rt.width_in_tiles() as i32 - 1,
        rt.height_in_tiles() as i32 - 1,
    ))
}

fn clear_attachment(dc: &DrawContext, tile_id: u32, rt: &TileBuffer, clear: &ClearDesc, value: u32) {
    let tiles = macro_tile_bounds(dc, tile_id, rt).intersect(&Bbox::new(
        clear.rect.left >> TILE_DIM_SHIFT,
        clear.rect.top >> TILE_DIM_SHIFT,
        clear.rect.right >> TILE_DIM_SHIFT,
        clear.rect.bottom >> TILE_DIM_SHIFT,
    ));
    if tiles.is_empty() {
        return;
    }
    for tile_y in tiles.top..=tiles.bottom {
        for tile_x in tiles.left..=tiles.right {
            rt.clear_tile_rect(tile_x as u32, tile_y as u32, &clear.rect, value);
        }
    }
}

pub(crate) fn process_clear_be(dc: &DrawContext, tile_id: u32, desc: &BeWorkDesc) {
    let BeWorkDesc::Clear(clear) = desc else {
        debug_assert!(false, "clear backend got non-clear work");
        return;
    };
    let state = dc.state();
    if clear.mask.contains(ClearMask::COLOR) {
        if let Some(rt) = state.render_targets[ATTACHMENT_COLOR].as_ref() {
            clear_attachment(dc, tile_id, rt, clear, clear.color);
        }
    }
    if clear.mask.contains(ClearMask::DEPTH) {
        if let Some(rt) = state.render_targets[ATTACHMENT_DEPTH].as_ref() {
            clear_attachment(dc, tile_id, rt, clear, clear.depth_bits);
        }
    }
}

pub(crate) fn process_store_be(dc: &DrawContext, tile_id: u32, desc: &BeWorkDesc) {
    let BeWorkDesc::Store(store) = desc else {
        debug_assert!(false, "store backend got non-store work");
        return;
    };
    let state = dc.state();
    let Some(rt) = state.render_targets[ATTACHMENT_COLOR].as_ref() else {
        return;
    };
    let driver = state.driver;
    let tiles = macro_tile_bounds(dc, tile_id, rt);
    if tiles.is_empty() {
        return;
    }

    let whole_x = (rt.api_width() >> TILE_DIM_SHIFT) as i32;
    let whole_y = (rt.api_height() >> TILE_DIM_SHIFT) as i32;
    let partial_x = rt.api_width() % TILE_DIM;
    let partial_y = rt.api_height() % TILE_DIM;

    for tile_y in tiles.top..=tiles.bottom {
        for tile_x in tiles.left..=tiles.right {
            let size_x = if tile_x < whole_x { TILE_DIM } else { partial_x };
            let size_y = if tile_y < whole_y { TILE_DIM } else { partial_y };
            if size_x == 0 || size_y == 0 {
                continue;
            }
            // The store waits for retirement on the API thread, so `dst`
            // stays valid and each tile's rows are written exactly once.
            unsafe {
                rt.store_tile_partial(
                    driver,
                    tile_x as u32,
                    tile_y as u32,
                    size_x,
                    size_y,
                    store.dst,
                    store.pitch,
                )
            };
        }
    }
}

pub(crate) fn process_copy_be(dc: &DrawContext, tile_id: u32, desc: &BeWorkDesc) {
    let BeWorkDesc::Copy(copy) = desc else {
        debug_assert!(false, "copy backend got non-copy work");
        return;
    };
    let state = dc.state();
    let Some(rt) = state.render_targets[copy.attachment].as_ref() else {
        return;
    };
    if rt.format() != copy.dst_format {
        debug_assert!(false, "render-target copies do not convert formats");
        return;
    }

    let tiles = macro_tile_bounds(dc, tile_id, rt);
    let pixels = Bbox::new(
        tiles.left << TILE_DIM_SHIFT,
        tiles.top << TILE_DIM_SHIFT,
        ((tiles.right + 1) << TILE_DIM_SHIFT) - 1,
        ((tiles.bottom + 1) << TILE_DIM_SHIFT) - 1,
    )
    .intersect(&copy.src);
    if pixels.is_empty() {
        return;
    }

    for y in pixels.top..=pixels.bottom {
        for x in pixels.left..=pixels.right {
            let value = rt.read_pixel(x as u32, y as u32);
            let dst_row = copy.dst_y + (y - copy.src.top);
            let dst_col = copy.dst_x + (x - copy.src.left);
            let offset = dst_row as usize * copy.dst_pitch + dst_col as usize * 4;
            unsafe {
                copy.dst
                    .add(offset)
                    .cast::<[u8; 4]>()
                    .write_unaligned(value.to_le_bytes())
            };
        }
    }
}
