//! Tile-swizzled render-target storage. Pixels live in 8x8 tiles; inside a
//! tile each 4x2 sub-tile is contiguous and pairs of sub-tiles interleave
//! along x, so clears and quad-rate pixel writes touch whole cache lines.

use std::cell::UnsafeCell;
use std::fmt;

use model::{Bbox, DriverType, SurfaceFormat, TILE_DIM, TILE_DIM_SHIFT, TILE_PIXELS};

/// Bytes per pixel for both supported formats.
pub const BYTES_PER_PIXEL: u32 = 4;
/// Bytes per swizzled tile.
pub const TILE_BYTES: u32 = TILE_PIXELS * BYTES_PER_PIXEL;

/// Byte offset of pixel (x, y) inside its tile.
#[inline]
pub fn intra_tile_offset(x: u32, y: u32) -> u32 {
    let ox = (x & (TILE_DIM - 1)) * BYTES_PER_PIXEL;
    let oy = y & (TILE_DIM - 1);
    (((ox << 1) & 0x30) | (ox & 0x07)) | (((oy << 5) & 0xC0) | ((oy << 3) & 0x08))
}

/// Byte offset of pixel (x, y) in a swizzled surface whose rows of tiles are
/// `row_pitch` bytes apart. Shared with pixel shaders through the triangle
/// descriptor's pitch field.
#[inline]
pub fn swizzled_offset(x: u32, y: u32, row_pitch: usize) -> usize {
    let tile_x = (x >> TILE_DIM_SHIFT) as usize;
    let tile_y = (y >> TILE_DIM_SHIFT) as usize;
    tile_y * row_pitch + tile_x * TILE_BYTES as usize + intra_tile_offset(x, y) as usize
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RenderTargetError {
    ZeroSize,
    SizeOverflow,
}

impl fmt::Display for RenderTargetError {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RenderTargetError::ZeroSize => {
                write!(formatter, "render target dimensions must be non-zero")
            }
            RenderTargetError::SizeOverflow => {
                write!(formatter, "render target dimensions overflow")
            }
        }
    }
}

impl std::error::Error for RenderTargetError {}

/// Swizzled pixel storage for one attachment.
///
/// Interior mutability: backend workers write concurrently, but the tile
/// FIFO protocol guarantees two workers never own the same pixel tile at the
/// same time, and readers (stores, copies, tests) run after the writing draw
/// retired.
pub struct TileBuffer {
    format: SurfaceFormat,
    api_width: u32,
    api_height: u32,
    width_in_tiles: u32,
    height_in_tiles: u32,
    row_pitch: usize,
    data: UnsafeCell<Box<[u32]>>,
}

unsafe impl Send for TileBuffer {}
unsafe impl Sync for TileBuffer {}

impl TileBuffer {
    pub fn new(
        width: u32,
        height: u32,
        format: SurfaceFormat,
    ) -> Result<TileBuffer, RenderTargetError> {
        if width == 0 || height == 0 {
            return Err(RenderTargetError::ZeroSize);
        }
        let width_in_tiles = width.div_ceil(TILE_DIM);
        let height_in_tiles = height.div_ceil(TILE_DIM);
        let words = (width_in_tiles as usize)
            .checked_mul(height_in_tiles as usize)
            .and_then(|tiles| tiles.checked_mul(TILE_PIXELS as usize))
            .ok_or(RenderTargetError::SizeOverflow)?;
        Ok(TileBuffer {
            format,
            api_width: width,
            api_height: height,
            width_in_tiles,
            height_in_tiles,
            row_pitch: width_in_tiles as usize * TILE_BYTES as usize,
            data: UnsafeCell::new(vec![0u32; words].into_boxed_slice()),
        })
    }

    pub fn format(&self) -> SurfaceFormat {
        self.format
    }

    pub fn api_width(&self) -> u32 {
        self.api_width
    }

    pub fn api_height(&self) -> u32 {
        self.api_height
    }

    pub fn width_in_tiles(&self) -> u32 {
        self.width_in_tiles
    }

    pub fn height_in_tiles(&self) -> u32 {
        self.height_in_tiles
    }

    /// Bytes per row of tiles.
    pub fn row_pitch(&self) -> usize {
        self.row_pitch
    }

    /// Raw base of the swizzled storage, handed to pixel shaders.
    pub fn tile_data(&self) -> *mut u8 {
        unsafe { (*self.data.get()).as_mut_ptr().cast() }
    }

    #[inline]
    fn word_index(&self, x: u32, y: u32) -> usize {
        debug_assert!(
            x < self.width_in_tiles * TILE_DIM && y < self.height_in_tiles * TILE_DIM,
            "pixel ({x}, {y}) out of range"
        );
        swizzled_offset(x, y, self.row_pitch) / 4
    }

    /// Read one pixel as its packed 32-bit pattern.
    pub fn read_pixel(&self, x: u32, y: u32) -> u32 {
        let index = self.word_index(x, y);
        unsafe { (*self.data.get())[index] }
    }

    /// Write one pixel. Callers must hold the tile exclusively.
    pub fn write_pixel(&self, x: u32, y: u32, value: u32) {
        let index = self.word_index(x, y);
        unsafe { (*self.data.get())[index] = value };
    }

    /// Broadcast `value` across one whole tile. The swizzle permutes bytes
    /// only within the tile, so a broadcast is a straight fill of its 64
    /// words.
    pub fn clear_tile(&self, tile_x: u32, tile_y: u32, value: u32) {
        debug_assert!(tile_x < self.width_in_tiles && tile_y < self.height_in_tiles);
        let base = (tile_y as usize * self.row_pitch + tile_x as usize * TILE_BYTES as usize) / 4;
        let data = unsafe { &mut *self.data.get() };
        data[base..base + TILE_PIXELS as usize].fill(value);
    }

    /// Clear the pixels of one tile that fall inside `rect` (inclusive pixel
    /// coordinates). Scissored clears need pixel granularity at tiles the
    /// scissor edge crosses.
    pub fn clear_tile_rect(&self, tile_x: u32, tile_y: u32, rect: &Bbox, value: u32) {
        let x0 = tile_x * TILE_DIM;
        let y0 = tile_y * TILE_DIM;
        let tile_rect = Bbox::new(
            x0 as i32,
            y0 as i32,
            (x0 + TILE_DIM - 1) as i32,
            (y0 + TILE_DIM - 1) as i32,
        );
        let clipped = rect.intersect(&tile_rect);
        if clipped.is_empty() {
            return;
        }
        if clipped == tile_rect {
            self.clear_tile(tile_x, tile_y, value);
            return;
        }
        for y in clipped.top..=clipped.bottom {
            for x in clipped.left..=clipped.right {
                self.write_pixel(x as u32, y as u32, value);
            }
        }
    }

    /// Deswizzle one whole tile into linear memory with the given pitch,
    /// flipping y for GL's bottom-left origin.
    ///
    /// # Safety
    /// `dst` must be valid for the rows this tile maps to, and no other
    /// writer may touch those rows concurrently.
    pub unsafe fn store_tile(&self, driver: DriverType, tile_x: u32, tile_y: u32, dst: *mut u8, pitch: usize) {
        unsafe { self.store_tile_partial(driver, tile_x, tile_y, TILE_DIM, TILE_DIM, dst, pitch) };
    }

    /// Deswizzle the top-left `size_x` x `size_y` pixels of a tile; edge
    /// tiles of a render target whose size is not tile aligned use this.
    ///
    /// # Safety
    /// Same contract as [`TileBuffer::store_tile`].
    pub unsafe fn store_tile_partial(
        &self,
        driver: DriverType,
        tile_x: u32,
        tile_y: u32,
        size_x: u32,
        size_y: u32,
        dst: *mut u8,
        pitch: usize,
    ) {
        debug_assert!(size_x <= TILE_DIM && size_y <= TILE_DIM);
        let x0 = tile_x * TILE_DIM;
        let y0 = tile_y * TILE_DIM;
        for row in 0..size_y {
            let dst_y = match driver {
                DriverType::Dx => (y0 + row) as usize,
                DriverType::Gl => (self.api_height - (y0 + row) - 1) as usize,
            };
            for col in 0..size_x {
                let value = self.read_pixel(x0 + col, y0 + row);
                let offset = dst_y * pitch + (x0 + col) as usize * BYTES_PER_PIXEL as usize;
                unsafe {
                    dst.add(offset)
                        .cast::<[u8; 4]>()
                        .write_unaligned(value.to_le_bytes())
                };
            }
        }
    }
}
