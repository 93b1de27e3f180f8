//! Splitting images into a tile grid and reassembling upscaled tiles.
//!
//! Tile extents are `width / cols` and `height / rows` (floor division), so an
//! image whose dimensions are not multiples of the grid loses its last
//! `width % cols` columns and `height % rows` rows from the tiling math. The
//! merged canvas still has the full target size; the uncovered strip stays
//! zero (transparent black).

use anyhow::{bail, Result};
use image::imageops::{self, FilterType};
use image::{DynamicImage, GenericImageView, ImageBuffer, Pixel, Rgba, RgbaImage};

use crate::job::UPSCALE_FACTOR;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileGrid {
    pub cols: u32,
    pub rows: u32,
    pub tile_width: u32,
    pub tile_height: u32,
}

impl TileGrid {
    /// Grid of `cols × rows` uniform tiles over a `width × height` image.
    pub fn new(width: u32, height: u32, cols: u32, rows: u32) -> Self {
        let cols = cols.clamp(1, width.max(1));
        let rows = rows.clamp(1, height.max(1));
        Self {
            cols,
            rows,
            tile_width: width / cols,
            tile_height: height / rows,
        }
    }

    pub fn len(&self) -> usize {
        (self.cols * self.rows) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone)]
pub struct Tile {
    pub row: u32,
    pub col: u32,
    pub image: DynamicImage,
}

/// `None` when the image fits in a single `tile_budget × tile_budget` tile.
pub fn needs_tiling(width: u32, height: u32, tile_budget: u32) -> Option<TileGrid> {
    let budget = tile_budget.max(1);
    let cols = width.div_ceil(budget);
    let rows = height.div_ceil(budget);
    if cols * rows <= 1 {
        return None;
    }
    Some(TileGrid::new(width, height, cols, rows))
}

/// Cut `image` into `grid.len()` tiles in row-major order.
pub fn split(image: &DynamicImage, grid: &TileGrid) -> Vec<Tile> {
    let mut tiles = Vec::with_capacity(grid.len());
    for row in 0..grid.rows {
        for col in 0..grid.cols {
            let x = col * grid.tile_width;
            let y = row * grid.tile_height;
            tiles.push(Tile {
                row,
                col,
                image: image.crop_imm(x, y, grid.tile_width, grid.tile_height),
            });
        }
    }
    tiles
}

/// Paste tiles onto a zeroed RGBA canvas of `target_width × target_height`.
///
/// Each tile lands at `(col × its width, row × its height)`. The canvas is
/// 16 bits per channel when the first tile is, 8 bits otherwise.
pub fn merge(tiles: &[Tile], target_width: u32, target_height: u32) -> Result<DynamicImage> {
    let Some(first) = tiles.first() else {
        bail!("cannot reconstruct an image from zero tiles");
    };

    if is_wide(&first.image) {
        let mut canvas: ImageBuffer<Rgba<u16>, Vec<u16>> =
            ImageBuffer::new(target_width, target_height);
        for tile in tiles {
            let rgba = normalize_alpha(tile.image.clone())?.to_rgba16();
            paste(&mut canvas, &rgba, tile);
        }
        Ok(DynamicImage::ImageRgba16(canvas))
    } else {
        let mut canvas = RgbaImage::new(target_width, target_height);
        for tile in tiles {
            let rgba = normalize_alpha(tile.image.clone())?.to_rgba8();
            paste(&mut canvas, &rgba, tile);
        }
        Ok(DynamicImage::ImageRgba8(canvas))
    }
}

fn paste<P: Pixel>(
    canvas: &mut ImageBuffer<P, Vec<P::Subpixel>>,
    piece: &ImageBuffer<P, Vec<P::Subpixel>>,
    tile: &Tile,
) {
    let x = i64::from(tile.col) * i64::from(piece.width());
    let y = i64::from(tile.row) * i64::from(piece.height());
    imageops::replace(canvas, piece, x, y);
}

/// Give an RGB tile an opaque alpha channel; RGBA passes through.
///
/// Grayscale tiles are rejected: callers convert them to RGB before tiling.
pub fn normalize_alpha(tile: DynamicImage) -> Result<DynamicImage> {
    match tile {
        DynamicImage::ImageRgba8(_) | DynamicImage::ImageRgba16(_) | DynamicImage::ImageRgba32F(_) => {
            Ok(tile)
        }
        DynamicImage::ImageRgb8(_) => Ok(DynamicImage::ImageRgba8(tile.to_rgba8())),
        DynamicImage::ImageRgb16(_) => Ok(DynamicImage::ImageRgba16(tile.to_rgba16())),
        DynamicImage::ImageRgb32F(_) => Ok(DynamicImage::ImageRgba32F(tile.to_rgba32f())),
        other => bail!(
            "tile must have 3 or 4 channels, got {:?} ({} channels)",
            other.color(),
            other.color().channel_count()
        ),
    }
}

/// Resample `upscaled` to exactly 4× the size of `original`.
pub fn fix_output_shape(original: &DynamicImage, upscaled: DynamicImage) -> DynamicImage {
    let (width, height) = original.dimensions();
    let expected = (width * UPSCALE_FACTOR, height * UPSCALE_FACTOR);
    if upscaled.dimensions() == expected {
        return upscaled;
    }
    upscaled.resize_exact(expected.0, expected.1, FilterType::Triangle)
}

pub(crate) fn is_wide(image: &DynamicImage) -> bool {
    matches!(
        image,
        DynamicImage::ImageLuma16(_)
            | DynamicImage::ImageLumaA16(_)
            | DynamicImage::ImageRgb16(_)
            | DynamicImage::ImageRgba16(_)
    )
}
