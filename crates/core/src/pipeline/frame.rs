//! Upscaling of one decoded picture: pre-resize, tile-or-direct enhancement
//! and the optional blend with the source. Images and video frames both go
//! through [`upscale_picture`].

use anyhow::Result;
use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView, ImageBuffer, Rgba};

use crate::error::UpscaleError;
use crate::inference::{enhance, SuperResolution};
use crate::job::UPSCALE_FACTOR;
use crate::tiling::{self, is_wide, Tile, TileGrid};

/// Milestones reported while a picture is processed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameStep {
    Tiling { tiles: usize },
    /// `index` tiles are done; tile `index + 1` is being enhanced.
    Tile { index: usize, total: usize },
    Reconstructing,
    Direct,
}

/// Dimensions fed to the network and the tiling decision for them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FramePlan {
    pub width: u32,
    pub height: u32,
    pub grid: Option<TileGrid>,
}

impl FramePlan {
    pub fn new(source_width: u32, source_height: u32, resize_factor: f64, tile_budget: u32) -> Self {
        let (width, height) = resized_dimensions(source_width, source_height, resize_factor);
        Self {
            width,
            height,
            grid: tiling::needs_tiling(width, height, tile_budget),
        }
    }

    /// Video frames decide tiling on the source size, then cut the resized
    /// frame with that grid.
    pub fn for_video(
        source_width: u32,
        source_height: u32,
        resize_factor: f64,
        tile_budget: u32,
    ) -> Self {
        let (width, height) = resized_dimensions(source_width, source_height, resize_factor);
        let grid = tiling::needs_tiling(source_width, source_height, tile_budget)
            .map(|grid| TileGrid::new(width, height, grid.cols, grid.rows));
        Self {
            width,
            height,
            grid,
        }
    }

    pub fn target(&self) -> (u32, u32) {
        (self.width * UPSCALE_FACTOR, self.height * UPSCALE_FACTOR)
    }
}

/// `floor(dimension × factor)`, never below one pixel.
pub fn resized_dimensions(width: u32, height: u32, resize_factor: f64) -> (u32, u32) {
    let scale = |value: u32| ((f64::from(value) * resize_factor) as u32).max(1);
    (scale(width), scale(height))
}

/// Area averaging when shrinking, linear when growing.
pub fn pre_resize(image: DynamicImage, width: u32, height: u32) -> DynamicImage {
    let (source_width, source_height) = image.dimensions();
    if (source_width, source_height) == (width, height) {
        return image;
    }
    if width <= source_width && height <= source_height {
        image.thumbnail_exact(width, height)
    } else {
        image.resize_exact(width, height, FilterType::Triangle)
    }
}

/// Run the full per-picture path for `source`.
///
/// `on_step` is called before each stage; an error from it aborts the picture.
pub fn upscale_picture(
    model: &mut dyn SuperResolution,
    source: &DynamicImage,
    plan: &FramePlan,
    interpolate: bool,
    on_step: &mut dyn FnMut(FrameStep) -> Result<()>,
) -> Result<DynamicImage> {
    let resized = pre_resize(source.clone(), plan.width, plan.height);
    let (target_width, target_height) = plan.target();

    let upscaled = match &plan.grid {
        Some(grid) => upscale_tiled(model, &resized, grid, plan.target(), on_step)?,
        None => {
            on_step(FrameStep::Direct)?;
            let enhanced = enhance(model, &resized).map_err(UpscaleError::Inference)?;
            tiling::fix_output_shape(&resized, enhanced)
        }
    };

    if interpolate {
        Ok(blend_with_source(source, &upscaled, target_width, target_height))
    } else {
        Ok(upscaled)
    }
}

fn upscale_tiled(
    model: &mut dyn SuperResolution,
    image: &DynamicImage,
    grid: &TileGrid,
    (target_width, target_height): (u32, u32),
    on_step: &mut dyn FnMut(FrameStep) -> Result<()>,
) -> Result<DynamicImage> {
    on_step(FrameStep::Tiling { tiles: grid.len() })?;

    let color = expand_grayscale(image);
    let tiles = tiling::split(&color, grid);
    let total = tiles.len();

    let mut upscaled = Vec::with_capacity(total);
    for (index, tile) in tiles.into_iter().enumerate() {
        on_step(FrameStep::Tile { index, total })?;
        let enhanced = enhance(model, &tile.image).map_err(|err| {
            UpscaleError::Inference(err.context(format!("tile {} of {total}", index + 1)))
        })?;
        upscaled.push(Tile {
            row: tile.row,
            col: tile.col,
            image: tiling::fix_output_shape(&tile.image, enhanced),
        });
    }

    on_step(FrameStep::Reconstructing)?;
    tiling::merge(&upscaled, target_width, target_height)
}

/// Tiles must carry three or four channels.
fn expand_grayscale(image: &DynamicImage) -> DynamicImage {
    match image {
        DynamicImage::ImageLuma8(_) => DynamicImage::ImageRgb8(image.to_rgb8()),
        DynamicImage::ImageLumaA8(_) => DynamicImage::ImageRgba8(image.to_rgba8()),
        DynamicImage::ImageLuma16(_) => DynamicImage::ImageRgb16(image.to_rgb16()),
        DynamicImage::ImageLumaA16(_) => DynamicImage::ImageRgba16(image.to_rgba16()),
        other => other.clone(),
    }
}

/// Equal-weight average of `upscaled` and `source` stretched to the same
/// size, alpha included. The result is RGBA.
pub fn blend_with_source(
    source: &DynamicImage,
    upscaled: &DynamicImage,
    width: u32,
    height: u32,
) -> DynamicImage {
    let stretched = source.resize_exact(width, height, FilterType::Triangle);
    let upscaled = if upscaled.dimensions() == (width, height) {
        upscaled.clone()
    } else {
        upscaled.resize_exact(width, height, FilterType::Triangle)
    };

    if is_wide(source) || is_wide(&upscaled) {
        let (a, b) = (upscaled.to_rgba16(), stretched.to_rgba16());
        DynamicImage::ImageRgba16(ImageBuffer::from_fn(width, height, |x, y| {
            average(a.get_pixel(x, y), b.get_pixel(x, y), |p, q| {
                ((u32::from(p) + u32::from(q) + 1) / 2) as u16
            })
        }))
    } else {
        let (a, b) = (upscaled.to_rgba8(), stretched.to_rgba8());
        DynamicImage::ImageRgba8(ImageBuffer::from_fn(width, height, |x, y| {
            average(a.get_pixel(x, y), b.get_pixel(x, y), |p, q| {
                ((u16::from(p) + u16::from(q) + 1) / 2) as u8
            })
        }))
    }
}

fn average<T: Copy>(a: &Rgba<T>, b: &Rgba<T>, mean: impl Fn(T, T) -> T) -> Rgba<T> {
    Rgba([
        mean(a[0], b[0]),
        mean(a[1], b[1]),
        mean(a[2], b[2]),
        mean(a[3], b[3]),
    ])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::testing::{NearestX4, OffGridX4};
    use image::{GrayImage, Luma, Rgb, RgbImage, RgbaImage};

    fn checker(width: u32, height: u32) -> DynamicImage {
        DynamicImage::ImageRgb8(RgbImage::from_fn(width, height, |x, y| {
            Rgb([(x * 13 % 256) as u8, (y * 29 % 256) as u8, ((x ^ y) % 256) as u8])
        }))
    }

    fn no_steps() -> impl FnMut(FrameStep) -> Result<()> {
        |_| Ok(())
    }

    #[test]
    fn resized_dimensions_truncate() {
        assert_eq!(resized_dimensions(1920, 1080, 0.5), (960, 540));
        assert_eq!(resized_dimensions(101, 33, 0.5), (50, 16));
        assert_eq!(resized_dimensions(3, 3, 0.1), (1, 1));
        assert_eq!(resized_dimensions(640, 480, 1.0), (640, 480));
    }

    #[test]
    fn plan_tiles_on_resized_dimensions() {
        let plan = FramePlan::new(2000, 2000, 0.5, 512);
        assert_eq!((plan.width, plan.height), (1000, 1000));
        let grid = plan.grid.expect("1000 px exceeds a 512 px budget");
        assert_eq!((grid.cols, grid.rows), (2, 2));
        assert_eq!(plan.target(), (4000, 4000));

        assert_eq!(FramePlan::new(2000, 2000, 0.25, 512).grid, None);
    }

    #[test]
    fn video_plan_tiles_on_source_dimensions() {
        let plan = FramePlan::for_video(1002, 1002, 0.5, 512);
        assert_eq!((plan.width, plan.height), (501, 501));
        let grid = plan.grid.expect("1002 px source exceeds a 512 px budget");
        assert_eq!((grid.cols, grid.rows), (2, 2));
        assert_eq!((grid.tile_width, grid.tile_height), (250, 250));
        assert_eq!(FramePlan::new(1002, 1002, 0.5, 512).grid, None);

        assert_eq!(FramePlan::for_video(500, 400, 2.0, 512).grid, None);
    }

    #[test]
    fn pre_resize_shrinks_and_grows_to_exact_size() {
        let image = checker(40, 20);
        assert_eq!(pre_resize(image.clone(), 20, 10).dimensions(), (20, 10));
        assert_eq!(pre_resize(image.clone(), 60, 30).dimensions(), (60, 30));
        assert_eq!(pre_resize(image, 40, 20).dimensions(), (40, 20));
    }

    #[test]
    fn small_picture_is_enhanced_directly() {
        let image = checker(16, 12);
        let plan = FramePlan::new(16, 12, 1.0, 512);
        let mut steps = Vec::new();

        let out = upscale_picture(
            &mut NearestX4::default(),
            &image,
            &plan,
            false,
            &mut |step| {
                steps.push(step);
                Ok(())
            },
        )
        .expect("upscale");

        assert_eq!(steps, [FrameStep::Direct]);
        assert_eq!(out.dimensions(), (64, 48));
        assert_eq!(out.color(), image::ColorType::Rgb8);
    }

    #[test]
    fn tiled_matches_direct_on_even_grid() {
        let image = checker(64, 32);
        let tiled_plan = FramePlan::new(64, 32, 1.0, 16);
        let direct_plan = FramePlan::new(64, 32, 1.0, 64);
        assert!(tiled_plan.grid.is_some());
        assert!(direct_plan.grid.is_none());

        let tiled = upscale_picture(
            &mut NearestX4::default(),
            &image,
            &tiled_plan,
            false,
            &mut no_steps(),
        )
        .expect("tiled");
        let direct = upscale_picture(
            &mut NearestX4::default(),
            &image,
            &direct_plan,
            false,
            &mut no_steps(),
        )
        .expect("direct");

        assert_eq!(tiled.to_rgba8(), direct.to_rgba8());
    }

    #[test]
    fn thousand_pixel_square_becomes_four_tiles_and_rgba_canvas() {
        let image = checker(1000, 1000);
        let plan = FramePlan::new(1000, 1000, 1.0, 512);
        let mut steps = Vec::new();

        let out = upscale_picture(
            &mut NearestX4::default(),
            &image,
            &plan,
            false,
            &mut |step| {
                steps.push(step);
                Ok(())
            },
        )
        .expect("upscale");

        assert_eq!(out.dimensions(), (4000, 4000));
        assert_eq!(out.color(), image::ColorType::Rgba8);
        assert_eq!(
            steps,
            [
                FrameStep::Tiling { tiles: 4 },
                FrameStep::Tile { index: 0, total: 4 },
                FrameStep::Tile { index: 1, total: 4 },
                FrameStep::Tile { index: 2, total: 4 },
                FrameStep::Tile { index: 3, total: 4 },
                FrameStep::Reconstructing,
            ]
        );
    }

    #[test]
    fn off_grid_model_output_is_fixed_per_tile() {
        let image = checker(32, 32);
        let plan = FramePlan::new(32, 32, 1.0, 16);

        let out = upscale_picture(&mut OffGridX4, &image, &plan, false, &mut no_steps())
            .expect("upscale");

        assert_eq!(out.dimensions(), (128, 128));
        assert_eq!(out.to_rgba8().get_pixel(127, 127)[3], 255);
    }

    #[test]
    fn grayscale_is_expanded_before_tiling() {
        let image = DynamicImage::ImageLuma8(GrayImage::from_pixel(20, 20, Luma([90])));
        let plan = FramePlan::new(20, 20, 1.0, 10);

        let out = upscale_picture(
            &mut NearestX4::default(),
            &image,
            &plan,
            false,
            &mut no_steps(),
        )
        .expect("upscale");

        assert_eq!(out.to_rgba8().get_pixel(5, 5), &Rgba([90, 90, 90, 255]));
    }

    #[test]
    fn enhancement_failure_is_classified_with_tile_position() {
        let image = checker(32, 32);
        let plan = FramePlan::new(32, 32, 1.0, 16);
        let mut model = NearestX4 {
            fail_on_call: Some(3),
            ..Default::default()
        };

        let err = upscale_picture(&mut model, &image, &plan, false, &mut no_steps())
            .expect_err("third tile fails");

        let classified = err.downcast_ref::<UpscaleError>().expect("classified");
        assert_eq!(classified.kind(), "inference");
        let message = format!("{err:#}");
        assert!(message.contains("tile 3 of 4"), "{message}");
        assert!(message.contains("device lost"), "{message}");
    }

    #[test]
    fn step_callback_can_abort() {
        let image = checker(32, 32);
        let plan = FramePlan::new(32, 32, 1.0, 16);
        let model = NearestX4::default();
        let calls = model.calls.clone();
        let mut model = model;

        let result = upscale_picture(&mut model, &image, &plan, false, &mut |step| match step {
            FrameStep::Tile { index: 2, .. } => anyhow::bail!("stop requested"),
            _ => Ok(()),
        });

        assert!(result.is_err());
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 2);
    }

    #[test]
    fn blend_averages_every_channel() {
        let source = DynamicImage::ImageRgba8(RgbaImage::from_pixel(2, 2, Rgba([0, 100, 200, 255])));
        let upscaled =
            DynamicImage::ImageRgba8(RgbaImage::from_pixel(8, 8, Rgba([100, 100, 0, 55])));

        let blended = blend_with_source(&source, &upscaled, 8, 8);

        assert_eq!(blended.color(), image::ColorType::Rgba8);
        assert_eq!(blended.to_rgba8().get_pixel(4, 4), &Rgba([50, 100, 100, 155]));
    }

    #[test]
    fn interpolated_output_is_rgba_at_target_size() {
        let image = checker(8, 8);
        let plan = FramePlan::new(8, 8, 0.5, 512);

        let out = upscale_picture(
            &mut NearestX4::default(),
            &image,
            &plan,
            true,
            &mut no_steps(),
        )
        .expect("upscale");

        assert_eq!(out.dimensions(), (16, 16));
        assert_eq!(out.color(), image::ColorType::Rgba8);
    }
}
