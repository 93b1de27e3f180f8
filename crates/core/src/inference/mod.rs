//! The boundary between the pipelines and the neural network.
//!
//! A [`ModelLoader`] turns a model identifier into a [`SuperResolution`]
//! instance once per job. The network only ever sees `[1, 3, H, W]` tensors in
//! `[0, 1]`; [`enhance`] handles the pixel layouts around it:
//!
//! - grayscale is replicated to three channels and collapsed back afterwards,
//! - alpha is run through the same network as a second three-channel pass and
//!   reattached as the output alpha,
//! - 8-bit sources are normalized by 255, 16-bit sources by 65535, and the
//!   output keeps the source depth.

pub mod backend;
pub mod onnx;

use anyhow::{bail, Result};
use image::{DynamicImage, GenericImageView, Rgb, Rgb32FImage, Rgba, Rgba32FImage};
use ndarray::Array4;

use crate::device::DeviceId;
use crate::error::UpscaleError;
use crate::job::Precision;
use crate::tiling::is_wide;

/// A loaded 4x super-resolution network.
pub trait SuperResolution: Send {
    /// `input` is `[1, 3, H, W]` in `[0, 1]`; the result should be
    /// `[1, 3, 4H, 4W]`.
    fn upscale(&mut self, input: Array4<f32>) -> Result<Array4<f32>>;
}

pub trait ModelLoader {
    /// Load weights for `model_id` onto `device`. Called once per job.
    fn load(
        &self,
        model_id: &str,
        device: DeviceId,
        precision: Precision,
    ) -> Result<Box<dyn SuperResolution>, UpscaleError>;
}

/// Upscale one image or tile, keeping its channel layout and bit depth.
pub fn enhance(model: &mut dyn SuperResolution, image: &DynamicImage) -> Result<DynamicImage> {
    let (width, height) = image.dimensions();
    if width == 0 || height == 0 {
        bail!("cannot enhance an empty {width}x{height} image");
    }

    let color = run_network(model, &image.to_rgb32f())?;

    let alpha = if image.color().has_alpha() {
        let rgba = image.to_rgba32f();
        let planes = Rgb32FImage::from_fn(width, height, |x, y| {
            let a = rgba.get_pixel(x, y)[3];
            Rgb([a, a, a])
        });
        let upscaled = run_network(model, &planes)?;
        if upscaled.dimensions() != color.dimensions() {
            bail!(
                "alpha pass produced {:?} but color pass produced {:?}",
                upscaled.dimensions(),
                color.dimensions()
            );
        }
        Some(upscaled)
    } else {
        None
    };

    Ok(compose(
        color,
        alpha,
        !image.color().has_color(),
        is_wide(image),
    ))
}

fn run_network(model: &mut dyn SuperResolution, planes: &Rgb32FImage) -> Result<Rgb32FImage> {
    let output = model.upscale(image_to_nchw(planes))?;
    nchw_to_image(&output)
}

fn compose(
    color: Rgb32FImage,
    alpha: Option<Rgb32FImage>,
    grayscale: bool,
    wide: bool,
) -> DynamicImage {
    let color = if grayscale {
        Rgb32FImage::from_fn(color.width(), color.height(), |x, y| {
            let l = luma(color.get_pixel(x, y));
            Rgb([l, l, l])
        })
    } else {
        color
    };

    match (alpha, grayscale, wide) {
        (None, false, false) => DynamicImage::ImageRgb8(DynamicImage::ImageRgb32F(color).to_rgb8()),
        (None, false, true) => DynamicImage::ImageRgb16(DynamicImage::ImageRgb32F(color).to_rgb16()),
        (None, true, false) => DynamicImage::ImageLuma8(DynamicImage::ImageRgb32F(color).to_luma8()),
        (None, true, true) => DynamicImage::ImageLuma16(DynamicImage::ImageRgb32F(color).to_luma16()),
        (Some(alpha), grayscale, wide) => {
            let rgba = Rgba32FImage::from_fn(color.width(), color.height(), |x, y| {
                let c = color.get_pixel(x, y);
                Rgba([c[0], c[1], c[2], luma(alpha.get_pixel(x, y))])
            });
            let merged = DynamicImage::ImageRgba32F(rgba);
            match (grayscale, wide) {
                (false, false) => DynamicImage::ImageRgba8(merged.to_rgba8()),
                (false, true) => DynamicImage::ImageRgba16(merged.to_rgba16()),
                (true, false) => DynamicImage::ImageLumaA8(merged.to_luma_alpha8()),
                (true, true) => DynamicImage::ImageLumaA16(merged.to_luma_alpha16()),
            }
        }
    }
}

fn luma(pixel: &Rgb<f32>) -> f32 {
    (0.299 * pixel[0] + 0.587 * pixel[1] + 0.114 * pixel[2]).clamp(0.0, 1.0)
}

/// Interleaved RGB → planar `[1, 3, H, W]`.
pub(crate) fn image_to_nchw(image: &Rgb32FImage) -> Array4<f32> {
    let (width, height) = (image.width() as usize, image.height() as usize);
    let mut tensor = Array4::<f32>::zeros((1, 3, height, width));
    for (x, y, pixel) in image.enumerate_pixels() {
        for c in 0..3 {
            tensor[[0, c, y as usize, x as usize]] = pixel[c];
        }
    }
    tensor
}

/// Planar `[1, 3, H, W]` → interleaved RGB, clamped to `[0, 1]`.
pub(crate) fn nchw_to_image(tensor: &Array4<f32>) -> Result<Rgb32FImage> {
    let shape = tensor.shape();
    if shape[0] != 1 || shape[1] != 3 {
        bail!("model output must be [1, 3, H, W], got {shape:?}");
    }
    let (height, width) = (shape[2], shape[3]);
    let width_u32 = u32::try_from(width)?;
    let height_u32 = u32::try_from(height)?;
    Ok(Rgb32FImage::from_fn(width_u32, height_u32, |x, y| {
        let (x, y) = (x as usize, y as usize);
        Rgb([
            tensor[[0, 0, y, x]].clamp(0.0, 1.0),
            tensor[[0, 1, y, x]].clamp(0.0, 1.0),
            tensor[[0, 2, y, x]].clamp(0.0, 1.0),
        ])
    }))
}


#[cfg(test)]
mod tests {
    use super::testing::NearestX4;
    use super::*;
    use image::{GrayImage, ImageBuffer, Luma, RgbImage, RgbaImage};

    #[test]
    fn rgb_output_is_four_times_larger_and_nearest() {
        let mut model = NearestX4::default();
        let image = DynamicImage::ImageRgb8(RgbImage::from_fn(3, 2, |x, y| {
            Rgb([x as u8 * 40, y as u8 * 90, 200])
        }));

        let out = enhance(&mut model, &image).expect("enhance").to_rgb8();

        assert_eq!(out.dimensions(), (12, 8));
        assert_eq!(out.get_pixel(11, 7), &Rgb([80, 90, 200]));
        assert_eq!(out.get_pixel(0, 0), &Rgb([0, 0, 200]));
    }

    #[test]
    fn alpha_runs_as_second_pass_and_is_reattached() {
        let calls = std::sync::Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let mut model = NearestX4 {
            calls: calls.clone(),
            fail_on_call: None,
        };
        let image = DynamicImage::ImageRgba8(RgbaImage::from_fn(2, 2, |x, _| {
            Rgba([10, 20, 30, if x == 0 { 0 } else { 255 }])
        }));

        let out = enhance(&mut model, &image).expect("enhance");

        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 2);
        assert_eq!(out.color(), image::ColorType::Rgba8);
        let out = out.to_rgba8();
        assert_eq!(out.get_pixel(0, 0), &Rgba([10, 20, 30, 0]));
        assert_eq!(out.get_pixel(7, 7), &Rgba([10, 20, 30, 255]));
    }

    #[test]
    fn grayscale_stays_grayscale() {
        let mut model = NearestX4::default();
        let image = DynamicImage::ImageLuma8(GrayImage::from_pixel(2, 2, Luma([77])));

        let out = enhance(&mut model, &image).expect("enhance");

        assert_eq!(out.color(), image::ColorType::L8);
        assert_eq!(out.to_luma8().get_pixel(5, 5), &Luma([77]));
    }

    #[test]
    fn sixteen_bit_depth_is_preserved() {
        let mut model = NearestX4::default();
        let image = DynamicImage::ImageRgb16(ImageBuffer::from_pixel(1, 1, Rgb([0u16, 32768, 65535])));

        let out = enhance(&mut model, &image).expect("enhance");

        assert_eq!(out.color(), image::ColorType::Rgb16);
        let px = *out.to_rgb16().get_pixel(3, 3);
        assert_eq!(px[0], 0);
        assert_eq!(px[2], 65535);
        assert!((i32::from(px[1]) - 32768).abs() <= 1);
    }

    #[test]
    fn model_errors_propagate() {
        let mut model = NearestX4 {
            fail_on_call: Some(1),
            ..Default::default()
        };
        let image = DynamicImage::ImageRgb8(RgbImage::new(2, 2));
        let err = enhance(&mut model, &image).expect_err("model failure");
        assert!(err.to_string().contains("device lost"));
    }

    #[test]
    fn nchw_conversion_keeps_channel_planes() {
        let image = Rgb32FImage::from_fn(2, 1, |x, _| Rgb([x as f32, 0.5, 1.0]));
        let tensor = image_to_nchw(&image);
        assert_eq!(tensor.shape(), &[1, 3, 1, 2]);
        assert_eq!(tensor[[0, 0, 0, 1]], 1.0);
        assert_eq!(tensor[[0, 1, 0, 0]], 0.5);

        let back = nchw_to_image(&tensor).expect("back to image");
        assert_eq!(back, image);
    }

    #[test]
    fn rejects_wrong_output_layout() {
        let tensor = Array4::<f32>::zeros((1, 1, 4, 4));
        assert!(nchw_to_image(&tensor).is_err());
    }
}
