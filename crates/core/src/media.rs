//! Input classification, output formats and output naming.

use std::borrow::Cow;
use std::fmt;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use image::DynamicImage;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::pipeline::video::probe_video;

const IMAGE_INPUT_EXTENSIONS: [&str; 7] = ["jpg", "jpeg", "png", "webp", "bmp", "tif", "tiff"];
const VIDEO_INPUT_EXTENSIONS: [&str; 12] = [
    "mp4", "webm", "mkv", "flv", "gif", "m4v", "avi", "mov", "qt", "3gp", "mpg", "mpeg",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Image,
    Video,
    Unsupported,
}

impl MediaKind {
    /// Classify by the final extension, case-insensitively.
    pub fn classify(path: &Path) -> Self {
        let Some(ext) = path.extension().and_then(|ext| ext.to_str()) else {
            return Self::Unsupported;
        };
        let ext = ext.to_ascii_lowercase();
        if VIDEO_INPUT_EXTENSIONS.contains(&ext.as_str()) {
            Self::Video
        } else if IMAGE_INPUT_EXTENSIONS.contains(&ext.as_str()) {
            Self::Image
        } else {
            Self::Unsupported
        }
    }
}

/// Drop unsupported inputs, keeping order.
pub fn filter_supported(paths: &[PathBuf]) -> Vec<PathBuf> {
    paths
        .iter()
        .filter(|path| {
            let supported = MediaKind::classify(path) != MediaKind::Unsupported;
            if !supported {
                warn!(file = %path.display(), "Skipping unsupported file type");
            }
            supported
        })
        .cloned()
        .collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    Jpg,
    Png,
    Bmp,
    Tiff,
}

impl ImageFormat {
    pub const ALL: [ImageFormat; 4] = [Self::Jpg, Self::Png, Self::Bmp, Self::Tiff];

    /// Accepts `.png` as well as `png`.
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().trim_start_matches('.').to_ascii_lowercase().as_str() {
            "jpg" => Some(Self::Jpg),
            "png" => Some(Self::Png),
            "bmp" => Some(Self::Bmp),
            "tiff" => Some(Self::Tiff),
            _ => None,
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            Self::Jpg => ".jpg",
            Self::Png => ".png",
            Self::Bmp => ".bmp",
            Self::Tiff => ".tiff",
        }
    }

    fn codec(self) -> image::ImageFormat {
        match self {
            Self::Jpg => image::ImageFormat::Jpeg,
            Self::Png => image::ImageFormat::Png,
            Self::Bmp => image::ImageFormat::Bmp,
            Self::Tiff => image::ImageFormat::Tiff,
        }
    }
}

impl fmt::Display for ImageFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoContainer {
    Mp4,
    Avi,
    Webm,
}

impl VideoContainer {
    pub const ALL: [VideoContainer; 3] = [Self::Mp4, Self::Avi, Self::Webm];

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().trim_start_matches('.').to_ascii_lowercase().as_str() {
            "mp4" => Some(Self::Mp4),
            "avi" => Some(Self::Avi),
            "webm" => Some(Self::Webm),
            _ => None,
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            Self::Mp4 => ".mp4",
            Self::Avi => ".avi",
            Self::Webm => ".webm",
        }
    }

    pub fn video_codec(self) -> &'static str {
        match self {
            Self::Mp4 => "libx264",
            Self::Avi => "png",
            Self::Webm => "libvpx",
        }
    }

    /// Pixel format of the encoded video stream.
    pub fn pixel_format(self) -> &'static str {
        match self {
            Self::Avi => "rgb24",
            Self::Mp4 | Self::Webm => "yuv420p",
        }
    }

    /// `None` when the container is written without audio.
    pub fn audio_codec(self) -> Option<&'static str> {
        match self {
            Self::Mp4 => Some("aac"),
            Self::Avi => Some("libmp3lame"),
            Self::Webm => None,
        }
    }

    pub fn supports_audio(self) -> bool {
        self.audio_codec().is_some()
    }
}

impl fmt::Display for VideoContainer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

/// `{stem}_{model}_{percent}%[_interpolated]{ext}` next to the source file.
pub fn output_path(
    input: &Path,
    model_id: &str,
    resize_percent: u32,
    interpolate: bool,
    extension: &str,
) -> PathBuf {
    let stem = input
        .file_stem()
        .map(|stem| stem.to_string_lossy())
        .unwrap_or_default();
    let mut name = format!("{stem}_{model_id}_{resize_percent}%");
    if interpolate {
        name.push_str("_interpolated");
    }
    name.push_str(extension);

    match input.parent() {
        Some(parent) => parent.join(name),
        None => PathBuf::from(name),
    }
}

/// Encode `image` in the container's supported color layout.
pub fn write_image(image: &DynamicImage, path: &Path, format: ImageFormat) -> Result<()> {
    let prepared: Cow<'_, DynamicImage> = match (format, image) {
        (ImageFormat::Jpg, _) => Cow::Owned(DynamicImage::ImageRgb8(image.to_rgb8())),
        (ImageFormat::Bmp, img) if img.color().has_alpha() => {
            Cow::Owned(DynamicImage::ImageRgba8(image.to_rgba8()))
        }
        (ImageFormat::Bmp, _) => Cow::Owned(DynamicImage::ImageRgb8(image.to_rgb8())),
        (ImageFormat::Tiff, DynamicImage::ImageLumaA8(_)) => {
            Cow::Owned(DynamicImage::ImageRgba8(image.to_rgba8()))
        }
        (ImageFormat::Tiff, DynamicImage::ImageLumaA16(_)) => {
            Cow::Owned(DynamicImage::ImageRgba16(image.to_rgba16()))
        }
        _ => Cow::Borrowed(image),
    };

    prepared
        .save_with_format(path, format.codec())
        .with_context(|| format!("failed to write image: {}", path.display()))
}

/// One-line human description of an input file.
pub fn describe(path: &Path) -> Result<String> {
    let name = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default();

    match MediaKind::classify(path) {
        MediaKind::Image => {
            let (width, height) = image::image_dimensions(path)
                .with_context(|| format!("failed to read image header: {}", path.display()))?;
            Ok(format!("IMAGE | {name} | {width}x{height}"))
        }
        MediaKind::Video => {
            let probe = probe_video(path)?;
            let mut line = format!(
                "VIDEO | {name} | {}x{} | {:.2} fps",
                probe.width, probe.height, probe.fps
            );
            if let Some(frames) = probe.frame_count {
                line.push_str(&format!(" | {frames} frames"));
            }
            if let Some(duration) = probe.duration_secs {
                line.push_str(&format!(" | {duration:.1} sec"));
            }
            Ok(line)
        }
        MediaKind::Unsupported => bail!("unsupported file type: {}", path.display()),
    }
}
