use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use image::GenericImageView;
use tracing::{debug, info};

use super::frame::{upscale_picture, FramePlan, FrameStep};
use crate::inference::SuperResolution;
use crate::job::Job;
use crate::media::{output_path, write_image};
use crate::progress::{ProgressEvent, StatusSink};

/// Upscale one still image and write it next to the source.
///
/// `file_number` is the 1-based position of the file in the batch.
pub fn upscale_image(
    path: &Path,
    file_number: usize,
    job: &Job,
    model: &mut dyn SuperResolution,
    sink: &mut dyn StatusSink,
) -> Result<PathBuf> {
    let destination = output_path(
        path,
        &job.model_id,
        job.resize_percent,
        job.interpolate,
        job.image_format.extension(),
    );

    let source = image::open(path)
        .with_context(|| format!("failed to read image: {}", path.display()))?;
    let (width, height) = source.dimensions();
    let plan = FramePlan::new(width, height, job.resize_factor(), job.tile_budget);
    debug!(
        path = %path.display(),
        width,
        height,
        resized_width = plan.width,
        resized_height = plan.height,
        tiles = plan.grid.map_or(1, |grid| grid.len()),
        "Upscaling image"
    );

    let upscaled = upscale_picture(model, &source, &plan, job.interpolate, &mut |step| {
        let status = match step {
            FrameStep::Tiling { tiles } => format!("{file_number}. Tiling image in {tiles}"),
            FrameStep::Tile { index, total } => {
                format!("{file_number}. Upscaling tiles {index}/{total}")
            }
            FrameStep::Reconstructing => format!("{file_number}. Reconstructing image by tiles"),
            FrameStep::Direct => format!("{file_number}. Upscaling image"),
        };
        sink.publish(&ProgressEvent::Stage(status))
    })?;

    write_image(&upscaled, &destination, job.image_format)?;
    info!(output = %destination.display(), "Image written");
    Ok(destination)
}
