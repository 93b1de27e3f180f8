//! Video upscaling through a frame sequence on disk.
//!
//! FFmpeg extracts every frame as a numbered PNG (plus the first audio track
//! as MP3) into the job's temporary directory. Frames are upscaled one by one
//! into `frame_NNNNNNNN_upscaled.png` siblings and FFmpeg then encodes those
//! at the source frame rate, muxing the audio back when the target container
//! accepts it.

use std::collections::{HashMap, VecDeque};
use std::fs;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::thread;

use anyhow::{anyhow, bail, Context, Result};
use image::GenericImageView;
use tracing::{debug, info, warn};

use super::frame::{upscale_picture, FramePlan};
use crate::error::UpscaleError;
use crate::inference::SuperResolution;
use crate::job::Job;
use crate::media::{output_path, write_image, ImageFormat, VideoContainer};
use crate::progress::{ProgressEvent, StatusSink};
use crate::workspace::Workspace;

const FRAME_PATTERN: &str = "frame_%08d.png";
const UPSCALED_FRAME_PATTERN: &str = "frame_%08d_upscaled.png";
const AUDIO_FILE_NAME: &str = "audio.mp3";
const STATUS_EVERY_N_FRAMES: usize = 8;
const FALLBACK_FRAME_RATE: &str = "24000/1001";
const STDERR_TAIL_LINES: usize = 20;

// ---------------------------------------------------------------------------
// ffprobe JSON model (serde)
// ---------------------------------------------------------------------------

#[derive(serde::Deserialize, Debug)]
struct FfprobeOutput {
    #[serde(default)]
    streams: Vec<FfprobeStream>,
    #[serde(default)]
    format: Option<FfprobeFormat>,
}

#[derive(serde::Deserialize, Debug)]
struct FfprobeStream {
    index: usize,
    codec_type: Option<String>,
    width: Option<u32>,
    height: Option<u32>,
    r_frame_rate: Option<String>,
    avg_frame_rate: Option<String>,
    nb_frames: Option<String>,
    duration: Option<String>,
    #[serde(default)]
    disposition: HashMap<String, serde_json::Value>,
}

#[derive(serde::Deserialize, Debug)]
struct FfprobeFormat {
    duration: Option<String>,
}

/// What the pipeline needs to know about a source video.
#[derive(Debug, Clone, PartialEq)]
pub struct VideoProbe {
    pub width: u32,
    pub height: u32,
    pub fps: f64,
    /// Rate as FFmpeg reported it (`30000/1001`), passed back verbatim.
    pub frame_rate: String,
    pub frame_count: Option<u64>,
    pub duration_secs: Option<f64>,
    pub has_audio: bool,
}

fn parse_frame_rate(s: &str) -> Option<f64> {
    match s.split_once('/') {
        Some((num, den)) => {
            let num: f64 = num.trim().parse().ok()?;
            let den: f64 = den.trim().parse().ok()?;
            (den > 0.0 && num > 0.0).then_some(num / den)
        }
        None => s.trim().parse().ok().filter(|fps: &f64| *fps > 0.0),
    }
}

fn disposition_flag(stream: &FfprobeStream, key: &str) -> bool {
    stream
        .disposition
        .get(key)
        .and_then(|value| value.as_bool().or_else(|| value.as_i64().map(|n| n != 0)))
        .unwrap_or(false)
}

/// First real video stream; cover art only when nothing else exists.
fn select_primary_video_stream(streams: &[FfprobeStream]) -> Option<&FfprobeStream> {
    streams
        .iter()
        .filter(|stream| stream.codec_type.as_deref() == Some("video"))
        .min_by_key(|stream| (disposition_flag(stream, "attached_pic"), stream.index))
}

fn parse_probe(json: &[u8]) -> Result<VideoProbe> {
    let probe: FfprobeOutput =
        serde_json::from_slice(json).context("failed to parse ffprobe JSON output")?;

    let stream = select_primary_video_stream(&probe.streams)
        .ok_or_else(|| anyhow!("no video stream found"))?;
    let width = stream
        .width
        .ok_or_else(|| anyhow!("video stream missing width"))?;
    let height = stream
        .height
        .ok_or_else(|| anyhow!("video stream missing height"))?;

    let rate = [stream.r_frame_rate.as_deref(), stream.avg_frame_rate.as_deref()]
        .into_iter()
        .flatten()
        .find_map(|rate| parse_frame_rate(rate).map(|fps| (rate.to_string(), fps)));
    let (frame_rate, fps) = match rate {
        Some(rate) => rate,
        None => {
            warn!("could not determine frame rate, defaulting to 23.976");
            (FALLBACK_FRAME_RATE.to_string(), 24000.0 / 1001.0)
        }
    };

    let duration_secs = stream
        .duration
        .as_deref()
        .or(probe.format.as_ref().and_then(|f| f.duration.as_deref()))
        .and_then(|d| d.parse::<f64>().ok());
    let frame_count = stream
        .nb_frames
        .as_deref()
        .and_then(|n| n.parse::<u64>().ok())
        .or_else(|| duration_secs.map(|secs| (secs * fps).round() as u64));
    let has_audio = probe
        .streams
        .iter()
        .any(|s| s.codec_type.as_deref() == Some("audio"));

    Ok(VideoProbe {
        width,
        height,
        fps,
        frame_rate,
        frame_count,
        duration_secs,
        has_audio,
    })
}

pub fn probe_video(path: &Path) -> Result<VideoProbe> {
    let output = crate::runtime::command_for("ffprobe")
        .args(["-v", "quiet", "-print_format", "json", "-show_format", "-show_streams"])
        .arg(path)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .context("failed to execute ffprobe (is FFmpeg installed?)")?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        bail!(
            "ffprobe exited with status {}: {}",
            output.status,
            stderr.trim()
        );
    }

    parse_probe(&output.stdout).with_context(|| format!("failed to probe {}", path.display()))
}

// ---------------------------------------------------------------------------
// FFmpeg invocations
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy)]
enum FfmpegStage {
    Extract,
    Encode,
}

/// Run FFmpeg to completion, draining stderr into the log. The last lines of
/// stderr become the error message on failure.
fn run_ffmpeg(args: &[String], stage: FfmpegStage) -> Result<()> {
    debug!(?stage, args = %args.join(" "), "Running ffmpeg");

    let mut child = crate::runtime::command_for("ffmpeg")
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::piped())
        .spawn()
        .context("failed to launch ffmpeg (is it installed?)")?;

    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("ffmpeg stderr not available"))?;
    let stderr_thread = thread::spawn(move || {
        let mut tail = VecDeque::with_capacity(STDERR_TAIL_LINES);
        for line in BufReader::new(stderr).lines() {
            match line {
                Ok(line) if !line.is_empty() => {
                    match stage {
                        FfmpegStage::Extract => debug!(target: "ffmpeg_stderr", "{}", line),
                        FfmpegStage::Encode => debug!(target: "ffmpeg_encode_stderr", "{}", line),
                    }
                    if tail.len() == STDERR_TAIL_LINES {
                        tail.pop_front();
                    }
                    tail.push_back(line);
                }
                Err(e) => {
                    debug!(target: "ffmpeg_stderr", "read error: {}", e);
                    break;
                }
                _ => {}
            }
        }
        tail
    });

    let status = child.wait().context("failed to wait for ffmpeg")?;
    let tail = stderr_thread
        .join()
        .map_err(|_| anyhow!("ffmpeg stderr reader panicked"))?;

    if !status.success() {
        let tail = Vec::from(tail).join("\n");
        bail!("ffmpeg exited with status {status}: {}", tail.trim());
    }
    Ok(())
}

fn build_extract_args(source: &Path, frame_rate: &str, temp_dir: &Path) -> Vec<String> {
    vec![
        "-nostdin".into(),
        "-y".into(),
        "-v".into(),
        "error".into(),
        "-i".into(),
        source.to_string_lossy().into_owned(),
        "-map".into(),
        "0:v:0".into(),
        "-r".into(),
        frame_rate.to_string(),
        "-start_number".into(),
        "1".into(),
        temp_dir.join(FRAME_PATTERN).to_string_lossy().into_owned(),
    ]
}

fn build_audio_args(source: &Path, audio_path: &Path) -> Vec<String> {
    vec![
        "-nostdin".into(),
        "-y".into(),
        "-v".into(),
        "error".into(),
        "-i".into(),
        source.to_string_lossy().into_owned(),
        "-map".into(),
        "0:a:0".into(),
        "-vn".into(),
        "-c:a".into(),
        "libmp3lame".into(),
        "-q:a".into(),
        "2".into(),
        audio_path.to_string_lossy().into_owned(),
    ]
}

/// Frame paths in presentation order plus the optional audio track.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameSequence {
    pub frames: Vec<PathBuf>,
    pub audio: Option<PathBuf>,
}

/// Extract every frame of `source` (and its audio, if any) into `temp_dir`.
///
/// Audio extraction failures are logged and leave `audio` empty.
pub fn extract_frames(source: &Path, probe: &VideoProbe, temp_dir: &Path) -> Result<FrameSequence> {
    run_ffmpeg(
        &build_extract_args(source, &probe.frame_rate, temp_dir),
        FfmpegStage::Extract,
    )
    .context("frame extraction failed")?;

    let frames = list_frames(temp_dir)?;
    if frames.is_empty() {
        bail!("no frames could be extracted from {}", source.display());
    }

    let audio = if probe.has_audio {
        let audio_path = temp_dir.join(AUDIO_FILE_NAME);
        match run_ffmpeg(&build_audio_args(source, &audio_path), FfmpegStage::Extract) {
            Ok(()) if audio_path.is_file() => Some(audio_path),
            Ok(()) => None,
            Err(err) => {
                warn!(source = %source.display(), error = %format!("{err:#}"), "Audio extraction failed, continuing without audio");
                None
            }
        }
    } else {
        None
    };

    debug!(frames = frames.len(), audio = audio.is_some(), "Frames extracted");
    Ok(FrameSequence { frames, audio })
}

/// `frame_NNNNNNNN.png` files sorted by number.
fn list_frames(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut frames: Vec<PathBuf> = fs::read_dir(dir)
        .with_context(|| format!("failed to list {}", dir.display()))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|path| {
            path.file_stem()
                .and_then(|stem| stem.to_str())
                .and_then(|stem| stem.strip_prefix("frame_"))
                .is_some_and(|digits| !digits.is_empty() && digits.bytes().all(|b| b.is_ascii_digit()))
                && path.extension().is_some_and(|ext| ext == "png")
        })
        .collect();
    frames.sort();
    Ok(frames)
}

fn upscaled_frame_path(frame: &Path) -> PathBuf {
    let stem = frame
        .file_stem()
        .map(|stem| stem.to_string_lossy().into_owned())
        .unwrap_or_default();
    frame.with_file_name(format!("{stem}_upscaled.png"))
}

/// Frames come from FFmpeg, so an unreadable one is an extraction fault.
fn read_frame(path: &Path) -> Result<image::DynamicImage, UpscaleError> {
    image::open(path)
        .with_context(|| format!("failed to read frame: {}", path.display()))
        .map_err(UpscaleError::Encode)
}

#[derive(Debug, Clone)]
pub struct EncoderConfig {
    /// Directory holding the upscaled frame sequence.
    pub frames_dir: PathBuf,
    pub frame_rate: String,
    pub audio: Option<PathBuf>,
    pub container: VideoContainer,
    pub threads: u32,
    pub output_path: PathBuf,
}

impl EncoderConfig {
    pub fn build_ffmpeg_args(&self) -> Vec<String> {
        let codec = self.container.video_codec();
        let audio = self
            .audio
            .as_ref()
            .zip(self.container.audio_codec());

        let mut args: Vec<String> = vec![
            "-nostdin".into(),
            "-y".into(),
            "-framerate".into(),
            self.frame_rate.clone(),
            "-start_number".into(),
            "1".into(),
            "-i".into(),
            self.frames_dir
                .join(UPSCALED_FRAME_PATTERN)
                .to_string_lossy()
                .into_owned(),
        ];
        if let Some((audio_path, _)) = audio {
            args.extend(["-i".into(), audio_path.to_string_lossy().into_owned()]);
        }

        args.extend(["-map".into(), "0:v:0".into()]);
        if let Some((_, audio_codec)) = audio {
            args.extend([
                "-map".into(),
                "1:a:0".into(),
                "-c:a".into(),
                audio_codec.into(),
                "-shortest".into(),
            ]);
        }

        args.extend(["-c:v".into(), codec.into()]);
        if codec == "libvpx" {
            args.extend(["-crf".into(), "10".into(), "-b:v".into(), "8M".into()]);
        }
        args.extend([
            "-pix_fmt".into(),
            self.container.pixel_format().into(),
            "-r".into(),
            self.frame_rate.clone(),
            "-threads".into(),
            self.threads.to_string(),
            self.output_path.to_string_lossy().into_owned(),
        ]);
        args
    }
}

pub fn encode(config: &EncoderConfig) -> Result<()> {
    run_ffmpeg(&config.build_ffmpeg_args(), FfmpegStage::Encode)
        .with_context(|| format!("failed to encode {}", config.output_path.display()))
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

/// Upscale one video and write it next to the source.
///
/// The temporary directory is recreated here and left in place; the job's
/// cleanup removes it.
pub fn upscale_video(
    path: &Path,
    file_number: usize,
    job: &Job,
    model: &mut dyn SuperResolution,
    sink: &mut dyn StatusSink,
    workspace: &Workspace,
) -> Result<PathBuf> {
    let destination = output_path(
        path,
        &job.model_id,
        job.resize_percent,
        job.interpolate,
        job.video_container.extension(),
    );
    let temp_dir = workspace.prepare_temp_dir()?;

    sink.publish(&ProgressEvent::Stage(format!(
        "{file_number}. Extracting video frames"
    )))?;
    let probe = probe_video(path).map_err(UpscaleError::Encode)?;
    let sequence = extract_frames(path, &probe, &temp_dir).map_err(UpscaleError::Encode)?;
    let total = sequence.frames.len();
    info!(
        path = %path.display(),
        frames = total,
        fps = probe.fps,
        audio = sequence.audio.is_some(),
        "Video frames extracted"
    );

    sink.publish(&ProgressEvent::Stage(format!("{file_number}. Upscaling video")))?;
    let first = read_frame(&sequence.frames[0])?;
    let (width, height) = first.dimensions();
    let plan = FramePlan::for_video(width, height, job.resize_factor(), job.tile_budget);
    let noun = if plan.grid.is_some() { "frame" } else { "frames" };
    debug!(
        width,
        height,
        resized_width = plan.width,
        resized_height = plan.height,
        tiles = plan.grid.map_or(1, |grid| grid.len()),
        "Video frame plan"
    );

    for (index, frame_path) in sequence.frames.iter().enumerate() {
        if index % STATUS_EVERY_N_FRAMES == 0 {
            sink.publish(&ProgressEvent::Stage(format!(
                "{file_number}. Upscaling {noun} {index}/{total}"
            )))?;
        }

        let frame = if index == 0 {
            first.clone()
        } else {
            read_frame(frame_path)?
        };
        let upscaled = upscale_picture(model, &frame, &plan, job.interpolate, &mut |_| Ok(()))?;
        write_image(&upscaled, &upscaled_frame_path(frame_path), ImageFormat::Png)?;
    }

    sink.publish(&ProgressEvent::Stage(format!(
        "{file_number}. Processing upscaled video"
    )))?;
    let config = EncoderConfig {
        frames_dir: temp_dir,
        frame_rate: probe.frame_rate.clone(),
        audio: sequence.audio.clone(),
        container: job.video_container,
        threads: job.encoder_threads,
        output_path: destination.clone(),
    };
    encode(&config).map_err(UpscaleError::Encode)?;

    info!(output = %destination.display(), "Video written");
    Ok(destination)
}
