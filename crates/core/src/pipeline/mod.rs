//! Per-file upscaling: [`upscale_image`](self::image::upscale_image) for stills,
//! [`video::upscale_video`] for videos. Both share the picture logic in
//! [`frame`].

pub mod frame;
pub mod image;
pub mod video;
