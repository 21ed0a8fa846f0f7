//! On-demand image thumbnailing with a filesystem cache.
//!
//! Derivatives live next to the originals under a thumbnails directory and
//! are regenerated whenever the original is newer than the cached file.

pub mod config;
pub mod handlers_file;
pub mod handlers_health;
pub mod handlers_image;
pub mod image_ref;
pub mod thumbnail_generator;
pub mod thumbnail_types;
pub mod warp_helpers;
