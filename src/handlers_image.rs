use std::path::{Path, PathBuf};

use serde::Deserialize;
use warp::http::Uri;
use warp::{reject, Filter, Rejection, Reply};

use crate::config::Config;
use crate::image_ref::ImageRef;
use crate::thumbnail_generator::ThumbnailGenerator;
use crate::thumbnail_types::ThumbnailSpec;
use crate::warp_helpers::{thumb_rejection, with_config, with_thumbnail_generator, InternalError};

#[derive(Debug, Deserialize)]
pub struct ImageQuery {
    pub w: Option<u32>,
    pub h: Option<u32>,
    pub wm: Option<u8>,
}

/// Answers `GET /img/<path>?w=&h=&wm=` with a 302 redirect to the cached
/// derivative under `/files/`.
pub async fn redirect_to_thumbnail(
    tail: warp::path::Tail,
    query: ImageQuery,
    config: Config,
    thumbnail_generator: ThumbnailGenerator,
) -> Result<impl Reply, Rejection> {
    let relative_path = tail.as_str();
    log::debug!(
        "Thumbnail requested for {}, w: {:?}, h: {:?}",
        relative_path,
        query.w,
        query.h
    );

    let image =
        ImageRef::resolve(Path::new(&config.root_path), relative_path).map_err(thumb_rejection)?;

    let spec = ThumbnailSpec {
        width: query.w.map(|w| config.clamp_dimension(w)),
        height: query.h.map(|h| config.clamp_dimension(h)),
        watermark: if query.wm.unwrap_or(0) == 1 {
            config.watermark_path.as_ref().map(PathBuf::from)
        } else {
            None
        },
    };

    let derivative = thumbnail_generator
        .get_or_generate(&image, &spec)
        .map_err(thumb_rejection)?;
    let reference = thumbnail_generator
        .reference_for(&image, &derivative)
        .map_err(thumb_rejection)?;

    let location = format!("/files/{}", reference);
    match location.parse::<Uri>() {
        Ok(uri) => Ok(warp::redirect::found(uri)),
        Err(e) => {
            log::error!("Unroutable redirect target {}: {}", location, e);
            Err(reject::custom(InternalError {
                message: "Invalid redirect target".to_string(),
            }))
        }
    }
}

pub fn build_image_routes(
    config: Config,
    thumbnail_generator: ThumbnailGenerator,
) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
    warp::path("img")
        .and(warp::get())
        .and(warp::path::tail())
        .and(warp::query::<ImageQuery>())
        .and(with_config(config))
        .and(with_thumbnail_generator(thumbnail_generator))
        .and_then(redirect_to_thumbnail)
}
