use std::path::Path;

use warp::{reject, Filter, Rejection, Reply};

use crate::config::Config;
use crate::image_ref::validate_relative_path;
use crate::thumbnail_types::ImageCodec;
use crate::warp_helpers::{with_config, NotFoundError};

/// Serves originals and cached derivatives from the image root.
pub async fn serve_file(
    tail: warp::path::Tail,
    config: Config,
) -> Result<impl Reply, Rejection> {
    let relative_path = tail.as_str();

    if validate_relative_path(relative_path).is_err() {
        log::warn!("Rejected file path: {}", relative_path);
        return Err(reject::custom(NotFoundError));
    }

    let full_path = Path::new(&config.root_path).join(relative_path);
    match std::fs::read(&full_path) {
        Ok(file_data) => {
            let content_type = full_path
                .extension()
                .and_then(|ext| ext.to_str())
                .and_then(ImageCodec::from_extension)
                .map(ImageCodec::content_type)
                .unwrap_or("application/octet-stream");

            let reply = warp::reply::with_header(file_data, "content-type", content_type);
            let reply =
                warp::reply::with_header(reply, "cache-control", "public, max-age=31536000");
            Ok(reply)
        }
        Err(_) => Err(reject::custom(NotFoundError)),
    }
}

pub fn build_file_routes(
    config: Config,
) -> impl Filter<Extract = impl warp::Reply, Error = warp::Rejection> + Clone {
    warp::path("files")
        .and(warp::get())
        .and(warp::path::tail())
        .and(with_config(config))
        .and_then(serve_file)
}
