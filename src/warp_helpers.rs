use std::convert::Infallible;

use serde::Serialize;
use warp::{reject, Filter, Rejection, Reply};

use crate::config::Config;
use crate::thumbnail_generator::ThumbnailGenerator;
use crate::thumbnail_types::ThumbError;

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: u16,
    pub timestamp: String,
}

#[derive(Debug)]
pub struct NotFoundError;
impl reject::Reject for NotFoundError {}

#[derive(Debug)]
pub struct InternalError {
    pub message: String,
}

impl reject::Reject for InternalError {}

pub fn with_config(config: Config) -> impl Filter<Extract = (Config,), Error = Infallible> + Clone {
    warp::any().map(move || config.clone())
}

pub fn with_thumbnail_generator(
    thumbnail_generator: ThumbnailGenerator,
) -> impl Filter<Extract = (ThumbnailGenerator,), Error = Infallible> + Clone {
    warp::any().map(move || thumbnail_generator.clone())
}

/// Maps a core error onto the HTTP boundary: missing or invalid paths
/// become 404, everything else an internal error.
pub fn thumb_rejection(err: ThumbError) -> Rejection {
    match err {
        ThumbError::NotFound(path) => {
            log::debug!("Image not found: {}", path);
            reject::custom(NotFoundError)
        }
        ThumbError::InvalidPath(path) => {
            log::warn!("Rejected image path: {}", path);
            reject::custom(NotFoundError)
        }
        err => {
            log::error!("Thumbnail operation failed: {}", err);
            reject::custom(InternalError {
                message: err.to_string(),
            })
        }
    }
}

pub async fn handle_rejection(err: Rejection) -> Result<impl Reply, Infallible> {
    let code;
    let message;
    let timestamp = chrono::Utc::now().to_rfc3339();

    if err.is_not_found() {
        code = warp::http::StatusCode::NOT_FOUND;
        message = "Not Found".to_string();
    } else if err.find::<NotFoundError>().is_some() {
        code = warp::http::StatusCode::NOT_FOUND;
        message = "Image not found".to_string();
    } else if let Some(internal_error) = err.find::<InternalError>() {
        code = warp::http::StatusCode::INTERNAL_SERVER_ERROR;
        message = internal_error.message.clone();
    } else if err.find::<warp::reject::InvalidQuery>().is_some() {
        code = warp::http::StatusCode::BAD_REQUEST;
        message = "Invalid query string".to_string();
    } else if err.find::<warp::reject::MethodNotAllowed>().is_some() {
        code = warp::http::StatusCode::METHOD_NOT_ALLOWED;
        message = "Method not allowed".to_string();
    } else {
        log::error!("Unhandled rejection: {:?}", err);
        code = warp::http::StatusCode::INTERNAL_SERVER_ERROR;
        message = "Internal server error".to_string();
    }

    let error_response = ErrorResponse {
        error: message,
        code: code.as_u16(),
        timestamp,
    };

    Ok(warp::reply::with_status(
        warp::reply::json(&error_response),
        code,
    ))
}

pub fn cors() -> warp::cors::Builder {
    warp::cors()
        .allow_any_origin()
        .allow_headers(vec!["content-type"])
        .allow_methods(vec!["GET", "OPTIONS"])
}
