mod docs;
mod health;
pub mod images;

use aide::axum::{
    routing::{get, post},
    ApiRouter,
};

use crate::types::Environment;

/// Creates the router with all handler routes
pub fn handler(environment: &Environment) -> ApiRouter {
    ApiRouter::new()
        .merge(docs::handler(environment))
        .api_route("/health", get(health::handler))
        .api_route("/v1/images", post(images::upload_images))
        .api_route("/v1/images/list", post(images::list_images))
        .api_route("/v1/images/like", post(images::like_image))
}
