use axum::Router;
use std::sync::Arc;
use crate::AppContext;

pub mod batch;
pub mod events;

pub fn router(ctx: Arc<AppContext>) -> Router {
    Router::new()
        .nest("/batches", batch::batch_router(ctx.scheduler.clone()))
}
