use axum::{
    Router,
    routing::{get, post},
};

use courier_core::health::healthz;
use courier_core::middleware::{propagate_request_id_layer, request_id_layer, trace_layer};

use crate::handlers::{
    health::readyz,
    messages::{create_message, delete_message, get_message, list_messages, stats},
};
use crate::state::AppState;

pub fn build_router(state: AppState) -> Router {
    Router::new()
        // Health
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        // Outbox
        .route("/outbox/messages", post(create_message).get(list_messages))
        .route(
            "/outbox/messages/{id}",
            get(get_message).delete(delete_message),
        )
        .route("/outbox/stats", get(stats))
        .with_state(state)
        // Last layer added runs first: the id is set before the trace span opens.
        .layer(propagate_request_id_layer())
        .layer(trace_layer())
        .layer(request_id_layer())
}
