use axum::http::StatusCode;

/// Handler for `GET /healthz`: liveness only.
pub async fn healthz() -> StatusCode {
    StatusCode::OK
}

/// Map a dependency probe result onto the readiness status code.
///
/// Services implement their own `GET /readyz` handler that probes their
/// backing stores and passes the outcome here.
pub fn readiness(ready: bool) -> StatusCode {
    if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}
