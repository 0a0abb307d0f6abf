use std::sync::Arc;

use axum::{Router, middleware};
use tower_http::set_header::SetResponseHeaderLayer;

use crate::middleware::connection_limit_middleware;
use crate::state::AppState;

pub mod api;
pub mod ws;

/// The full application: public HTTP routes plus the limited WebSocket route.
///
/// Serve with `into_make_service_with_connect_info::<SocketAddr>()`; the
/// connection limit middleware needs the peer address.
pub fn create_app(app_state: Arc<AppState>) -> Router {
    let ws_routes = ws::create_ws_router().layer(middleware::from_fn_with_state(
        app_state.clone(),
        connection_limit_middleware,
    ));

    let security_headers = tower::ServiceBuilder::new()
        .layer(SetResponseHeaderLayer::overriding(
            http::header::X_CONTENT_TYPE_OPTIONS,
            http::HeaderValue::from_static("nosniff"),
        ))
        .layer(SetResponseHeaderLayer::overriding(
            http::header::X_FRAME_OPTIONS,
            http::HeaderValue::from_static("DENY"),
        ));

    api::create_api_router()
        .merge(ws_routes)
        .with_state(app_state)
        .layer(security_headers)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use tower::util::ServiceExt;

    use crate::ServerConfig;
    use crate::backends::Registries;

    fn app() -> Router {
        let state = AppState::with_registries(ServerConfig::default(), Arc::new(Registries::new()));
        create_app(state)
    }

    #[tokio::test]
    async fn test_health_routes_with_security_headers() {
        for uri in ["/", "/health"] {
            let request = Request::builder().uri(uri).body(Body::empty()).unwrap();
            let response = app().oneshot(request).await.unwrap();

            assert_eq!(response.status(), StatusCode::OK);
            assert_eq!(response.headers()["x-content-type-options"], "nosniff");
            assert_eq!(response.headers()["x-frame-options"], "DENY");
        }
    }

    #[tokio::test]
    async fn test_unknown_route() {
        let request = Request::builder().uri("/v1/speak").body(Body::empty()).unwrap();
        let response = app().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
