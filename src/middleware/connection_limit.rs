//! Connection limit middleware for WebSocket connections
//!
//! Enforces the global WebSocket connection cap and the per-IP cap on upgrade
//! requests. An accepted request carries a [`ConnectionSlot`] extension; the
//! slot is released when the last clone of it is dropped, which happens when
//! the socket task ends or when the upgrade never completes.
//!
//! # Example
//!
//! ```ignore
//! use axum::Router;
//! use voxhost::middleware::connection_limit_middleware;
//!
//! let app = Router::new()
//!     .route("/ws", get(ws_handler))
//!     .layer(axum::middleware::from_fn_with_state(
//!         state.clone(),
//!         connection_limit_middleware,
//!     ));
//! ```

use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::{Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;

use crate::state::{AppState, ConnectionLimitError};

/// Releases the reserved slot on drop
struct ConnectionGuard {
    state: Arc<AppState>,
    ip: IpAddr,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.state.release_connection(self.ip);
        tracing::debug!(ip = %self.ip, "Released connection slot");
    }
}

/// Reserved connection slot carried from the middleware into the socket task
#[derive(Clone)]
pub struct ConnectionSlot(Arc<ConnectionGuard>);

impl ConnectionSlot {
    /// Reserve a slot for `ip`.
    pub fn acquire(state: &Arc<AppState>, ip: IpAddr) -> Result<Self, ConnectionLimitError> {
        state.try_acquire_connection(ip)?;
        Ok(Self(Arc::new(ConnectionGuard {
            state: Arc::clone(state),
            ip,
        })))
    }

    pub fn ip(&self) -> IpAddr {
        self.0.ip
    }
}

/// Rejects upgrades over capacity: 503 for the global cap, 429 per IP.
///
/// Requests without a WebSocket `Upgrade` header pass through unchecked.
pub async fn connection_limit_middleware(
    State(state): State<Arc<AppState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    mut request: Request<Body>,
    next: Next,
) -> Response {
    let is_ws_upgrade = request
        .headers()
        .get("upgrade")
        .and_then(|v| v.to_str().ok())
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false);

    if !is_ws_upgrade {
        return next.run(request).await;
    }

    let client_ip = addr.ip();

    match ConnectionSlot::acquire(&state, client_ip) {
        Ok(slot) => {
            request.extensions_mut().insert(slot);
            next.run(request).await
        }
        Err(ConnectionLimitError::GlobalLimitReached) => {
            tracing::warn!(ip = %client_ip, "Rejecting connection: global limit reached");
            (
                StatusCode::SERVICE_UNAVAILABLE,
                "Server at capacity. Please try again later.",
            )
                .into_response()
        }
        Err(ConnectionLimitError::PerIpLimitReached) => {
            tracing::warn!(ip = %client_ip, "Rejecting connection: per-IP limit reached");
            (
                StatusCode::TOO_MANY_REQUESTS,
                "Too many connections from your IP address.",
            )
                .into_response()
        }
    }
}
