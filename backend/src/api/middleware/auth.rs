//! Authentication middleware.
//!
//! Runs the resolver chain for every request and stores the resulting
//! `AuthContext` and a request-scoped `TxContext` as extensions.
//! Mutating requests from contexts that require it must carry the session's
//! CSRF token in `X-CSRF-Token`.

use axum::{
    extract::{Request, State},
    http::{HeaderName, Method},
    middleware::Next,
    response::{IntoResponse, Response},
};

use crate::api::SharedState;
use crate::db::TxContext;
use crate::services::auth_service::RequestCredentials;

static CSRF_HEADER: HeaderName = HeaderName::from_static("x-csrf-token");

fn is_mutating(method: &Method) -> bool {
    !matches!(*method, Method::GET | Method::HEAD | Method::OPTIONS)
}

/// Resolve the caller and enforce CSRF on mutating requests.
pub async fn auth_middleware(
    State(state): State<SharedState>,
    mut request: Request,
    next: Next,
) -> Response {
    let ctx = TxContext::new(state.shutdown.child_token());
    let creds = RequestCredentials::from_headers(request.headers());
    let auth = state.auth.resolve(&ctx, &creds).await;

    if is_mutating(request.method()) {
        let provided = request
            .headers()
            .get(&CSRF_HEADER)
            .and_then(|h| h.to_str().ok());
        if let Err(e) = auth.check_csrf(provided) {
            tracing::debug!(
                auth_method = auth.auth_method(),
                method = %request.method(),
                "Rejected request without valid CSRF token"
            );
            return e.into_response();
        }
    }

    request.extensions_mut().insert(auth);
    request.extensions_mut().insert(ctx);
    next.run(request).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_mutating_methods() {
        assert!(!is_mutating(&Method::GET));
        assert!(!is_mutating(&Method::HEAD));
        assert!(!is_mutating(&Method::OPTIONS));
        assert!(is_mutating(&Method::POST));
        assert!(is_mutating(&Method::PUT));
        assert!(is_mutating(&Method::DELETE));
        assert!(is_mutating(&Method::PATCH));
    }
}
