use axum::{
    Router,
    body::Body,
    http::{HeaderValue, Method, Request, header},
    middleware,
    middleware::Next,
    routing::{get, post},
};
use tower_http::cors::CorsLayer;

use super::AppState;
use super::handlers::{agents, events};

fn build_localhost_cors(api_port: u16) -> CorsLayer {
    let origins: Vec<HeaderValue> = [
        format!("http://127.0.0.1:{}", api_port),
        format!("http://localhost:{}", api_port),
    ]
    .iter()
    .filter_map(|o| o.parse().ok())
    .collect();

    CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(tower_http::cors::Any)
}

pub fn build_api_router(state: AppState) -> Router {
    // Public route: external services authenticate via HMAC signatures.
    let public_routes = Router::new()
        .route("/api/events/{agent}/{source}", post(events::inbound_event))
        .layer(middleware::from_fn(security_headers))
        .with_state(state.clone());

    let agent_routes = Router::new()
        .route("/api/agents", get(agents::list_agents))
        .route("/api/agents/{agent}/status", get(agents::get_status))
        .route("/api/agents/{agent}/health", get(agents::get_health))
        .route("/api/agents/{agent}/task", post(agents::submit_task))
        .route("/api/agents/{agent}/message", post(agents::submit_message))
        .route("/api/agents/{agent}/pause", post(agents::pause_agent))
        .route("/api/agents/{agent}/resume", post(agents::resume_agent))
        .route("/api/agents/{agent}/terminate", post(agents::terminate_agent))
        .layer(middleware::from_fn(security_headers))
        .layer(build_localhost_cors(state.api_port))
        .with_state(state.clone());

    public_routes.merge(agent_routes)
}

async fn security_headers(req: Request<Body>, next: Next) -> axum::response::Response {
    let mut response = next.run(req).await;
    let headers = response.headers_mut();
    headers.insert(
        header::X_CONTENT_TYPE_OPTIONS,
        HeaderValue::from_static("nosniff"),
    );
    headers.insert(header::X_FRAME_OPTIONS, HeaderValue::from_static("DENY"));
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;
    use std::collections::HashSet;
    use tower::util::ServiceExt;

    use crate::interfaces::web::test_state;

    #[tokio::test]
    async fn security_headers_present_on_responses() {
        let app = build_api_router(test_state());
        let req = Request::builder()
            .method(Method::GET)
            .uri("/api/agents")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(
            resp.headers().get("x-content-type-options").unwrap(),
            "nosniff"
        );
        assert_eq!(resp.headers().get("x-frame-options").unwrap(), "DENY");
    }

    #[tokio::test]
    async fn method_not_allowed_returns_405() {
        let app = build_api_router(test_state());
        let req = Request::builder()
            .method(Method::PATCH)
            .uri("/api/agents")
            .body(Body::empty())
            .unwrap();
        let resp = app.oneshot(req).await.unwrap();
        assert_eq!(resp.status(), StatusCode::METHOD_NOT_ALLOWED);
    }

    #[tokio::test]
    async fn api_route_contract_has_all_expected_paths() {
        let paths = [
            "/api/events/default/github",
            "/api/agents",
            "/api/agents/default/status",
            "/api/agents/default/health",
            "/api/agents/default/task",
            "/api/agents/default/message",
            "/api/agents/default/pause",
            "/api/agents/default/resume",
            "/api/agents/default/terminate",
        ];

        let unique: HashSet<&str> = paths.iter().copied().collect();
        assert_eq!(unique.len(), paths.len(), "Duplicate routes in contract");

        let app = build_api_router(test_state());
        for path in paths {
            let req = Request::builder()
                .method(Method::PUT)
                .uri(path)
                .body(Body::empty())
                .expect("request should build");
            let resp = app
                .clone()
                .oneshot(req)
                .await
                .expect("router oneshot should succeed");
            assert_ne!(
                resp.status(),
                StatusCode::NOT_FOUND,
                "Route missing from router: {}",
                path
            );
        }
    }
}
