//! Route configuration for the alertmesh API.

use std::sync::Arc;

use alertmesh_cluster::GOSSIP_PATH;
use axum::Router;
use axum::routing::{get, post};
use tower_http::trace::TraceLayer;

use crate::handlers::{
    delete_silence, get_silence, get_status, gossip, health_check, list_alerts, list_groups,
    list_silences, post_alerts, post_silence, reload,
};
use crate::state::AppState;

/// Create the API router.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/status", get(get_status))
        // Alerts
        .route("/alerts", get(list_alerts).post(post_alerts))
        .route("/alerts/groups", get(list_groups))
        // Silences
        .route("/silences", get(list_silences).post(post_silence))
        .route("/silences/{id}", get(get_silence).delete(delete_silence))
        // Operations
        .route("/-/reload", post(reload))
        .route(GOSSIP_PATH, post(gossip))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

#[cfg(test)]
mod tests {
    use super::*;
    use alertmesh_cluster::{InMemoryTransport, MemberInfo};
    use alertmesh_core::{ReceiverConfig, RouteConfig, StateDigest};
    use axum::body::Body;
    use axum::http::{Request, StatusCode};
    use chrono::{Duration, Utc};
    use http_body_util::BodyExt;
    use serde_json::{Value, json};
    use tower::ServiceExt;

    use crate::config::ServerConfig;

    fn make_config() -> ServerConfig {
        ServerConfig::new(ReceiverConfig::log("ops"))
            .with_peer_id("am-1")
            .with_receiver(ReceiverConfig::log("pager"))
            .with_route(
                RouteConfig::new("ops")
                    .with_group_by(["alertname"])
                    .with_route(RouteConfig::new("pager").with_matcher("severity=critical")),
            )
    }

    fn make_test_state(config: ServerConfig) -> Arc<AppState> {
        Arc::new(AppState::build(config, None, Arc::new(InMemoryTransport::new())).unwrap())
    }

    async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let json = if body.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&body).unwrap()
        };
        (status, json)
    }

    fn get_req(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn json_req(method: &str, uri: &str, body: &Value) -> Request<Body> {
        Request::builder()
            .method(method)
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    mod health {
        use super::*;

        #[tokio::test]
        async fn health_endpoint() {
            let app = create_router(make_test_state(make_config()));
            let (status, json) = send(&app, get_req("/health")).await;
            assert_eq!(status, StatusCode::OK);
            assert_eq!(json["status"], "ok");
            assert!(json["uptime_secs"].is_u64());
        }

        #[tokio::test]
        async fn status_lists_receivers_and_self() {
            let app = create_router(make_test_state(make_config()));
            let (status, json) = send(&app, get_req("/status")).await;
            assert_eq!(status, StatusCode::OK);
            assert_eq!(json["cluster"]["peerId"], "am-1");
            assert_eq!(json["cluster"]["position"], 0);
            assert_eq!(json["receivers"]["ops"]["attempts"], 0);
            assert!(json["receivers"]["pager"].is_object());
        }
    }

    mod alerts {
        use super::*;

        #[tokio::test]
        async fn post_then_list() {
            let app = create_router(make_test_state(make_config()));
            let batch = json!([
                {"labels": {"alertname": "DiskFull", "severity": "critical"}},
                {"labels": {"alertname": "HighLatency", "severity": "warning"}},
            ]);
            let (status, json) = send(&app, json_req("POST", "/alerts", &batch)).await;
            assert_eq!(status, StatusCode::OK);
            assert_eq!(json["accepted"].as_array().unwrap().len(), 2);

            let (status, json) = send(&app, get_req("/alerts")).await;
            assert_eq!(status, StatusCode::OK);
            assert_eq!(json.as_array().unwrap().len(), 2);

            let (_, json) = send(&app, get_req("/alerts?receiver=pager")).await;
            let alerts = json.as_array().unwrap();
            assert_eq!(alerts.len(), 1);
            assert_eq!(alerts[0]["labels"]["alertname"], "DiskFull");
            assert_eq!(alerts[0]["receivers"], json!(["pager"]));
        }

        #[tokio::test]
        async fn filter_by_matchers() {
            let app = create_router(make_test_state(make_config()));
            let batch = json!([
                {"labels": {"alertname": "A", "service": "api"}},
                {"labels": {"alertname": "B", "service": "db"}},
            ]);
            send(&app, json_req("POST", "/alerts", &batch)).await;

            let (status, json) = send(&app, get_req("/alerts?filter=service%3Dapi")).await;
            assert_eq!(status, StatusCode::OK);
            let alerts = json.as_array().unwrap();
            assert_eq!(alerts.len(), 1);
            assert_eq!(alerts[0]["labels"]["alertname"], "A");
        }

        #[tokio::test]
        async fn bad_filter_is_rejected() {
            let app = create_router(make_test_state(make_config()));
            let (status, json) = send(&app, get_req("/alerts?filter=nooperator")).await;
            assert_eq!(status, StatusCode::BAD_REQUEST);
            assert_eq!(json["error"], "invalid_request");
        }

        #[tokio::test]
        async fn invalid_alert_in_batch() {
            let state = make_test_state(make_config());
            let app = create_router(Arc::clone(&state));
            let batch = json!([
                {"labels": {"alertname": "Good"}},
                {"labels": {}},
            ]);
            let (status, json) = send(&app, json_req("POST", "/alerts", &batch)).await;
            assert_eq!(status, StatusCode::BAD_REQUEST);
            assert!(json["message"].as_str().unwrap().contains("alert 1"));
            assert_eq!(state.shared().alerts().len(), 1);
        }

        #[tokio::test]
        async fn dotted_and_dashed_names_are_accepted() {
            let state = make_test_state(make_config());
            let app = create_router(Arc::clone(&state));
            let batch = json!([{
                "labels": {"alertname": "Down", "service.name": "api"},
                "annotations": {"runbook-url": "https://runbooks.example.com/down"},
            }]);
            let (status, _) = send(&app, json_req("POST", "/alerts", &batch)).await;
            assert_eq!(status, StatusCode::OK);

            let (_, json) = send(&app, get_req("/alerts")).await;
            assert_eq!(json[0]["labels"]["service.name"], "api");
            assert_eq!(json[0]["annotations"]["runbook-url"], "https://runbooks.example.com/down");
        }

        #[tokio::test]
        async fn malformed_json_has_error_body() {
            let app = create_router(make_test_state(make_config()));
            let request = Request::builder()
                .method("POST")
                .uri("/alerts")
                .header("content-type", "application/json")
                .body(Body::from("{not json"))
                .unwrap();
            let (status, json) = send(&app, request).await;
            assert!(status.is_client_error());
            assert_eq!(json["error"], "invalid_request");
        }

        #[tokio::test]
        async fn ingest_token_is_enforced() {
            let app = create_router(make_test_state(make_config().with_ingest_token("s3cret")));
            let batch = json!([{"labels": {"alertname": "A"}}]);

            let (status, json) = send(&app, json_req("POST", "/alerts", &batch)).await;
            assert_eq!(status, StatusCode::UNAUTHORIZED);
            assert_eq!(json["error"], "unauthorized");

            let mut request = json_req("POST", "/alerts", &batch);
            request
                .headers_mut()
                .insert("authorization", "Bearer s3cret".parse().unwrap());
            let (status, _) = send(&app, request).await;
            assert_eq!(status, StatusCode::OK);
        }

        #[tokio::test]
        async fn groups_appear_after_sync() {
            let state = make_test_state(make_config());
            let app = create_router(Arc::clone(&state));
            let batch = json!([{"labels": {"alertname": "A", "severity": "critical"}}]);
            send(&app, json_req("POST", "/alerts", &batch)).await;
            state.engine().sync(Utc::now());

            let (status, json) = send(&app, get_req("/alerts/groups")).await;
            assert_eq!(status, StatusCode::OK);
            let groups = json.as_array().unwrap();
            assert_eq!(groups.len(), 1);
            assert_eq!(groups[0]["receiver"], "pager");
            assert_eq!(groups[0]["labels"]["alertname"], "A");
        }
    }

    mod silences {
        use super::*;

        fn silence_body() -> Value {
            let now = Utc::now();
            json!({
                "matchers": [{"name": "service", "value": "api"}],
                "startsAt": now - Duration::minutes(1),
                "endsAt": now + Duration::hours(1),
                "createdBy": "ops",
                "comment": "maintenance",
            })
        }

        #[tokio::test]
        async fn create_get_list_delete() {
            let app = create_router(make_test_state(make_config()));

            let (status, json) = send(&app, json_req("POST", "/silences", &silence_body())).await;
            assert_eq!(status, StatusCode::OK);
            let id = json["silenceID"].as_str().unwrap().to_string();

            let (status, json) = send(&app, get_req(&format!("/silences/{id}"))).await;
            assert_eq!(status, StatusCode::OK);
            assert_eq!(json["status"]["state"], "active");
            assert_eq!(json["createdBy"], "ops");

            let (_, json) = send(&app, get_req("/silences")).await;
            assert_eq!(json.as_array().unwrap().len(), 1);

            let request = Request::builder()
                .method("DELETE")
                .uri(format!("/silences/{id}"))
                .body(Body::empty())
                .unwrap();
            let (status, json) = send(&app, request).await;
            assert_eq!(status, StatusCode::OK);
            assert_eq!(json["status"]["state"], "expired");
        }

        #[tokio::test]
        async fn silenced_alerts_are_flagged() {
            let app = create_router(make_test_state(make_config()));
            send(&app, json_req("POST", "/silences", &silence_body())).await;
            let batch = json!([{"labels": {"alertname": "A", "service": "api"}}]);
            send(&app, json_req("POST", "/alerts", &batch)).await;

            let (_, json) = send(&app, get_req("/alerts?silenced=false")).await;
            assert!(json.as_array().unwrap().is_empty());

            let (_, json) = send(&app, get_req("/alerts")).await;
            assert_eq!(json[0]["status"]["silencedBy"].as_array().unwrap().len(), 1);
        }

        #[tokio::test]
        async fn unknown_silence_is_not_found() {
            let app = create_router(make_test_state(make_config()));
            let (status, json) = send(&app, get_req("/silences/nope")).await;
            assert_eq!(status, StatusCode::NOT_FOUND);
            assert_eq!(json["error"], "not_found");
        }

        #[tokio::test]
        async fn silence_without_matchers_is_rejected() {
            let app = create_router(make_test_state(make_config()));
            let mut body = silence_body();
            body["matchers"] = json!([]);
            let (status, _) = send(&app, json_req("POST", "/silences", &body)).await;
            assert_eq!(status, StatusCode::BAD_REQUEST);
        }

        #[tokio::test]
        async fn expiring_twice_conflicts() {
            let app = create_router(make_test_state(make_config()));
            let (_, json) = send(&app, json_req("POST", "/silences", &silence_body())).await;
            let uri = format!("/silences/{}", json["silenceID"].as_str().unwrap());
            let delete = || {
                Request::builder()
                    .method("DELETE")
                    .uri(&uri)
                    .body(Body::empty())
                    .unwrap()
            };
            send(&app, delete()).await;
            let (status, _) = send(&app, delete()).await;
            assert_eq!(status, StatusCode::CONFLICT);
        }
    }

    mod operations {
        use super::*;

        #[tokio::test]
        async fn reload_reapplies_config() {
            let app = create_router(make_test_state(make_config()));
            let request = Request::builder()
                .method("POST")
                .uri("/-/reload")
                .body(Body::empty())
                .unwrap();
            let (status, json) = send(&app, request).await;
            assert_eq!(status, StatusCode::OK);
            assert_eq!(json["receivers"], 2);
        }

        #[tokio::test]
        async fn gossip_sync_is_answered() {
            let state = make_test_state(make_config());
            let app = create_router(Arc::clone(&state));
            let message = alertmesh_cluster::GossipMessage::Sync {
                from: MemberInfo::new("am-2", "10.0.0.2:9093"),
                clock: 4,
                digest: StateDigest::default(),
                members: vec![],
            };
            let body = serde_json::to_value(&message).unwrap();
            let (status, json) = send(&app, json_req("POST", GOSSIP_PATH, &body)).await;
            assert_eq!(status, StatusCode::OK);
            assert_eq!(json["type"], "sync_reply");
            assert_eq!(json["from"]["id"], "am-1");
            assert_eq!(state.replicator().members().len(), 1);
        }

        #[tokio::test]
        async fn gossip_ack_is_rejected() {
            let app = create_router(make_test_state(make_config()));
            let body = json!({"type": "ack", "from": {"id": "am-2", "address": "x"}});
            let (status, json) = send(&app, json_req("POST", GOSSIP_PATH, &body)).await;
            assert_eq!(status, StatusCode::BAD_REQUEST);
            assert_eq!(json["error"], "invalid_request");
        }
    }
}
