//! Defines routes for the bucket lifecycle API.
//!
//! ## Structure
//! - **Buckets**
//!   - `POST   /v1/buckets`       : provision a bucket for a claim
//!   - `POST   /v1/buckets/grant` : grant a claim access to an existing bucket
//!
//! - **Bindings**
//!   - `GET    /v1/bindings/{namespace}/{name}`        : read a stored binding
//!   - `PUT    /v1/bindings/{namespace}/{name}/config` : replace config, reconcile quota
//!   - `POST   /v1/bindings/{namespace}/{name}/revoke` : revoke access
//!   - `DELETE /v1/bindings/{namespace}/{name}`        : delete the binding's user

use crate::{
    handlers::{
        bucket_handlers::{
            delete_binding, get_binding, grant_bucket, provision_bucket, revoke_binding,
            update_binding_config,
        },
        health_handlers::{healthz, readyz},
    },
    services::{binding_store::BindingStore, provisioner::Provisioner},
};
use axum::{
    Router,
    routing::{get, post, put},
};

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    pub provisioner: Provisioner,
    pub store: BindingStore,
}

/// Build the router for the lifecycle API. State is attached by the caller.
pub fn routes() -> Router<AppState> {
    Router::new()
        // health endpoints (mounted at root)
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/v1/buckets", post(provision_bucket))
        .route("/v1/buckets/grant", post(grant_bucket))
        .route(
            "/v1/bindings/{namespace}/{name}",
            get(get_binding).delete(delete_binding),
        )
        .route(
            "/v1/bindings/{namespace}/{name}/config",
            put(update_binding_config),
        )
        .route(
            "/v1/bindings/{namespace}/{name}/revoke",
            post(revoke_binding),
        )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::{
        binding_store::tests::{memory_store, sample},
        provisioner::tests::{
            FakeAdmin, FakeConnector, default_cluster, fakes, provisioner, request,
            user_with_key,
        },
    };
    use axum::{
        body::Body,
        http::{Request, StatusCode},
    };
    use http_body_util::BodyExt;
    use serde_json::Value;
    use std::sync::Arc;
    use tower::ServiceExt;

    async fn app_with_store() -> (Router, Arc<FakeAdmin>, BindingStore) {
        let (admin, gateway) = fakes();
        let store = memory_store().await;
        let state = AppState {
            provisioner: provisioner(
                default_cluster(),
                admin.clone(),
                Arc::new(FakeConnector(gateway)),
            ),
            store: store.clone(),
        };
        (routes().with_state(state), admin, store)
    }

    async fn app() -> (Router, Arc<FakeAdmin>) {
        let (app, admin, _) = app_with_store().await;
        (app, admin)
    }

    async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let builder = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(json) => builder
                .header("content-type", "application/json")
                .body(Body::from(json.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let json = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, json)
    }

    #[tokio::test]
    async fn health_endpoints_report_ok() {
        let (app, _) = app().await;
        let (status, body) = send(&app, "GET", "/healthz", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");

        let (status, body) = send(&app, "GET", "/readyz", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["checks"]["sqlite"]["ok"], true);
    }

    #[tokio::test]
    async fn provision_stores_binding_until_deleted() {
        let (app, admin) = app().await;
        let payload = serde_json::to_value(request(&[])).unwrap();

        let (status, body) = send(&app, "POST", "/v1/buckets", Some(payload)).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(
            body["binding"]["connection"]["additionalState"]["cephUser"],
            "obc-apps-photos-uid-1"
        );

        let (status, body) = send(&app, "GET", "/v1/bindings/apps/photos", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["binding"]["connection"]["endpoint"]["bucketName"], "photos-1a2b");

        let (status, _) = send(&app, "DELETE", "/v1/bindings/apps/photos", None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        assert!(!admin.has_user("obc-apps-photos-uid-1"));

        let (status, body) = send(&app, "GET", "/v1/bindings/apps/photos", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["status"], 404);
    }

    #[tokio::test]
    async fn grant_of_missing_bucket_is_not_found() {
        let (app, admin) = app().await;
        let payload = serde_json::to_value(request(&[])).unwrap();

        let (status, body) = send(&app, "POST", "/v1/buckets/grant", Some(payload)).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["error"], "bucket `photos-1a2b` does not exist");
        assert!(admin.calls().is_empty());
    }

    #[tokio::test]
    async fn revoking_the_owner_keeps_its_user() {
        let (app, admin) = app().await;
        let payload = serde_json::to_value(request(&[])).unwrap();
        let (status, _) = send(&app, "POST", "/v1/buckets", Some(payload)).await;
        assert_eq!(status, StatusCode::CREATED);
        admin.add_bucket("photos-1a2b", "obc-apps-photos-uid-1");

        let (status, _) = send(&app, "POST", "/v1/bindings/apps/photos/revoke", None).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
        assert!(admin.has_user("obc-apps-photos-uid-1"));

        let (status, _) = send(&app, "GET", "/v1/bindings/apps/photos", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn config_update_reconciles_quota() {
        let (app, admin, store) = app_with_store().await;
        store.upsert(&sample("photos", "photos-1")).await.unwrap();
        admin.add_user(user_with_key("obc-apps-photos"));

        let (status, _) = send(
            &app,
            "PUT",
            "/v1/bindings/apps/photos/config",
            Some(serde_json::json!({ "maxSize": "lots" })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(admin.calls().is_empty());

        let (status, body) = send(
            &app,
            "PUT",
            "/v1/bindings/apps/photos/config",
            Some(serde_json::json!({ "maxObjects": "100" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            body["binding"]["connection"]["endpoint"]["additionalConfig"]["maxObjects"],
            "100"
        );
        assert_eq!(admin.calls(), vec!["set_quota obc-apps-photos".to_string()]);

        let stored = store.get("apps", "photos").await.unwrap();
        assert_eq!(stored.binding.additional_config()["maxObjects"], "100");
    }
}
