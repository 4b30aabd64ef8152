//! HTTP handlers for the bucket lifecycle.
//! Each handler runs one lifecycle call on the provisioner and keeps the
//! binding store in step with its outcome.

use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use std::collections::BTreeMap;
use tracing::{error, info};

use crate::{
    errors::AppError,
    models::{binding::ObjectBucket, bucket::BucketRequest},
    routes::routes::AppState,
    services::binding_store::BindingRecord,
};

async fn store_binding(
    state: &AppState,
    binding: &ObjectBucket,
) -> Result<BindingRecord, AppError> {
    state.store.upsert(binding).await.map_err(|err| {
        error!(
            namespace = %binding.namespace,
            name = %binding.name,
            error = %err,
            "lifecycle call succeeded but the binding could not be stored"
        );
        AppError::from(err)
    })
}

/// `POST /v1/buckets`: provision a new bucket for a claim.
pub async fn provision_bucket(
    State(state): State<AppState>,
    Json(request): Json<BucketRequest>,
) -> Result<impl IntoResponse, AppError> {
    let binding = state.provisioner.provision(&request).await?;
    let record = store_binding(&state, &binding).await?;
    info!(bucket = %binding.bucket_name(), "bucket provisioned");
    Ok((StatusCode::CREATED, Json(record)))
}

/// `POST /v1/buckets/grant`: give a claim access to an existing bucket.
pub async fn grant_bucket(
    State(state): State<AppState>,
    Json(request): Json<BucketRequest>,
) -> Result<impl IntoResponse, AppError> {
    let binding = state.provisioner.grant(&request).await?;
    let record = store_binding(&state, &binding).await?;
    info!(bucket = %binding.bucket_name(), "bucket access granted");
    Ok((StatusCode::CREATED, Json(record)))
}

/// `GET /v1/bindings/{namespace}/{name}`
pub async fn get_binding(
    State(state): State<AppState>,
    Path((namespace, name)): Path<(String, String)>,
) -> Result<impl IntoResponse, AppError> {
    let record = state.store.get(&namespace, &name).await?;
    Ok(Json(record))
}

/// `PUT /v1/bindings/{namespace}/{name}/config`: replace the additional
/// config and reconcile the user quota against it.
pub async fn update_binding_config(
    State(state): State<AppState>,
    Path((namespace, name)): Path<(String, String)>,
    Json(config): Json<BTreeMap<String, String>>,
) -> Result<impl IntoResponse, AppError> {
    let mut binding = state.store.get(&namespace, &name).await?.binding;
    binding.connection.endpoint.additional_config = config;

    state.provisioner.update(&binding).await?;
    let record = store_binding(&state, &binding).await?;
    Ok(Json(record))
}

/// `POST /v1/bindings/{namespace}/{name}/revoke`
pub async fn revoke_binding(
    State(state): State<AppState>,
    Path((namespace, name)): Path<(String, String)>,
) -> Result<impl IntoResponse, AppError> {
    let record = state.store.get(&namespace, &name).await?;
    state.provisioner.revoke(&record.binding).await?;
    state.store.remove(&namespace, &name).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// `DELETE /v1/bindings/{namespace}/{name}`
pub async fn delete_binding(
    State(state): State<AppState>,
    Path((namespace, name)): Path<(String, String)>,
) -> Result<impl IntoResponse, AppError> {
    let record = state.store.get(&namespace, &name).await?;
    state.provisioner.delete(&record.binding).await?;
    state.store.remove(&namespace, &name).await?;
    Ok(StatusCode::NO_CONTENT)
}
