//! src/services/provisioner.rs
//!
//! Bucket lifecycle coordinator. Drives Provision, Grant, Revoke, Delete and
//! Update against the object store's admin API and its S3 data plane, and
//! composes the resulting [`ObjectBucket`] binding.
//!
//! Every call resolves its own [`ProvisionerState`] (gateway location, TLS
//! trust material, admin client) and drops it when the call returns; nothing
//! is cached between calls. Calls are not idempotent on Provision: a failed
//! Provision cleans up after itself and callers retry from scratch.

use std::{collections::BTreeMap, sync::Arc};
use thiserror::Error;
use tracing::{Instrument, Span, debug, error, info, info_span, warn};
use uuid::Uuid;

use super::{
    admin_ops::{AdminOps, AdminOpsConnector, AdminOpsError},
    cluster::{ClusterError, ClusterLookup},
    reconciler,
    s3_agent::{S3Agent, S3Connector, S3Error},
    transport::GatewayEndpoint,
};
use crate::models::{
    binding::{Authentication, CEPH_USER_KEY, Connection, Endpoint, ObjectBucket},
    bucket::{BucketRequest, ClaimRef, StorageClassParams, split_endpoint},
    policy::Effect,
    quota::{QuantityError, QuotaLimits},
    user::{Credentials, ObjectUser},
};

/// Max-buckets value that forbids a user from creating any bucket.
const FORBID_BUCKET_CREATION: i32 = -1;
/// Max-buckets value for a user that owns exactly its provisioned bucket.
const SINGLE_BUCKET: i32 = 1;

#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("configuration error: {0}")]
    Configuration(String),
    #[error("object store is not initialized yet: {0}")]
    NotInitialized(String),
    #[error("failed to create user `{user}`: {source}")]
    UserCreation { user: String, source: AdminOpsError },
    #[error("failed to create bucket `{bucket}`: {source}")]
    BucketCreation { bucket: String, source: S3Error },
    #[error("bucket `{0}` does not exist")]
    BucketNotFound(String),
    #[error("failed to update policy of bucket `{bucket}`: {source}")]
    Policy { bucket: String, source: S3Error },
    #[error("failed to set quota of user `{user}`: {source}")]
    Quota { user: String, source: AdminOpsError },
    #[error(transparent)]
    QuotaParse(#[from] QuantityError),
    #[error("failed to {operation} `{resource}`: {source}")]
    AdminOps {
        operation: &'static str,
        resource: String,
        source: AdminOpsError,
    },
    #[error("failed to {operation} `{resource}`: {source}")]
    DataPlane {
        operation: &'static str,
        resource: String,
        source: S3Error,
    },
    #[error("failed to delete user `{user}`: {source}")]
    UserDeletion { user: String, source: AdminOpsError },
    #[error("user `{0}` has no S3 keys")]
    MissingKeys(String),
    #[error("failed to find owner of bucket `{0}`")]
    BucketOwnerUnknown(String),
}

impl ProvisionError {
    /// Only a not-yet-initialized backing cluster is worth retrying unchanged.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ProvisionError::NotInitialized(_))
    }
}

impl From<ClusterError> for ProvisionError {
    fn from(err: ClusterError) -> Self {
        match err {
            ClusterError::NotInitialized(msg) => ProvisionError::NotInitialized(msg),
            other => ProvisionError::Configuration(other.to_string()),
        }
    }
}

pub type ProvisionResult<T> = Result<T, ProvisionError>;

/// Everything one lifecycle call needs, resolved up front.
struct ProvisionerState {
    bucket_name: String,
    /// Gateway location handed out in bindings and used for data-plane sessions.
    endpoint: GatewayEndpoint,
    region: Option<String>,
    additional_config: BTreeMap<String, String>,
    ceph_user: String,
    /// Keys of `ceph_user`; empty until the user is created.
    credentials: Credentials,
    admin: Arc<dyn AdminOps>,
}

impl ProvisionerState {
    fn signing_region(&self) -> &str {
        self.region.as_deref().unwrap_or_default()
    }

    fn compose_object_bucket(&self, claim: &ClaimRef) -> ObjectBucket {
        ObjectBucket {
            name: claim.name.clone(),
            namespace: claim.namespace.clone(),
            storage_class_name: claim.storage_class_name.clone(),
            connection: Connection {
                endpoint: Endpoint {
                    bucket_host: self.endpoint.host.clone(),
                    bucket_port: self.endpoint.port,
                    bucket_name: self.bucket_name.clone(),
                    region: self.region.clone().unwrap_or_default(),
                    additional_config: self.additional_config.clone(),
                },
                authentication: Authentication {
                    access_key_id: self.credentials.access_key.clone(),
                    secret_access_key: self.credentials.secret_key.clone(),
                },
                additional_state: BTreeMap::from([(
                    CEPH_USER_KEY.to_string(),
                    self.ceph_user.clone(),
                )]),
            },
        }
    }
}

/// Object-store user dedicated to a claim: `obc-<namespace>-<claim>-<uid>`.
pub fn user_name_for(claim: &ClaimRef) -> String {
    let suffix = claim
        .uid
        .clone()
        .filter(|uid| !uid.is_empty())
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    format!("obc-{}-{}-{}", claim.namespace, claim.name, suffix)
}

fn primary_credentials(user: &ObjectUser) -> ProvisionResult<Credentials> {
    user.primary_key()
        .map(Credentials::from)
        .ok_or_else(|| ProvisionError::MissingKeys(user.id.clone()))
}

/// The bucket lifecycle coordinator.
///
/// Holds only its collaborators and the span every call is logged under.
#[derive(Clone)]
pub struct Provisioner {
    cluster: Arc<dyn ClusterLookup>,
    admin_connector: Arc<dyn AdminOpsConnector>,
    s3_connector: Arc<dyn S3Connector>,
    span: Span,
}

impl Provisioner {
    pub fn new(
        cluster: Arc<dyn ClusterLookup>,
        admin_connector: Arc<dyn AdminOpsConnector>,
        s3_connector: Arc<dyn S3Connector>,
        span: Span,
    ) -> Self {
        Self {
            cluster,
            admin_connector,
            s3_connector,
            span,
        }
    }

    /// Create a bucket owned by a new dedicated user and return its binding.
    pub async fn provision(&self, request: &BucketRequest) -> ProvisionResult<ObjectBucket> {
        let span = info_span!(parent: &self.span, "provision", claim = %request.claim.name, namespace = %request.claim.namespace);
        self.provision_inner(request).instrument(span).await
    }

    /// Attach a new dedicated user to an existing bucket through its policy.
    pub async fn grant(&self, request: &BucketRequest) -> ProvisionResult<ObjectBucket> {
        let span = info_span!(parent: &self.span, "grant", claim = %request.claim.name, namespace = %request.claim.namespace);
        self.grant_inner(request).instrument(span).await
    }

    /// Delete the user behind a binding. Bucket contents are left alone.
    pub async fn delete(&self, binding: &ObjectBucket) -> ProvisionResult<()> {
        let span = info_span!(parent: &self.span, "delete", claim = %binding.name, namespace = %binding.namespace);
        self.delete_inner(binding).instrument(span).await
    }

    /// Withdraw a binding's access to its bucket and delete its user.
    ///
    /// When the revoked user owns the bucket, access is denied through the
    /// policy instead and the user is kept so the bucket is not orphaned.
    pub async fn revoke(&self, binding: &ObjectBucket) -> ProvisionResult<()> {
        let span = info_span!(parent: &self.span, "revoke", claim = %binding.name, namespace = %binding.namespace);
        self.revoke_inner(binding).instrument(span).await
    }

    /// Bring the user's quota in line with the binding's additional config.
    pub async fn update(&self, binding: &ObjectBucket) -> ProvisionResult<()> {
        let span = info_span!(parent: &self.span, "update", claim = %binding.name, namespace = %binding.namespace);
        self.update_inner(binding).instrument(span).await
    }

    async fn provision_inner(&self, request: &BucketRequest) -> ProvisionResult<ObjectBucket> {
        debug!(?request, "provision requested");
        let mut state = self.initialize_for_request(request).await?;
        info!(bucket = %state.bucket_name, user = %state.ceph_user, "creating bucket");

        let user = self.create_user(&state).await?;
        state.credentials = match primary_credentials(&user) {
            Ok(credentials) => credentials,
            Err(err) => {
                self.cleanup(&state, None).await;
                return Err(err);
            }
        };

        let mut bucket_created = false;
        let outcome: ProvisionResult<()> = async {
            let s3 = self.open_session(&state, &state.credentials, &state.ceph_user)?;
            s3.create_bucket(&state.bucket_name).await.map_err(|source| {
                ProvisionError::BucketCreation {
                    bucket: state.bucket_name.clone(),
                    source,
                }
            })?;
            bucket_created = true;

            state
                .admin
                .modify_user_max_buckets(&state.ceph_user, SINGLE_BUCKET)
                .await
                .map_err(|source| ProvisionError::Quota {
                    user: state.ceph_user.clone(),
                    source,
                })?;
            info!(user = %state.ceph_user, max_buckets = SINGLE_BUCKET, "set user bucket max");

            self.apply_initial_quota(&state).await
        }
        .await;

        if let Err(err) = outcome {
            error!(bucket = %state.bucket_name, error = %err, "provision failed");
            let created = bucket_created.then_some(state.bucket_name.as_str());
            self.cleanup(&state, created).await;
            return Err(err);
        }
        Ok(state.compose_object_bucket(&request.claim))
    }

    async fn grant_inner(&self, request: &BucketRequest) -> ProvisionResult<ObjectBucket> {
        debug!(?request, "grant requested");
        let mut state = self.initialize_for_request(request).await?;
        info!(bucket = %state.bucket_name, user = %state.ceph_user, "granting bucket access");

        if !self.bucket_exists(&state).await? {
            return Err(ProvisionError::BucketNotFound(state.bucket_name.clone()));
        }

        let user = self.create_user(&state).await?;
        let outcome: ProvisionResult<Credentials> = async {
            let credentials = primary_credentials(&user)?;
            state
                .admin
                .modify_user_max_buckets(&state.ceph_user, FORBID_BUCKET_CREATION)
                .await
                .map_err(|source| ProvisionError::Quota {
                    user: state.ceph_user.clone(),
                    source,
                })?;

            let owner = self.bucket_owner(&state).await?;
            let s3 = self.open_session(&state, &primary_credentials(&owner)?, &owner.id)?;
            let current = s3
                .get_bucket_policy(&state.bucket_name)
                .await
                .map_err(|source| ProvisionError::Policy {
                    bucket: state.bucket_name.clone(),
                    source,
                })?;
            let policy = reconciler::add_statement(
                current,
                &state.ceph_user,
                &state.bucket_name,
                Effect::Allow,
            );
            s3.put_bucket_policy(&state.bucket_name, &policy)
                .await
                .map_err(|source| ProvisionError::Policy {
                    bucket: state.bucket_name.clone(),
                    source,
                })?;
            info!(user = %state.ceph_user, statements = policy.statement.len(), "bucket policy updated");

            self.apply_initial_quota(&state).await?;
            Ok(credentials)
        }
        .await;

        match outcome {
            Ok(credentials) => {
                state.credentials = credentials;
                Ok(state.compose_object_bucket(&request.claim))
            }
            Err(err) => {
                error!(bucket = %state.bucket_name, error = %err, "grant failed");
                self.cleanup(&state, None).await;
                Err(err)
            }
        }
    }

    async fn delete_inner(&self, binding: &ObjectBucket) -> ProvisionResult<()> {
        debug!(?binding, "delete requested");
        let state = self.initialize_for_binding(binding).await?;
        info!(bucket = %state.bucket_name, user = %state.ceph_user, "deleting bucket user");

        match state.admin.delete_user(&state.ceph_user).await {
            Ok(()) => {
                info!(user = %state.ceph_user, "user deleted");
                Ok(())
            }
            Err(AdminOpsError::NoSuchUser(_)) => {
                info!(user = %state.ceph_user, "user already absent");
                Ok(())
            }
            Err(source) => Err(ProvisionError::UserDeletion {
                user: state.ceph_user.clone(),
                source,
            }),
        }
    }

    async fn revoke_inner(&self, binding: &ObjectBucket) -> ProvisionResult<()> {
        debug!(?binding, "revoke requested");
        let state = self.initialize_for_binding(binding).await?;
        let bucket = state.bucket_name.as_str();
        let user = state.ceph_user.as_str();
        info!(bucket, user, "revoking bucket access");

        match state.admin.get_bucket_info(bucket).await {
            Err(AdminOpsError::NoSuchBucket(_)) => {
                warn!(bucket, "bucket not found, continuing with user deletion");
            }
            Err(source) => {
                return Err(ProvisionError::AdminOps {
                    operation: "get info of bucket",
                    resource: bucket.to_string(),
                    source,
                });
            }
            Ok(info) => {
                if info.owner.is_empty() {
                    return Err(ProvisionError::BucketOwnerUnknown(bucket.to_string()));
                }
                let owner = match state.admin.get_user(&info.owner).await {
                    Ok(owner) => owner,
                    Err(AdminOpsError::NoSuchUser(_)) => {
                        info!(bucket, owner = %info.owner, "bucket owner no longer exists, nothing to revoke");
                        return Ok(());
                    }
                    Err(source) => {
                        return Err(ProvisionError::AdminOps {
                            operation: "get user",
                            resource: info.owner.clone(),
                            source,
                        });
                    }
                };

                let s3 = self.open_session(&state, &primary_credentials(&owner)?, &owner.id)?;
                let policy_error = |source| ProvisionError::Policy {
                    bucket: bucket.to_string(),
                    source,
                };
                let current = s3.get_bucket_policy(bucket).await.map_err(policy_error)?;

                if info.owner == user {
                    let policy = reconciler::add_statement(current, user, bucket, Effect::Deny);
                    s3.put_bucket_policy(bucket, &policy)
                        .await
                        .map_err(policy_error)?;
                    info!(bucket, user, "owner access denied by policy, owner account kept");
                    return Ok(());
                }

                match current {
                    Some(current) => {
                        let policy = reconciler::drop_statements(current, user);
                        s3.put_bucket_policy(bucket, &policy)
                            .await
                            .map_err(policy_error)?;
                        info!(bucket, user, "principal ejected from bucket policy");
                    }
                    None => debug!(bucket, "bucket has no policy, nothing to drop"),
                }
            }
        }

        self.delete_user_logged(&state).await;
        Ok(())
    }

    async fn update_inner(&self, binding: &ObjectBucket) -> ProvisionResult<()> {
        debug!(?binding, "update requested");
        let state = self.initialize_for_binding(binding).await?;
        let requested = QuotaLimits::from_additional_config(&state.additional_config).parse()?;

        let user = state.admin.get_user(&state.ceph_user).await.map_err(|source| {
            ProvisionError::AdminOps {
                operation: "get user",
                resource: state.ceph_user.clone(),
                source,
            }
        })?;
        let spec = reconciler::quota_update(&state.ceph_user, &requested, &user.user_quota);
        state
            .admin
            .set_user_quota(&spec)
            .await
            .map_err(|source| ProvisionError::Quota {
                user: state.ceph_user.clone(),
                source,
            })?;
        info!(user = %state.ceph_user, ?spec, "user quota updated");
        Ok(())
    }

    async fn initialize_for_request(
        &self,
        request: &BucketRequest,
    ) -> ProvisionResult<ProvisionerState> {
        let claim = &request.claim;
        let sc = self.cluster.storage_class(&claim.storage_class_name).await?;
        let bucket_name = sc
            .static_bucket()
            .unwrap_or(&request.bucket_name)
            .to_string();
        self.initialize(
            &sc,
            bucket_name,
            user_name_for(claim),
            claim.additional_config.clone(),
        )
        .await
    }

    async fn initialize_for_binding(
        &self,
        binding: &ObjectBucket,
    ) -> ProvisionResult<ProvisionerState> {
        let sc = self.cluster.storage_class(&binding.storage_class_name).await?;
        let user = binding.ceph_user().ok_or_else(|| {
            ProvisionError::Configuration(format!(
                "binding `{}/{}` does not record its object store user",
                binding.namespace, binding.name
            ))
        })?;
        self.initialize(
            &sc,
            binding.bucket_name().to_string(),
            user.to_string(),
            binding.additional_config().clone(),
        )
        .await
    }

    /// Resolve gateway location, TLS trust material and the admin client.
    async fn initialize(
        &self,
        sc: &StorageClassParams,
        bucket_name: String,
        ceph_user: String,
        additional_config: BTreeMap<String, String>,
    ) -> ProvisionResult<ProvisionerState> {
        if bucket_name.is_empty() {
            return Err(ProvisionError::Configuration(
                "bucket name cannot be empty".into(),
            ));
        }
        if sc.object_store_name.is_none() && sc.endpoint.is_none() {
            return Err(ProvisionError::Configuration(format!(
                "storage class `{}` names neither an object store nor an endpoint",
                sc.name
            )));
        }
        let (Some(store_name), Some(store_namespace)) = (
            sc.object_store_name.as_deref(),
            sc.object_store_namespace.as_deref(),
        ) else {
            return Err(ProvisionError::Configuration(format!(
                "storage class `{}` must name the object store and its namespace",
                sc.name
            )));
        };
        let store = self
            .cluster
            .object_store(store_name, store_namespace)
            .await?;

        let (host, port) = match sc.endpoint.as_deref() {
            Some(endpoint) => {
                let (host, port) = split_endpoint(endpoint);
                let host = host.ok_or_else(|| {
                    ProvisionError::Configuration(format!(
                        "failed to discover host of endpoint `{}`",
                        endpoint
                    ))
                })?;
                if port == 0 {
                    return Err(ProvisionError::Configuration(format!(
                        "failed to discover port of endpoint `{}`",
                        endpoint
                    )));
                }
                (host, port)
            }
            None => (store.domain_name(), store.gateway_port()),
        };

        let tls_ca = if store.secure_port != 0 && store.secure_port == port {
            Some(self.cluster.tls_ca_cert(&store).await?)
        } else {
            None
        };

        let admin_credentials = self.cluster.admin_ops_credentials(&store).await?;
        let admin_endpoint = GatewayEndpoint {
            host: store.domain_name(),
            port,
            tls_ca: tls_ca.clone(),
        };
        let admin = self
            .admin_connector
            .connect(&admin_endpoint, &admin_credentials)
            .map_err(|err| {
                ProvisionError::Configuration(format!("failed to build admin ops client: {}", err))
            })?;
        debug!(gateway = %admin_endpoint.base_url(), store = %store.name, "admin ops client ready");

        Ok(ProvisionerState {
            bucket_name,
            endpoint: GatewayEndpoint { host, port, tls_ca },
            region: sc.region.clone(),
            additional_config,
            ceph_user,
            credentials: Credentials::default(),
            admin,
        })
    }

    async fn create_user(&self, state: &ProvisionerState) -> ProvisionResult<ObjectUser> {
        let user = state
            .admin
            .create_user(&state.ceph_user, &state.ceph_user)
            .await
            .map_err(|source| ProvisionError::UserCreation {
                user: state.ceph_user.clone(),
                source,
            })?;
        info!(user = %user.id, "created object store user");
        Ok(user)
    }

    fn open_session(
        &self,
        state: &ProvisionerState,
        credentials: &Credentials,
        as_user: &str,
    ) -> ProvisionResult<Arc<dyn S3Agent>> {
        self.s3_connector
            .connect(&state.endpoint, credentials, state.signing_region())
            .map_err(|source| ProvisionError::DataPlane {
                operation: "open S3 session as",
                resource: as_user.to_string(),
                source,
            })
    }

    async fn bucket_exists(&self, state: &ProvisionerState) -> ProvisionResult<bool> {
        match state.admin.get_bucket_info(&state.bucket_name).await {
            Ok(_) => Ok(true),
            Err(AdminOpsError::NoSuchBucket(_)) => Ok(false),
            Err(source) => Err(ProvisionError::AdminOps {
                operation: "get info of bucket",
                resource: state.bucket_name.clone(),
                source,
            }),
        }
    }

    async fn bucket_owner(&self, state: &ProvisionerState) -> ProvisionResult<ObjectUser> {
        let info = state
            .admin
            .get_bucket_info(&state.bucket_name)
            .await
            .map_err(|source| ProvisionError::AdminOps {
                operation: "get info of bucket",
                resource: state.bucket_name.clone(),
                source,
            })?;
        if info.owner.is_empty() {
            return Err(ProvisionError::BucketOwnerUnknown(state.bucket_name.clone()));
        }
        state
            .admin
            .get_user(&info.owner)
            .await
            .map_err(|source| ProvisionError::AdminOps {
                operation: "get user",
                resource: info.owner.clone(),
                source,
            })
    }

    async fn apply_initial_quota(&self, state: &ProvisionerState) -> ProvisionResult<()> {
        let limits = QuotaLimits::from_additional_config(&state.additional_config).parse()?;
        let Some(spec) = reconciler::initial_quota(&state.ceph_user, &limits) else {
            return Ok(());
        };
        state
            .admin
            .set_user_quota(&spec)
            .await
            .map_err(|source| ProvisionError::Quota {
                user: state.ceph_user.clone(),
                source,
            })?;
        info!(user = %state.ceph_user, ?spec, "user quota set");
        Ok(())
    }

    /// Best-effort removal of what a failed Provision or Grant created.
    async fn cleanup(&self, state: &ProvisionerState, created_bucket: Option<&str>) {
        if let Some(bucket) = created_bucket {
            match state.admin.remove_bucket(bucket, false).await {
                Ok(()) => info!(bucket, "removed bucket created by failed call"),
                Err(err) if err.is_not_found() => debug!(bucket, "bucket already absent"),
                Err(err) => warn!(bucket, error = %err, "failed to remove bucket during cleanup"),
            }
        }
        self.delete_user_logged(state).await;
    }

    async fn delete_user_logged(&self, state: &ProvisionerState) {
        match state.admin.delete_user(&state.ceph_user).await {
            Ok(()) => info!(user = %state.ceph_user, "user deleted"),
            Err(AdminOpsError::NoSuchUser(_)) => debug!(user = %state.ceph_user, "user already absent"),
            Err(err) => warn!(user = %state.ceph_user, error = %err, "failed to delete user"),
        }
    }
}
