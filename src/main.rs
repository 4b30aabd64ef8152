use anyhow::{Context, Result};
use axum::Router;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use std::{collections::BTreeMap, fs, io::ErrorKind, path::Path, str::FromStr, sync::Arc};
use tokio::net::TcpListener;
use tracing_subscriber::EnvFilter;

mod config;
mod errors;
mod handlers;
mod models;
mod routes;
mod services;
mod workload;

use config::{AppConfig, Command, RenderArgs};
use services::{
    admin_ops::RgwAdminOpsConnector,
    binding_store::BindingStore,
    cluster::KubeClusterLookup,
    provisioner::Provisioner,
    s3_agent::HttpS3Connector,
    settings::{ConfigMapSettings, MapSettings, SettingsSource},
};
use workload::{PodOverrides, render_workload, templates::TemplateParams};

#[tokio::main]
async fn main() -> Result<()> {
    // --- Logging setup ---
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    // --- Parse config + command ---
    let (cfg, command) = AppConfig::from_env_and_args()?;

    tracing::info!("Starting bucket-provisioner with config: {:?}", cfg);

    match command {
        Command::Render(args) => render(&cfg, args).await,
        Command::Migrate => {
            let store = open_store(&cfg.database_url).await?;
            let applied = store.migrate().await?;
            tracing::info!("Database migration complete ({} statements).", applied);
            Ok(())
        }
        Command::Serve => serve(&cfg).await,
    }
}

/// Local file behind a SQLite URL, or `None` for in-memory databases.
fn sqlite_file_path(db_url: &str) -> Option<&Path> {
    let path = db_url
        .trim_start_matches("sqlite://")
        .trim_start_matches("sqlite:")
        .trim_start_matches("file:");
    let path = path.split('?').next().unwrap_or_default();
    if path.is_empty() || path.contains(":memory:") || db_url.contains("mode=memory") {
        None
    } else {
        Some(Path::new(path))
    }
}

/// Open the SQLite binding store, creating the database directory if needed.
async fn open_store(db_url: &str) -> Result<BindingStore> {
    tracing::debug!("Connecting using raw URL => {}", db_url);

    if let Some(db_path) = sqlite_file_path(db_url) {
        tracing::debug!("Interpreted SQLite path => {}", db_path.display());
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() && !parent.exists() {
                fs::create_dir_all(parent)?;
                tracing::info!("Created missing directory {:?}", parent);
            }
        }
    }

    let options = SqliteConnectOptions::from_str(db_url)
        .with_context(|| format!("parsing {}", db_url))?
        .create_if_missing(true);
    let db = Arc::new(
        SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .with_context(|| format!("connecting to {}", db_url))?,
    );
    Ok(BindingStore::new(db))
}

async fn serve(cfg: &AppConfig) -> Result<()> {
    let store = open_store(&cfg.database_url).await?;
    store.migrate().await?;

    // --- Initialize lifecycle coordinator ---
    let client = kube::Client::try_default()
        .await
        .context("creating Kubernetes client")?;
    let provisioner = Provisioner::new(
        Arc::new(KubeClusterLookup::new(client)),
        Arc::new(RgwAdminOpsConnector {
            timeout: cfg.admin_timeout,
        }),
        Arc::new(HttpS3Connector {
            timeout: cfg.admin_timeout,
        }),
        tracing::info_span!("provisioner"),
    );

    // --- Build router ---
    let state = routes::routes::AppState { provisioner, store };
    let app: Router = routes::routes::routes().with_state(state);

    // --- Start server ---
    let addr = cfg.addr();
    let listener = match TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(err)
            if err.kind() == ErrorKind::PermissionDenied
                && matches!(cfg.host.as_str(), "0.0.0.0" | "::") =>
        {
            let fallback_addr = format!("127.0.0.1:{}", cfg.port);
            tracing::warn!(
                "Permission denied binding to {} ({}). Falling back to {}",
                addr,
                err,
                fallback_addr
            );
            TcpListener::bind(&fallback_addr).await?
        }
        Err(err) => return Err(err.into()),
    };

    tracing::info!("Server listening on http://{}", listener.local_addr()?);
    axum::serve(listener, app).await?;

    Ok(())
}

/// Render a workload manifest to stdout.
async fn render(cfg: &AppConfig, args: RenderArgs) -> Result<()> {
    let template = match &args.template {
        Some(path) => fs::read_to_string(path)
            .with_context(|| format!("reading template {}", path.display()))?,
        None => args
            .kind
            .builtin_template()
            .ok_or(workload::templates::TemplateError::NoTemplate(args.kind.as_str()))?
            .to_string(),
    };

    let settings: Box<dyn SettingsSource> = if args.from_cluster {
        let client = kube::Client::try_default()
            .await
            .context("creating Kubernetes client")?;
        Box::new(ConfigMapSettings::new(
            client,
            cfg.namespace.clone(),
            cfg.settings_config_map.clone(),
        ))
    } else {
        Box::new(MapSettings::new(args.settings.into_iter().collect()))
    };

    let defaults = TemplateParams::default();
    let params = TemplateParams {
        name: args.name.clone(),
        namespace: cfg.namespace.clone(),
        image: args.image.unwrap_or(defaults.image),
        port: cfg.port,
        values: args.values.into_iter().collect::<BTreeMap<_, _>>(),
        ..defaults
    };
    let overrides = PodOverrides {
        resources_key: args.resources_key,
        tolerations_key: args.tolerations_key,
        node_affinity_key: args.node_affinity_key,
        port_key: args.port_key,
        anti_affinity: args.anti_affinity,
    };

    let manifest = render_workload(
        args.kind,
        &args.name,
        &template,
        &params,
        settings.as_ref(),
        &overrides,
    )
    .await?;
    print!("{}", manifest);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_urls_have_no_file() {
        assert_eq!(sqlite_file_path("sqlite::memory:"), None);
        assert_eq!(sqlite_file_path("sqlite://:memory:"), None);
        assert_eq!(sqlite_file_path("sqlite://file:shared?mode=memory&cache=shared"), None);
    }

    #[test]
    fn file_urls_resolve_to_their_path() {
        assert_eq!(
            sqlite_file_path("sqlite://./data/meta/bucket_provisioner.db"),
            Some(Path::new("./data/meta/bucket_provisioner.db"))
        );
        assert_eq!(
            sqlite_file_path("sqlite:/var/lib/bp.db?mode=rwc"),
            Some(Path::new("/var/lib/bp.db"))
        );
    }
}
