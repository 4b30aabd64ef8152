use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::{env, path::PathBuf, str::FromStr, time::Duration};

use crate::{services::settings::OPERATOR_SETTINGS_CONFIG_MAP, workload::WorkloadKind};

/// Centralized application configuration.
/// Combines environment variables and CLI arguments.
#[derive(Debug, Clone)]
pub struct AppConfig {
    pub host: String,
    pub port: u16,
    pub database_url: String,
    /// Namespace the operator (and its settings ConfigMap) lives in.
    pub namespace: String,
    pub settings_config_map: String,
    /// Overall timeout of every admin-ops and S3 request.
    pub admin_timeout: Duration,
}

/// What the binary should do once configured.
#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Serve the lifecycle HTTP API (default)
    Serve,
    /// Run the binding store migration and exit
    Migrate,
    /// Render a workload manifest with operator-setting overrides and print it
    Render(RenderArgs),
}

#[derive(clap::Args, Debug, Clone)]
pub struct RenderArgs {
    #[arg(value_enum)]
    pub kind: WorkloadKind,

    /// Template file; defaults to the built-in template for the kind
    #[arg(long)]
    pub template: Option<PathBuf>,

    #[arg(long, default_value = "bucket-provisioner")]
    pub name: String,

    #[arg(long)]
    pub image: Option<String>,

    /// Free-form template value, repeatable (`KEY=VALUE`)
    #[arg(long = "value", value_parser = parse_key_value)]
    pub values: Vec<(String, String)>,

    /// Operator setting, repeatable (`KEY=VALUE`); ignored with --from-cluster
    #[arg(long = "setting", value_parser = parse_key_value)]
    pub settings: Vec<(String, String)>,

    /// Read operator settings from the cluster ConfigMap
    #[arg(long)]
    pub from_cluster: bool,

    #[arg(long)]
    pub resources_key: Option<String>,

    #[arg(long)]
    pub tolerations_key: Option<String>,

    #[arg(long)]
    pub node_affinity_key: Option<String>,

    #[arg(long)]
    pub port_key: Option<String>,

    /// Spread pods labelled `KEY=VALUE` across hosts
    #[arg(long, value_parser = parse_key_value)]
    pub anti_affinity: Option<(String, String)>,
}

/// Command-line + environment configuration.
#[derive(Parser, Debug)]
#[command(author, version, about = "Object bucket provisioner for Ceph object stores")]
pub struct Args {
    /// Host to bind to (overrides BUCKET_PROVISIONER_HOST)
    #[arg(long, global = true)]
    pub host: Option<String>,

    /// Port to bind to (overrides BUCKET_PROVISIONER_PORT)
    #[arg(long, global = true)]
    pub port: Option<u16>,

    /// Database URL (overrides BUCKET_PROVISIONER_DATABASE_URL)
    #[arg(long, global = true)]
    pub database_url: Option<String>,

    /// Operator namespace (overrides BUCKET_PROVISIONER_NAMESPACE)
    #[arg(long, global = true)]
    pub namespace: Option<String>,

    /// Operator settings ConfigMap (overrides BUCKET_PROVISIONER_SETTINGS_CONFIG_MAP)
    #[arg(long, global = true)]
    pub settings_config_map: Option<String>,

    /// Admin/S3 request timeout in seconds (overrides BUCKET_PROVISIONER_ADMIN_TIMEOUT_SECS)
    #[arg(long, global = true)]
    pub admin_timeout_secs: Option<u64>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

fn parse_key_value(raw: &str) -> Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_string(), value.to_string()))
        }
        _ => Err(format!("expected KEY=VALUE, got `{}`", raw)),
    }
}

fn env_number<T>(name: &str, default: T) -> Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env::var(name) {
        Ok(value) => value
            .parse::<T>()
            .with_context(|| format!("parsing {} value `{}`", name, value)),
        Err(env::VarError::NotPresent) => Ok(default),
        Err(err) => Err(err).with_context(|| format!("reading {}", name)),
    }
}

impl AppConfig {
    /// Parse environment variables + CLI args into AppConfig and the command to run.
    pub fn from_env_and_args() -> Result<(Self, Command)> {
        Self::from_args(Args::parse())
    }

    pub fn from_args(args: Args) -> Result<(Self, Command)> {
        // --- Environment fallback ---
        let env_host = env::var("BUCKET_PROVISIONER_HOST").unwrap_or_else(|_| "0.0.0.0".into());
        let env_port = env_number("BUCKET_PROVISIONER_PORT", 3000u16)?;
        let env_db = env::var("BUCKET_PROVISIONER_DATABASE_URL")
            .unwrap_or_else(|_| "sqlite://./data/meta/bucket_provisioner.db".into());
        let env_namespace =
            env::var("BUCKET_PROVISIONER_NAMESPACE").unwrap_or_else(|_| "rook-ceph".into());
        let env_config_map = env::var("BUCKET_PROVISIONER_SETTINGS_CONFIG_MAP")
            .unwrap_or_else(|_| OPERATOR_SETTINGS_CONFIG_MAP.into());
        let env_timeout = env_number("BUCKET_PROVISIONER_ADMIN_TIMEOUT_SECS", 15u64)?;

        // --- Merge ---
        let cfg = Self {
            host: args.host.unwrap_or(env_host),
            port: args.port.unwrap_or(env_port),
            database_url: args.database_url.unwrap_or(env_db),
            namespace: args.namespace.unwrap_or(env_namespace),
            settings_config_map: args.settings_config_map.unwrap_or(env_config_map),
            admin_timeout: Duration::from_secs(args.admin_timeout_secs.unwrap_or(env_timeout)),
        };

        Ok((cfg, args.command.unwrap_or(Command::Serve)))
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
