use std::{path::PathBuf, sync::OnceLock};

use clap::Parser;
use colored::Colorize;
use serde::Deserialize;
use stevedore_client::entities::logger::{
  LogConfig, LogLevel, StdioLogMode,
};

pub fn core_config() -> &'static CoreConfig {
  static CORE_CONFIG: OnceLock<CoreConfig> = OnceLock::new();
  CORE_CONFIG.get_or_init(|| {
    let env: Env = envy::from_env()
      .expect("failed to parse stevedore environment");
    let args = CliArgs::parse();
    let data_dir = args
      .data_dir
      .unwrap_or(env.stevedore_data_dir);
    let git_repos_dir = env
      .stevedore_git_repos_dir
      .unwrap_or_else(|| data_dir.join("git-repos"));
    CoreConfig {
      port: env.stevedore_port,
      bind_ip: env.stevedore_bind_ip,
      stacks_dir: data_dir.join("stacks"),
      data_dir,
      git_repos_dir,
      logging: LogConfig {
        level: args
          .log_level
          .map(LogLevel::from)
          .unwrap_or(env.stevedore_log_level),
        stdio: env.stevedore_log_stdio,
        pretty: env.stevedore_log_pretty,
        otlp_endpoint: env.stevedore_otlp_endpoint,
        opentelemetry_service_name: env
          .stevedore_otlp_service_name,
      },
      ssl_enabled: env.stevedore_ssl_enabled,
      ssl_cert_file: env.stevedore_ssl_cert_file,
      ssl_key_file: env.stevedore_ssl_key_file,
      legacy_compose_cli: env.stevedore_legacy_compose_cli,
      pretty_startup_config: env.stevedore_pretty_startup_config,
    }
  })
}

#[derive(Debug, Clone)]
pub struct CoreConfig {
  pub port: u16,
  pub bind_ip: String,
  /// Root for persisted state.
  pub data_dir: PathBuf,
  /// `<data_dir>/stacks`, compose file materialization root.
  pub stacks_dir: PathBuf,
  /// Clone root for git backed stacks.
  pub git_repos_dir: PathBuf,
  pub logging: LogConfig,
  pub ssl_enabled: bool,
  pub ssl_cert_file: Option<PathBuf>,
  pub ssl_key_file: Option<PathBuf>,
  /// Use the standalone `docker-compose` binary instead of the
  /// `docker compose` plugin.
  pub legacy_compose_cli: bool,
  pub pretty_startup_config: bool,
}

impl CoreConfig {
  /// Printable at startup without leaking anything sensitive.
  pub fn sanitized(&self) -> CoreConfig {
    self.clone()
  }

  pub fn print_startup(&self) {
    println!(
      "{}: stevedore core v{}",
      "INFO".green(),
      env!("CARGO_PKG_VERSION")
    );
    if self.pretty_startup_config {
      println!("{:#?}", self.sanitized());
    } else {
      println!("{:?}", self.sanitized());
    }
  }
}

#[derive(Deserialize)]
struct Env {
  #[serde(default = "default_port")]
  stevedore_port: u16,
  #[serde(default = "default_bind_ip")]
  stevedore_bind_ip: String,
  #[serde(default = "default_data_dir")]
  stevedore_data_dir: PathBuf,
  #[serde(default)]
  stevedore_git_repos_dir: Option<PathBuf>,
  #[serde(default)]
  stevedore_log_level: LogLevel,
  #[serde(default)]
  stevedore_log_stdio: StdioLogMode,
  #[serde(default)]
  stevedore_log_pretty: bool,
  #[serde(default)]
  stevedore_otlp_endpoint: String,
  #[serde(default = "default_otlp_service_name")]
  stevedore_otlp_service_name: String,
  #[serde(default)]
  stevedore_ssl_enabled: bool,
  #[serde(default)]
  stevedore_ssl_cert_file: Option<PathBuf>,
  #[serde(default)]
  stevedore_ssl_key_file: Option<PathBuf>,
  #[serde(default)]
  stevedore_legacy_compose_cli: bool,
  #[serde(default)]
  stevedore_pretty_startup_config: bool,
}

fn default_port() -> u16 {
  9779
}

fn default_bind_ip() -> String {
  String::from("0.0.0.0")
}

fn default_data_dir() -> PathBuf {
  PathBuf::from("/etc/stevedore")
}

fn default_otlp_service_name() -> String {
  String::from("Stevedore")
}

#[derive(Parser)]
#[command(name = "stevedore-core", about = "Stevedore control plane")]
pub struct CliArgs {
  /// Override the log level. trace | debug | info | warn | error
  #[arg(long)]
  pub log_level: Option<tracing::Level>,
  /// Override the data directory.
  #[arg(long)]
  pub data_dir: Option<PathBuf>,
}
