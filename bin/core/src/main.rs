#[macro_use]
extern crate tracing;

use std::{net::SocketAddr, str::FromStr, sync::Arc};

use anyhow::Context;
use axum::Router;
use axum_server::tls_rustls::RustlsConfig;
use stevedore_core::{
  config::core_config, defaults, gateway, schedule, state, workers,
};

async fn app() -> anyhow::Result<()> {
  dotenvy::dotenv().ok();
  let config = core_config();
  logger::init(&config.logging)?;
  if let Err(e) =
    rustls::crypto::aws_lc_rs::default_provider().install_default()
  {
    error!("Failed to install default crypto provider | {e:?}");
    std::process::exit(1);
  }

  info!("Stevedore Core version: v{}", env!("CARGO_PKG_VERSION"));
  config.print_startup();

  // Standalone wiring. Embedders swap in their own store,
  // notifier and authorizer before anything else runs.
  state::init_services(
    Arc::new(defaults::MemoryStore::default()),
    Arc::new(defaults::LogNotifier),
    Arc::new(defaults::AllowAllAuthorizer),
    Arc::new(defaults::Argon2Hasher),
  );

  tokio::fs::create_dir_all(&config.stacks_dir)
    .await
    .context("Failed to create stacks dir")?;
  tokio::fs::create_dir_all(&config.git_repos_dir)
    .await
    .context("Failed to create git repos dir")?;

  // Background machinery.
  workers::start_all().await;
  schedule::spawn_schedule_executor();
  gateway::spawn_heartbeat_sweep();

  let app = Router::new()
    .nest("/ws", gateway::router())
    .into_make_service();

  let addr = format!("{}:{}", config.bind_ip, config.port);
  let socket_addr = SocketAddr::from_str(&addr)
    .context("failed to parse listen address")?;

  if config.ssl_enabled {
    info!("🔒 Core SSL Enabled");
    info!("Stevedore Core starting on https://{socket_addr}");
    let cert = config
      .ssl_cert_file
      .as_ref()
      .context("ssl enabled without ssl_cert_file")?;
    let key = config
      .ssl_key_file
      .as_ref()
      .context("ssl enabled without ssl_key_file")?;
    let ssl_config = RustlsConfig::from_pem_file(cert, key)
      .await
      .context("Invalid ssl cert / key")?;
    axum_server::bind_rustls(socket_addr, ssl_config)
      .serve(app)
      .await
      .context("failed to start https server")
  } else {
    info!("🔓 Core SSL Disabled");
    info!("Stevedore Core starting on http://{socket_addr}");
    axum_server::bind(socket_addr)
      .serve(app)
      .await
      .context("failed to start http server")
  }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
  let mut term_signal = tokio::signal::unix::signal(
    tokio::signal::unix::SignalKind::terminate(),
  )?;
  let res = tokio::select! {
    res = tokio::spawn(app()) => res?,
    _ = term_signal.recv() => {
      info!("SIGTERM received, shutting down");
      Ok(())
    }
  };
  workers::stop_all();
  res
}
