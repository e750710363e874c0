//! Per-environment transport selection. Yields [DaemonClient]
//! handles, cached with a TTL and invalidated on environment change.

use std::{sync::Arc, time::Duration};

use anyhow::Context;
use bollard::{API_DEFAULT_VERSION, Docker};
use dashmap::DashMap;
use stevedore_client::entities::{
  environment::{Environment, EnvironmentTransport, TlsConfig},
  stevedore_timestamp,
};

use crate::{config::core_config, state::store};

mod error;

pub use error::TransportError;

pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);
/// Calls slower than this get logged.
pub const SLOW_CALL: Duration = Duration::from_secs(5);

const CONFIG_CACHE_TTL_MS: i64 = 30 * 60 * 1000;
const CONNECT_TIMEOUT_SECS: u64 = 120;

const SOCKET_CANDIDATES: &[&str] = &[
  "/var/run/docker.sock",
  "/run/docker.sock",
  "/run/podman/podman.sock",
];

/// How the core reaches one environment's daemon.
pub enum Connection {
  /// Unix socket or direct tcp/tls, spoken through bollard.
  Local(Docker),
  /// An agent proxying the daemon api over http(s),
  /// authenticated with `X-Agent-Token`.
  AgentHttp {
    client: reqwest::Client,
    base_url: String,
  },
  /// Raw calls tunneled through the agent gateway.
  Edge,
}

pub struct DaemonClient {
  pub environment_id: String,
  pub environment_name: String,
  /// Used when mapping io errors to user facing categories.
  pub unix_socket: bool,
  /// The transport this client was built from; compose needs it to
  /// derive DOCKER_HOST for local execution.
  pub transport: EnvironmentTransport,
  pub connection: Connection,
}

fn daemon_cache() -> &'static DashMap<String, (Arc<DaemonClient>, i64)>
{
  static CACHE: std::sync::OnceLock<
    DashMap<String, (Arc<DaemonClient>, i64)>,
  > = std::sync::OnceLock::new();
  CACHE.get_or_init(Default::default)
}

/// Drop the cached handle for one environment. Called on environment
/// update / delete.
pub fn clear_config_cache(environment_id: &str) {
  daemon_cache().remove(environment_id);
}

#[cfg(test)]
pub fn clear_all_config_cache() {
  daemon_cache().clear();
}

/// Resolve the daemon handle for an environment, building and caching
/// the transport on miss.
pub async fn daemon_client(
  environment_id: &str,
) -> anyhow::Result<Arc<DaemonClient>> {
  let now = stevedore_timestamp();
  if let Some(entry) = daemon_cache().get(environment_id)
    && entry.1 > now
  {
    return Ok(entry.0.clone());
  }
  let environment = store()
    .environments()
    .get(environment_id)
    .await
    .context("Failed to query environment")?
    .with_context(|| {
      format!("No environment found with id {environment_id}")
    })?;
  let client = Arc::new(build_client(&environment).await?);
  daemon_cache().insert(
    environment_id.to_string(),
    (client.clone(), now + CONFIG_CACHE_TTL_MS),
  );
  Ok(client)
}

pub async fn daemon_client_for(
  environment: &Environment,
) -> anyhow::Result<Arc<DaemonClient>> {
  Ok(Arc::new(build_client(environment).await?))
}

async fn build_client(
  environment: &Environment,
) -> anyhow::Result<DaemonClient> {
  let unix_socket = matches!(
    environment.transport,
    EnvironmentTransport::Socket { .. }
  );
  let connection = match &environment.transport {
    EnvironmentTransport::Socket { socket_path } => {
      let path = match socket_path {
        Some(path) => path.clone(),
        None => autodetect_socket().await?,
      };
      let docker = Docker::connect_with_socket(
        &path,
        CONNECT_TIMEOUT_SECS,
        API_DEFAULT_VERSION,
      )
      .with_context(|| {
        format!("Failed to connect over socket {path}")
      })?;
      Connection::Local(docker)
    }
    EnvironmentTransport::Direct { host, port, tls } => {
      let docker = match tls {
        Some(tls) if tls.ca.is_some() => {
          let certs_dir = core_config()
            .data_dir
            .join("certs")
            .join(&environment.id);
          let (key, cert, ca) =
            materialize_tls(&certs_dir, tls).await?;
          Docker::connect_with_ssl(
            &format!("{host}:{port}"),
            &key,
            &cert,
            &ca,
            CONNECT_TIMEOUT_SECS,
            API_DEFAULT_VERSION,
          )
          .with_context(|| {
            format!("Failed to connect over tls to {host}:{port}")
          })?
        }
        _ => Docker::connect_with_http(
          &format!("tcp://{host}:{port}"),
          CONNECT_TIMEOUT_SECS,
          API_DEFAULT_VERSION,
        )
        .with_context(|| {
          format!("Failed to connect to {host}:{port}")
        })?,
      };
      Connection::Local(docker)
    }
    EnvironmentTransport::AgentHttp {
      host,
      port,
      tls,
      agent_token,
    } => {
      let scheme = if tls.is_some() { "https" } else { "http" };
      let mut builder = reqwest::Client::builder()
        .connect_timeout(Duration::from_secs(10));
      if let Some(tls) = tls {
        if let Some(ca) = &tls.ca {
          builder = builder.add_root_certificate(
            reqwest::Certificate::from_pem(ca.as_bytes())
              .context("Invalid agent CA certificate")?,
          );
        }
        if let (Some(cert), Some(key)) = (&tls.cert, &tls.key) {
          let identity = reqwest::Identity::from_pem(
            format!("{cert}\n{key}").as_bytes(),
          )
          .context("Invalid agent client certificate / key")?;
          builder = builder.identity(identity);
        }
        if tls.skip_verify {
          builder = builder.danger_accept_invalid_certs(true);
        }
      }
      let mut headers = reqwest::header::HeaderMap::new();
      headers.insert(
        "X-Agent-Token",
        agent_token
          .parse()
          .context("Agent token is not a valid header value")?,
      );
      let client = builder
        .default_headers(headers)
        .build()
        .context("Failed to build agent http client")?;
      Connection::AgentHttp {
        client,
        base_url: format!("{scheme}://{host}:{port}"),
      }
    }
    EnvironmentTransport::AgentEdge => Connection::Edge,
  };
  Ok(DaemonClient {
    environment_id: environment.id.clone(),
    environment_name: environment.name.clone(),
    unix_socket,
    transport: environment.transport.clone(),
    connection,
  })
}

async fn autodetect_socket() -> anyhow::Result<String> {
  for candidate in SOCKET_CANDIDATES {
    if tokio::fs::metadata(candidate).await.is_ok() {
      return Ok(candidate.to_string());
    }
  }
  if let Ok(runtime_dir) = std::env::var("XDG_RUNTIME_DIR") {
    let candidate = format!("{runtime_dir}/docker.sock");
    if tokio::fs::metadata(&candidate).await.is_ok() {
      return Ok(candidate);
    }
  }
  Err(anyhow::anyhow!(
    "No daemon socket found among the well known paths"
  ))
}

/// Bollard takes cert paths, the store holds PEM contents.
async fn materialize_tls(
  dir: &std::path::Path,
  tls: &TlsConfig,
) -> anyhow::Result<(
  std::path::PathBuf,
  std::path::PathBuf,
  std::path::PathBuf,
)> {
  tokio::fs::create_dir_all(dir)
    .await
    .with_context(|| format!("Failed to create cert dir {dir:?}"))?;
  let write = async |name: &str, contents: Option<&String>| {
    let path = dir.join(name);
    let contents = contents.with_context(|| {
      format!("tls transport requires {name} to be configured")
    })?;
    tokio::fs::write(&path, contents)
      .await
      .with_context(|| format!("Failed to write {path:?}"))?;
    anyhow::Ok(path)
  };
  let key = write("key.pem", tls.key.as_ref()).await?;
  let cert = write("cert.pem", tls.cert.as_ref()).await?;
  let ca = write("ca.pem", tls.ca.as_ref()).await?;
  Ok((key, cert, ca))
}

/// Time an operation against a daemon, logging slow calls.
pub async fn timed<T, F>(
  environment_name: &str,
  what: &str,
  fut: F,
) -> T
where
  F: Future<Output = T>,
{
  let start = std::time::Instant::now();
  let res = fut.await;
  let elapsed = start.elapsed();
  if elapsed > SLOW_CALL {
    warn!(
      "slow daemon call | env: {environment_name} | {what} took {}ms",
      elapsed.as_millis()
    );
  }
  res
}
