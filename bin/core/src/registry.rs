//! Registry v2 client: just enough to answer "is there a newer
//! image behind this tag" with one authenticated HEAD request.

use anyhow::{Context, anyhow};
use serde::Deserialize;

use crate::store::settings;

const DOCKER_HUB_REGISTRY: &str = "index.docker.io";
const DOCKER_HUB_API_HOST: &str = "registry-1.docker.io";

/// Host spellings that all mean Docker Hub.
const DOCKER_HUB_ALIASES: &[&str] = &[
  "docker.io",
  "index.docker.io",
  "registry-1.docker.io",
  "registry.hub.docker.com",
  "hub.docker.com",
];

const MANIFEST_ACCEPT: &str = concat!(
  "application/vnd.docker.distribution.manifest.list.v2+json, ",
  "application/vnd.docker.distribution.manifest.v2+json, ",
  "application/vnd.oci.image.index.v1+json, ",
  "application/vnd.oci.image.manifest.v1+json"
);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRef {
  /// Canonical registry host, `index.docker.io` when unspecified.
  pub registry: String,
  /// Canonical repository, `library/` prefixed for bare hub names.
  pub repository: String,
  pub tag: String,
  pub digest: Option<String>,
  /// The reference as written, minus tag and digest. Keeps
  /// `registry:port/...` prefixes intact for re-tagging.
  pub name: String,
}

impl ImageRef {
  pub fn is_docker_hub(&self) -> bool {
    DOCKER_HUB_ALIASES.contains(&self.registry.as_str())
  }

  /// Hostname to hit for the v2 api.
  fn api_host(&self) -> &str {
    if self.is_docker_hub() {
      DOCKER_HUB_API_HOST
    } else {
      &self.registry
    }
  }

  /// The reference to hand to a pull, without tag or digest.
  pub fn repository_with_registry(&self) -> String {
    self.name.clone()
  }
}

/// Split an image reference into registry / repository / tag /
/// digest. A first path segment counts as a registry host when it
/// has a dot, a port, or is `localhost`.
pub fn split_image_reference(reference: &str) -> ImageRef {
  let (rest, digest) = match reference.split_once('@') {
    Some((rest, digest)) => (rest, Some(digest.to_string())),
    None => (reference, None),
  };

  // Only a ':' after the last '/' is a tag separator; before it, it
  // is a registry port.
  let last_slash = rest.rfind('/');
  let tag_colon = match rest.rfind(':') {
    Some(idx)
      if last_slash.map(|slash| idx > slash).unwrap_or(true) =>
    {
      Some(idx)
    }
    _ => None,
  };
  let (name, tag) = match tag_colon {
    Some(idx) => {
      (rest[..idx].to_string(), rest[idx + 1..].to_string())
    }
    None => (rest.to_string(), String::from("latest")),
  };

  let (registry, repository) = match name.split_once('/') {
    Some((first, remainder))
      if first.contains('.')
        || first.contains(':')
        || first == "localhost" =>
    {
      (first.to_string(), remainder.to_string())
    }
    Some(_) => (DOCKER_HUB_REGISTRY.to_string(), name.clone()),
    None => (
      DOCKER_HUB_REGISTRY.to_string(),
      format!("library/{name}"),
    ),
  };

  ImageRef {
    registry,
    repository,
    tag,
    digest,
    name,
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RegistryCredential {
  pub host: String,
  pub username: String,
  pub password: String,
}

/// Operator configured registry credentials, a JSON list in
/// settings.
pub async fn configured_credentials() -> Vec<RegistryCredential> {
  let raw =
    settings::get_string("registry_credentials", "[]").await;
  match serde_json::from_str(&raw) {
    Ok(credentials) => credentials,
    Err(e) => {
      warn!("registry_credentials setting is invalid json | {e}");
      Vec::new()
    }
  }
}

fn credential_for<'a>(
  image: &ImageRef,
  credentials: &'a [RegistryCredential],
) -> Option<&'a RegistryCredential> {
  credentials.iter().find(|credential| {
    if image.is_docker_hub() {
      DOCKER_HUB_ALIASES.contains(&credential.host.as_str())
    } else {
      credential.host == image.registry
    }
  })
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
  /// 429s are transient and expected on the hub; callers stay
  /// quiet about them.
  #[error("registry rate limited the request")]
  RateLimited,
  #[error(transparent)]
  Other(#[from] anyhow::Error),
}

#[derive(Deserialize)]
struct TokenResponse {
  #[serde(default)]
  token: Option<String>,
  #[serde(default)]
  access_token: Option<String>,
}

/// HEAD the manifest and return its content digest.
pub async fn fetch_remote_digest(
  image: &ImageRef,
) -> Result<String, RegistryError> {
  let credentials = configured_credentials().await;
  let credential = credential_for(image, &credentials);
  let client = reqwest::Client::builder()
    .timeout(std::time::Duration::from_secs(30))
    .build()
    .context("Failed to build registry client")?;

  let authorization =
    authenticate(&client, image, credential).await?;

  let url = format!(
    "https://{}/v2/{}/manifests/{}",
    image.api_host(),
    image.repository,
    image.tag
  );
  let mut req =
    client.head(&url).header("Accept", MANIFEST_ACCEPT);
  if let Some(authorization) = authorization {
    req = req.header("Authorization", authorization);
  }
  let resp = req
    .send()
    .await
    .with_context(|| format!("HEAD {url} failed"))?;
  match resp.status().as_u16() {
    429 => return Err(RegistryError::RateLimited),
    status if status >= 400 => {
      return Err(
        anyhow!("registry returned {status} for {url}").into(),
      );
    }
    _ => {}
  }
  resp
    .headers()
    .get("Docker-Content-Digest")
    .and_then(|value| value.to_str().ok())
    .map(str::to_string)
    .with_context(|| {
      format!("no Docker-Content-Digest header on {url}")
    })
    .map_err(Into::into)
}

/// Probe `/v2/` and follow the WWW-Authenticate challenge.
async fn authenticate(
  client: &reqwest::Client,
  image: &ImageRef,
  credential: Option<&RegistryCredential>,
) -> Result<Option<String>, RegistryError> {
  let probe_url = format!("https://{}/v2/", image.api_host());
  let probe = client
    .get(&probe_url)
    .send()
    .await
    .with_context(|| format!("GET {probe_url} failed"))?;

  if probe.status().as_u16() == 429 {
    return Err(RegistryError::RateLimited);
  }
  if probe.status().as_u16() != 401 {
    return Ok(None);
  }
  let challenge = probe
    .headers()
    .get("WWW-Authenticate")
    .and_then(|value| value.to_str().ok())
    .context("401 without WWW-Authenticate header")?
    .to_string();

  if challenge.starts_with("Basic") {
    let credential = credential.context(
      "registry requires basic auth but no credentials are configured",
    )?;
    return Ok(Some(basic_header(
      &credential.username,
      &credential.password,
    )));
  }

  let params = parse_challenge(&challenge);
  let realm = params
    .get("realm")
    .with_context(|| format!("challenge without realm: {challenge}"))?;
  let mut token_url = format!(
    "{realm}?scope={}",
    urlencoding::encode(&format!(
      "repository:{}:pull",
      image.repository
    ))
  );
  if let Some(service) = params.get("service") {
    token_url.push_str(&format!(
      "&service={}",
      urlencoding::encode(service)
    ));
  }
  let mut req = client.get(&token_url);
  if let Some(credential) = credential {
    req = req.basic_auth(
      &credential.username,
      Some(&credential.password),
    );
  }
  let resp = req
    .send()
    .await
    .with_context(|| format!("token request to {realm} failed"))?;
  if resp.status().as_u16() == 429 {
    return Err(RegistryError::RateLimited);
  }
  if resp.status().as_u16() >= 400 {
    return Err(
      anyhow!(
        "token endpoint returned {} for {token_url}",
        resp.status()
      )
      .into(),
    );
  }
  let token: TokenResponse = resp
    .json()
    .await
    .context("invalid token endpoint response")?;
  let token = token
    .token
    .or(token.access_token)
    .context("token endpoint returned no token")?;
  Ok(Some(format!("Bearer {token}")))
}

fn basic_header(username: &str, password: &str) -> String {
  use base64::{Engine, engine::general_purpose::STANDARD};
  format!(
    "Basic {}",
    STANDARD.encode(format!("{username}:{password}"))
  )
}

/// `Bearer realm="https://...",service="...",scope="..."`
fn parse_challenge(
  challenge: &str,
) -> std::collections::HashMap<String, String> {
  let rest = challenge
    .split_once(' ')
    .map(|(_, rest)| rest)
    .unwrap_or(challenge);
  rest
    .split(',')
    .filter_map(|pair| {
      let (key, value) = pair.split_once('=')?;
      Some((
        key.trim().to_string(),
        value.trim().trim_matches('"').to_string(),
      ))
    })
    .collect()
}

/// True when the remote digest already appears in the image's local
/// RepoDigests. A single image may legitimately carry several
/// digests; matching any of them means no update.
pub fn digest_matches_local(
  remote_digest: &str,
  repo_digests: &[String],
) -> bool {
  repo_digests.iter().any(|repo_digest| {
    let local = repo_digest
      .split_once('@')
      .map(|(_, digest)| digest)
      .unwrap_or(repo_digest);
    local == remote_digest
  })
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn bare_hub_name_gets_library_prefix_and_latest() {
    let image = split_image_reference("nginx");
    assert_eq!(image.registry, "index.docker.io");
    assert_eq!(image.repository, "library/nginx");
    assert_eq!(image.tag, "latest");
    assert_eq!(image.digest, None);
    assert_eq!(image.name, "nginx");
  }

  #[test]
  fn hub_namespace_is_not_a_registry() {
    let image = split_image_reference("acme/svc:stable");
    assert_eq!(image.registry, "index.docker.io");
    assert_eq!(image.repository, "acme/svc");
    assert_eq!(image.tag, "stable");
  }

  #[test]
  fn registry_port_is_not_a_tag() {
    let image = split_image_reference("registry:5000/repo");
    assert_eq!(image.registry, "registry:5000");
    assert_eq!(image.repository, "repo");
    assert_eq!(image.tag, "latest");
    assert_eq!(image.name, "registry:5000/repo");
  }

  #[test]
  fn registry_port_with_tag() {
    let image = split_image_reference("registry:5000/ns/repo:v2");
    assert_eq!(image.registry, "registry:5000");
    assert_eq!(image.repository, "ns/repo");
    assert_eq!(image.tag, "v2");
  }

  #[test]
  fn ghcr_style_reference() {
    let image = split_image_reference("ghcr.io/acme/svc:stable");
    assert_eq!(image.registry, "ghcr.io");
    assert_eq!(image.repository, "acme/svc");
    assert_eq!(image.tag, "stable");
    assert!(!image.is_docker_hub());
  }

  #[test]
  fn localhost_is_a_registry() {
    let image = split_image_reference("localhost/repo:dev");
    assert_eq!(image.registry, "localhost");
    assert_eq!(image.repository, "repo");
  }

  #[test]
  fn digest_pin_is_stripped() {
    let image =
      split_image_reference("nginx@sha256:abc123");
    assert_eq!(image.digest.as_deref(), Some("sha256:abc123"));
    assert_eq!(image.repository, "library/nginx");
    assert_eq!(image.tag, "latest");
  }

  #[test]
  fn tag_and_digest_together() {
    let image = split_image_reference(
      "ghcr.io/acme/svc:stable@sha256:abc",
    );
    assert_eq!(image.tag, "stable");
    assert_eq!(image.digest.as_deref(), Some("sha256:abc"));
    assert_eq!(image.name, "ghcr.io/acme/svc");
  }

  #[test]
  fn hub_aliases_all_match() {
    for host in DOCKER_HUB_ALIASES {
      let image =
        split_image_reference(&format!("{host}/acme/svc"));
      assert!(image.is_docker_hub(), "{host}");
    }
  }

  #[test]
  fn challenge_parsing_extracts_realm_and_service() {
    let params = parse_challenge(
      r#"Bearer realm="https://auth.docker.io/token",service="registry.docker.io""#,
    );
    assert_eq!(
      params.get("realm").map(String::as_str),
      Some("https://auth.docker.io/token")
    );
    assert_eq!(
      params.get("service").map(String::as_str),
      Some("registry.docker.io")
    );
  }

  #[test]
  fn digest_comparison_checks_every_repo_digest() {
    let locals = vec![
      String::from("acme/svc@sha256:AAA"),
      String::from("acme/svc@sha256:BBB"),
    ];
    assert!(digest_matches_local("sha256:BBB", &locals));
    assert!(digest_matches_local("sha256:AAA", &locals));
    assert!(!digest_matches_local("sha256:CCC", &locals));
    assert!(!digest_matches_local("sha256:AAA", &[]));
  }
}
