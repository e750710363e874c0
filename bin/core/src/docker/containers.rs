use bollard::{
  models::{
    ContainerCreateBody, ContainerCreateResponse,
    ContainerInspectResponse, ContainerStatsResponse,
    ContainerSummary,
  },
  query_parameters::{
    CreateContainerOptions, InspectContainerOptions,
    ListContainersOptions, LogsOptionsBuilder,
    RemoveContainerOptions, RestartContainerOptions,
    StatsOptionsBuilder, StopContainerOptions,
  },
};
use futures::StreamExt;

use super::{STREAM_CALL_TIMEOUT, demux::demux_output};
use crate::router::{
  Connection, DEFAULT_CALL_TIMEOUT, DaemonClient, TransportError,
};

impl DaemonClient {
  pub async fn list_containers(
    &self,
  ) -> Result<Vec<ContainerSummary>, TransportError> {
    match &self.connection {
      Connection::Local(docker) => docker
        .list_containers(Some(ListContainersOptions {
          all: true,
          ..Default::default()
        }))
        .await
        .map_err(|e| self.map_err(e)),
      _ => {
        self
          .raw_json(
            "GET",
            "/containers/json?all=true",
            None,
            DEFAULT_CALL_TIMEOUT,
          )
          .await
      }
    }
  }

  pub async fn inspect_container(
    &self,
    container: &str,
  ) -> Result<ContainerInspectResponse, TransportError> {
    match &self.connection {
      Connection::Local(docker) => docker
        .inspect_container(
          container,
          InspectContainerOptions { size: false }.into(),
        )
        .await
        .map_err(|e| self.map_err(e)),
      _ => {
        self
          .raw_json(
            "GET",
            &format!(
              "/containers/{}/json",
              urlencoding::encode(container)
            ),
            None,
            DEFAULT_CALL_TIMEOUT,
          )
          .await
      }
    }
  }

  pub async fn start_container(
    &self,
    container: &str,
  ) -> Result<(), TransportError> {
    match &self.connection {
      Connection::Local(docker) => docker
        .start_container(
          container,
          Option::<bollard::query_parameters::StartContainerOptions>::None,
        )
        .await
        .map_err(|e| self.map_err(e)),
      _ => {
        self
          .raw_unit(
            "POST",
            &format!(
              "/containers/{}/start",
              urlencoding::encode(container)
            ),
            None,
          )
          .await
      }
    }
  }

  pub async fn stop_container(
    &self,
    container: &str,
    timeout_secs: Option<i32>,
  ) -> Result<(), TransportError> {
    match &self.connection {
      Connection::Local(docker) => docker
        .stop_container(
          container,
          StopContainerOptions {
            t: timeout_secs,
            ..Default::default()
          }
          .into(),
        )
        .await
        .map_err(|e| self.map_err(e)),
      _ => {
        let t = timeout_secs
          .map(|t| format!("?t={t}"))
          .unwrap_or_default();
        self
          .raw_unit(
            "POST",
            &format!(
              "/containers/{}/stop{t}",
              urlencoding::encode(container)
            ),
            None,
          )
          .await
      }
    }
  }

  pub async fn restart_container(
    &self,
    container: &str,
    timeout_secs: Option<i32>,
  ) -> Result<(), TransportError> {
    match &self.connection {
      Connection::Local(docker) => docker
        .restart_container(
          container,
          RestartContainerOptions {
            t: timeout_secs,
            ..Default::default()
          }
          .into(),
        )
        .await
        .map_err(|e| self.map_err(e)),
      _ => {
        let t = timeout_secs
          .map(|t| format!("?t={t}"))
          .unwrap_or_default();
        self
          .raw_unit(
            "POST",
            &format!(
              "/containers/{}/restart{t}",
              urlencoding::encode(container)
            ),
            None,
          )
          .await
      }
    }
  }

  pub async fn remove_container(
    &self,
    container: &str,
    force: bool,
  ) -> Result<(), TransportError> {
    match &self.connection {
      Connection::Local(docker) => docker
        .remove_container(
          container,
          RemoveContainerOptions {
            force,
            ..Default::default()
          }
          .into(),
        )
        .await
        .map_err(|e| self.map_err(e)),
      _ => {
        self
          .raw_unit(
            "DELETE",
            &format!(
              "/containers/{}?force={force}",
              urlencoding::encode(container)
            ),
            None,
          )
          .await
      }
    }
  }

  pub async fn create_container(
    &self,
    name: &str,
    body: ContainerCreateBody,
  ) -> Result<ContainerCreateResponse, TransportError> {
    match &self.connection {
      Connection::Local(docker) => docker
        .create_container(
          CreateContainerOptions {
            name: Some(name.to_string()),
            ..Default::default()
          }
          .into(),
          body,
        )
        .await
        .map_err(|e| self.map_err(e)),
      _ => {
        let body = serde_json::to_value(&body).map_err(|e| {
          TransportError::Protocol(format!(
            "failed to serialize container create body | {e}"
          ))
        })?;
        self
          .raw_json(
            "POST",
            &format!(
              "/containers/create?name={}",
              urlencoding::encode(name)
            ),
            Some(body),
            DEFAULT_CALL_TIMEOUT,
          )
          .await
      }
    }
  }

  /// One-shot stats sample, `stream=false` semantics.
  pub async fn container_stats_once(
    &self,
    container: &str,
  ) -> Result<ContainerStatsResponse, TransportError> {
    match &self.connection {
      Connection::Local(docker) => {
        let mut stream = docker.stats(
          container,
          StatsOptionsBuilder::new().stream(false).build().into(),
        );
        match stream.next().await {
          Some(res) => res.map_err(|e| self.map_err(e)),
          None => Err(TransportError::Protocol(format!(
            "no stats returned for {container}"
          ))),
        }
      }
      _ => {
        self
          .raw_json(
            "GET",
            &format!(
              "/containers/{}/stats?stream=false",
              urlencoding::encode(container)
            ),
            None,
            DEFAULT_CALL_TIMEOUT,
          )
          .await
      }
    }
  }

  /// Recent log lines, stdout and stderr interleaved in arrival
  /// order. Multiplexed streams are demuxed, tty streams come back
  /// as is.
  pub async fn container_logs(
    &self,
    container: &str,
    tail: u64,
  ) -> Result<String, TransportError> {
    match &self.connection {
      Connection::Local(docker) => {
        let mut stream = docker.logs(
          container,
          LogsOptionsBuilder::new()
            .stdout(true)
            .stderr(true)
            .tail(&tail.to_string())
            .build()
            .into(),
        );
        let mut out = String::new();
        while let Some(chunk) = stream.next().await {
          let chunk = chunk.map_err(|e| self.map_err(e))?;
          out.push_str(&chunk.to_string());
        }
        Ok(out)
      }
      _ => {
        let res = self
          .raw(
            "GET",
            &format!(
              "/containers/{}/logs?stdout=true&stderr=true&tail={tail}",
              urlencoding::encode(container)
            ),
            None,
            STREAM_CALL_TIMEOUT,
            true,
          )
          .await?;
        Ok(demux_output(&res.body).combined())
      }
    }
  }
}
