use bollard::{
  models::{ImageInspect, ImageSummary},
  query_parameters::{
    CreateImageOptions, ListImagesOptions, RemoveImageOptions,
    TagImageOptions,
  },
};
use futures::StreamExt;

use super::STREAM_CALL_TIMEOUT;
use crate::{
  registry::split_image_reference,
  router::{
    Connection, DEFAULT_CALL_TIMEOUT, DaemonClient, TransportError,
  },
};

impl DaemonClient {
  pub async fn list_images(
    &self,
  ) -> Result<Vec<ImageSummary>, TransportError> {
    match &self.connection {
      Connection::Local(docker) => docker
        .list_images(Option::<ListImagesOptions>::None)
        .await
        .map_err(|e| self.map_err(e)),
      _ => {
        self
          .raw_json(
            "GET",
            "/images/json",
            None,
            DEFAULT_CALL_TIMEOUT,
          )
          .await
      }
    }
  }

  pub async fn inspect_image(
    &self,
    image: &str,
  ) -> Result<ImageInspect, TransportError> {
    match &self.connection {
      Connection::Local(docker) => docker
        .inspect_image(image)
        .await
        .map_err(|e| self.map_err(e)),
      _ => {
        self
          .raw_json(
            "GET",
            &format!(
              "/images/{}/json",
              urlencoding::encode(image)
            ),
            None,
            DEFAULT_CALL_TIMEOUT,
          )
          .await
      }
    }
  }

  /// Pull by reference. Tagged pulls move the tag to the new
  /// content; digest pins pull exactly that digest.
  pub async fn pull_image(
    &self,
    reference: &str,
  ) -> Result<(), TransportError> {
    let parsed = split_image_reference(reference);
    let (from_image, tag) = match &parsed.digest {
      Some(_) => (reference.to_string(), None),
      None => (parsed.repository_with_registry(), Some(parsed.tag)),
    };
    match &self.connection {
      Connection::Local(docker) => {
        let mut stream = docker.create_image(
          Some(CreateImageOptions {
            from_image: Some(from_image),
            tag,
            ..Default::default()
          }),
          None,
          None,
        );
        while let Some(info) = stream.next().await {
          info.map_err(|e| self.map_err(e))?;
        }
        Ok(())
      }
      _ => {
        let tag = tag
          .map(|tag| {
            format!("&tag={}", urlencoding::encode(&tag))
          })
          .unwrap_or_default();
        self
          .raw(
            "POST",
            &format!(
              "/images/create?fromImage={}{tag}",
              urlencoding::encode(&from_image)
            ),
            None,
            STREAM_CALL_TIMEOUT,
            true,
          )
          .await
          .map(|_| ())
      }
    }
  }

  pub async fn tag_image(
    &self,
    image: &str,
    repo: &str,
    tag: &str,
  ) -> Result<(), TransportError> {
    match &self.connection {
      Connection::Local(docker) => docker
        .tag_image(
          image,
          TagImageOptions {
            repo: Some(repo.to_string()),
            tag: Some(tag.to_string()),
          }
          .into(),
        )
        .await
        .map_err(|e| self.map_err(e)),
      _ => {
        self
          .raw_unit(
            "POST",
            &format!(
              "/images/{}/tag?repo={}&tag={}",
              urlencoding::encode(image),
              urlencoding::encode(repo),
              urlencoding::encode(tag)
            ),
            None,
          )
          .await
      }
    }
  }

  pub async fn remove_image(
    &self,
    image: &str,
    force: bool,
  ) -> Result<(), TransportError> {
    match &self.connection {
      Connection::Local(docker) => docker
        .remove_image(
          image,
          RemoveImageOptions {
            force,
            ..Default::default()
          }
          .into(),
          None,
        )
        .await
        .map(|_| ())
        .map_err(|e| self.map_err(e)),
      _ => {
        self
          .raw_unit(
            "DELETE",
            &format!(
              "/images/{}?force={force}",
              urlencoding::encode(image)
            ),
            None,
          )
          .await
      }
    }
  }
}
