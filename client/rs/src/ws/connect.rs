use anyhow::Context;
use futures_util::SinkExt;
use tokio::net::TcpStream;
use tokio_tungstenite::{
  MaybeTlsStream, WebSocketStream, connect_async,
  tungstenite::Message,
};

use super::EdgeMessage;

pub type AgentSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Dial the core's agent endpoint and send the hello frame.
/// The caller drives the socket from there (welcome, requests,
/// heartbeats).
pub async fn connect_agent(
  url: &str,
  hello: EdgeMessage,
) -> anyhow::Result<AgentSocket> {
  if !matches!(hello, EdgeMessage::Hello { .. }) {
    anyhow::bail!("first frame must be a hello");
  }
  let (mut socket, _) = connect_async(url)
    .await
    .with_context(|| format!("Failed to connect to core at {url}"))?;
  let hello = hello
    .to_json_string()
    .context("Failed to serialize hello frame")?;
  socket
    .send(Message::text(hello))
    .await
    .context("Failed to send hello frame")?;
  Ok(socket)
}
