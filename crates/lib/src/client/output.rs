//! Build output streaming.
//!
//! Frames are read by a spawned task and handed to the caller over a channel.
//! The caller's side writes them to the sink while watching the cancellation
//! token. On cancellation the service is asked to cancel the build, the socket
//! is closed and the reader task is joined before returning.

use std::io::Write;

use futures_util::{SinkExt, Stream, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::error::TlsError;
use tokio_tungstenite::tungstenite::http::{self, HeaderValue};
use tokio_tungstenite::tungstenite::http::header::{AUTHORIZATION, USER_AGENT};
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{Connector, connect_async_tls_with_config};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use url::Url;

use super::{BuildClient, ClientError};
use crate::consts::CLEANUP_TIMEOUT;

const OUTPUT_BUFFER: usize = 64;

fn ws_error(e: impl Into<WsError>) -> ClientError {
  ClientError::WebSocket(Box::new(e.into()))
}

impl BuildClient {
  /// Websocket URL of a build's output stream, `ws` or `wss` to match the base URL.
  pub fn output_url(&self, build_id: &str) -> Result<Url, ClientError> {
    let mut url = self.endpoint(&format!("v1/build-ws/{}", build_id))?;
    let scheme = if self.base_url().scheme() == "https" { "wss" } else { "ws" };
    url
      .set_scheme(scheme)
      .map_err(|_| ClientError::UnsupportedScheme(scheme.to_string()))?;
    Ok(url)
  }

  /// Copy a build's text output into `sink` until the service closes the
  /// stream normally.
  ///
  /// Binary frames are ignored. Any other closure is an error. When `cancel`
  /// fires, a cancel request is sent with its own timeout and
  /// [`ClientError::Cancelled`] is returned once the reader has stopped.
  pub async fn output<W: Write + Send + ?Sized>(
    &self,
    build_id: &str,
    sink: &mut W,
    cancel: &CancellationToken,
  ) -> Result<(), ClientError> {
    let url = self.output_url(build_id)?;
    debug!(url = %url, "opening build output stream");

    let mut request = url.as_str().into_client_request().map_err(ws_error)?;
    if let Some(token) = self.bearer_token() {
      let value = HeaderValue::from_str(&format!("Bearer {}", token)).map_err(|e| ws_error(http::Error::from(e)))?;
      request.headers_mut().insert(AUTHORIZATION, value);
    }
    if let Some(ua) = self.user_agent() {
      let value = HeaderValue::from_str(ua).map_err(|e| ws_error(http::Error::from(e)))?;
      request.headers_mut().insert(USER_AGENT, value);
    }

    let connector = if self.skip_tls_verify {
      let tls = native_tls::TlsConnector::builder()
        .danger_accept_invalid_certs(true)
        .build()
        .map_err(|e| ws_error(TlsError::from(e)))?;
      Some(Connector::NativeTls(tls))
    } else {
      None
    };

    let (ws, _) = tokio::select! {
      res = connect_async_tls_with_config(request, None, false, connector) => res.map_err(ws_error)?,
      _ = cancel.cancelled() => {
        self.cancel_after_interrupt(build_id).await;
        return Err(ClientError::Cancelled);
      }
    };

    let (mut write, read) = ws.split();
    let (tx, mut rx) = mpsc::channel::<String>(OUTPUT_BUFFER);
    let reader = tokio::spawn(read_frames(read, tx));

    let outcome = loop {
      tokio::select! {
        biased;
        _ = cancel.cancelled() => {
          self.cancel_after_interrupt(build_id).await;
          if tokio::time::timeout(CLEANUP_TIMEOUT, write.close()).await.is_err() {
            warn!(build_id, "timed out closing build output stream");
          }
          break Err(ClientError::Cancelled);
        }
        text = rx.recv() => match text {
          Some(text) => {
            if let Err(e) = sink.write_all(text.as_bytes()).and_then(|_| sink.flush()) {
              break Err(ClientError::Io(e));
            }
          }
          None => break Ok(()),
        },
      }
    };

    match outcome {
      Ok(()) => reader.await?,
      Err(e) => {
        reader.abort();
        let _ = reader.await;
        Err(e)
      }
    }
  }

  async fn cancel_after_interrupt(&self, build_id: &str) {
    match tokio::time::timeout(CLEANUP_TIMEOUT, self.cancel(build_id)).await {
      Ok(Ok(())) => info!(build_id, "remote build cancelled"),
      Ok(Err(e)) => warn!(build_id, error = %e, "build cancellation request failed"),
      Err(_) => warn!(build_id, "build cancellation request timed out"),
    }
  }
}

async fn read_frames<S>(mut read: S, tx: mpsc::Sender<String>) -> Result<(), ClientError>
where
  S: Stream<Item = Result<Message, WsError>> + Unpin,
{
  while let Some(msg) = read.next().await {
    match msg.map_err(ws_error)? {
      Message::Text(text) => {
        if tx.send(text).await.is_err() {
          return Ok(());
        }
      }
      Message::Close(Some(frame)) if frame.code == CloseCode::Normal => return Ok(()),
      Message::Close(frame) => return Err(abnormal_close(frame)),
      // Binary, ping, pong and raw frames carry no log output.
      _ => {}
    }
  }

  Err(ClientError::StreamClosed {
    code: u16::from(CloseCode::Abnormal),
    reason: "connection closed without a close frame".to_string(),
  })
}

fn abnormal_close(frame: Option<CloseFrame<'static>>) -> ClientError {
  match frame {
    Some(frame) => ClientError::StreamClosed {
      code: u16::from(frame.code),
      reason: frame.reason.into_owned(),
    },
    None => ClientError::StreamClosed {
      code: u16::from(CloseCode::Status),
      reason: "no status received".to_string(),
    },
  }
}
