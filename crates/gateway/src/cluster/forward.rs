//! Cross-node task forwarding over a short-lived WebSocket client
//! connection: authenticate, send the frame, wait for the response with
//! the matching id.

use std::time::Duration;

use aegis_domain::{Error, Result};
use aegis_protocol::{ClientFrame, FrameType};
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::Message;

/// Forward `frame` to the peer at `ws_url` and await the frame that
/// echoes its `id`. The whole exchange is bounded by `timeout`.
pub async fn forward_frame(
    ws_url: &str,
    internal_token: &str,
    frame: ClientFrame,
    timeout: Duration,
) -> Result<ClientFrame> {
    let exchange = do_forward(ws_url, internal_token, frame);
    match tokio::time::timeout(timeout, exchange).await {
        Ok(result) => result,
        Err(_) => Err(Error::Cluster(format!(
            "forward to {ws_url} timed out after {timeout:?}"
        ))),
    }
}

async fn do_forward(
    ws_url: &str,
    internal_token: &str,
    mut frame: ClientFrame,
) -> Result<ClientFrame> {
    let correlation_id = frame
        .id
        .get_or_insert_with(|| uuid::Uuid::new_v4().to_string())
        .clone();

    let (mut socket, _) = tokio_tungstenite::connect_async(ws_url)
        .await
        .map_err(|e| Error::Cluster(format!("connecting to {ws_url}: {e}")))?;

    // Authenticate before anything else; the greeting frame may or may
    // not arrive first depending on scheduling.
    let auth = ClientFrame::new(FrameType::Auth)
        .with_payload(serde_json::json!({ "token": internal_token }));
    send_frame(&mut socket, &auth).await?;

    loop {
        let frame = recv_frame(&mut socket).await?;
        match frame.frame_type {
            FrameType::AuthRequired => continue,
            FrameType::AuthSuccess => break,
            FrameType::AuthFailed => {
                return Err(Error::Cluster(format!("peer {ws_url} rejected auth")));
            }
            _ => continue,
        }
    }

    send_frame(&mut socket, &frame).await?;

    loop {
        let response = recv_frame(&mut socket).await?;
        if response.id.as_deref() == Some(correlation_id.as_str()) {
            let _ = socket.close(None).await;
            return Ok(response);
        }
        // Broadcasts and stream events for other ids pass through.
    }
}

async fn send_frame<S>(socket: &mut S, frame: &ClientFrame) -> Result<()>
where
    S: SinkExt<Message> + Unpin,
    S::Error: std::fmt::Display,
{
    let json = serde_json::to_string(frame)?;
    socket
        .send(Message::Text(json.into()))
        .await
        .map_err(|e| Error::Cluster(format!("forward send: {e}")))
}

async fn recv_frame<S>(socket: &mut S) -> Result<ClientFrame>
where
    S: StreamExt<Item = std::result::Result<Message, tokio_tungstenite::tungstenite::Error>>
        + Unpin,
{
    loop {
        match socket.next().await {
            Some(Ok(Message::Text(text))) => {
                match serde_json::from_str::<ClientFrame>(&text) {
                    Ok(frame) => return Ok(frame),
                    Err(e) => {
                        tracing::debug!(error = %e, "unparseable frame from peer");
                    }
                }
            }
            Some(Ok(Message::Close(_))) | None => {
                return Err(Error::Cluster("peer closed during forward".into()));
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => return Err(Error::Cluster(format!("forward recv: {e}"))),
        }
    }
}
