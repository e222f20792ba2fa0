use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use url::Url;

use super::{ChannelEvent, LocalIdentity, SignalChannel};
use crate::envelope::{self, Envelope};
use crate::error::TransportError;

const TARGET: &str = "huddle::signaling";

/// Relay connection that keeps itself alive: on every (re)open it announces
/// the local identity with `join`, and after a drop it retries forever at
/// a fixed delay.
pub struct WebSocketChannel {
    outbound: mpsc::UnboundedSender<String>,
    open: Arc<AtomicBool>,
    supervisor: JoinHandle<()>,
}

impl WebSocketChannel {
    pub fn connect(
        url: &str,
        identity: LocalIdentity,
        retry_delay: Duration,
    ) -> Result<(Arc<Self>, mpsc::UnboundedReceiver<ChannelEvent>), TransportError> {
        let url = parse_relay_url(url)?;
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let open = Arc::new(AtomicBool::new(false));

        let supervisor = tokio::spawn(supervise(
            url,
            identity,
            retry_delay,
            Arc::clone(&open),
            outbound_rx,
            events_tx,
        ));

        Ok((
            Arc::new(Self {
                outbound,
                open,
                supervisor,
            }),
            events_rx,
        ))
    }
}

impl SignalChannel for WebSocketChannel {
    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    fn send(&self, envelope: &Envelope) -> Result<(), TransportError> {
        if !self.is_open() {
            return Err(TransportError::NotOpen);
        }
        let text = envelope::encode(envelope)?;
        self.outbound
            .send(text)
            .map_err(|_| TransportError::ChannelClosed)
    }
}

impl Drop for WebSocketChannel {
    fn drop(&mut self) {
        self.supervisor.abort();
    }
}

fn parse_relay_url(raw: &str) -> Result<Url, TransportError> {
    let url = Url::parse(raw)
        .map_err(|err| TransportError::Setup(format!("invalid relay url {raw}: {err}")))?;
    match url.scheme() {
        "ws" | "wss" => Ok(url),
        other => Err(TransportError::Setup(format!(
            "relay url must use ws or wss, got {other}"
        ))),
    }
}

enum LinkEnd {
    /// The socket dropped; retry.
    Dropped,
    /// The owning channel or the event consumer is gone.
    Stopped,
}

async fn supervise(
    url: Url,
    identity: LocalIdentity,
    retry_delay: Duration,
    open: Arc<AtomicBool>,
    mut outbound: mpsc::UnboundedReceiver<String>,
    events: mpsc::UnboundedSender<ChannelEvent>,
) {
    loop {
        match connect_async(url.as_str()).await {
            Ok((stream, _)) => {
                tracing::info!(target = TARGET, url = %url, "relay connected");
                let end = run_link(stream, &identity, &open, &mut outbound, &events).await;
                open.store(false, Ordering::SeqCst);
                while outbound.try_recv().is_ok() {}
                if matches!(end, LinkEnd::Stopped) || events.send(ChannelEvent::Closed).is_err() {
                    return;
                }
                tracing::warn!(target = TARGET, url = %url, "relay connection lost");
            }
            Err(err) => {
                tracing::warn!(target = TARGET, url = %url, error = %err, "relay connect failed");
            }
        }
        if events.is_closed() {
            return;
        }
        tokio::time::sleep(retry_delay).await;
    }
}

async fn run_link<S>(
    stream: S,
    identity: &LocalIdentity,
    open: &AtomicBool,
    outbound: &mut mpsc::UnboundedReceiver<String>,
    events: &mpsc::UnboundedSender<ChannelEvent>,
) -> LinkEnd
where
    S: futures_util::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>>
        + futures_util::Sink<Message, Error = tokio_tungstenite::tungstenite::Error>
        + Unpin,
{
    let (mut write, mut read) = stream.split();

    let join = match envelope::encode(&identity.join_envelope()) {
        Ok(text) => text,
        Err(err) => {
            tracing::error!(target = TARGET, error = %err, "failed to encode join");
            return LinkEnd::Stopped;
        }
    };
    if write.send(Message::Text(join)).await.is_err() {
        return LinkEnd::Dropped;
    }
    open.store(true, Ordering::SeqCst);
    if events.send(ChannelEvent::Opened).is_err() {
        return LinkEnd::Stopped;
    }

    loop {
        tokio::select! {
            text = outbound.recv() => {
                let Some(text) = text else {
                    let _ = write.send(Message::Close(None)).await;
                    return LinkEnd::Stopped;
                };
                if let Err(err) = write.send(Message::Text(text)).await {
                    tracing::warn!(target = TARGET, error = %err, "relay write failed");
                    return LinkEnd::Dropped;
                }
            }
            frame = read.next() => {
                let text = match frame {
                    Some(Ok(Message::Text(text))) => text,
                    Some(Ok(Message::Binary(data))) => match String::from_utf8(data) {
                        Ok(text) => text,
                        Err(_) => {
                            tracing::debug!(target = TARGET, "dropping non-utf8 binary frame");
                            continue;
                        }
                    },
                    Some(Ok(Message::Close(_))) | None => return LinkEnd::Dropped,
                    Some(Ok(_)) => continue,
                    Some(Err(err)) => {
                        tracing::warn!(target = TARGET, error = %err, "relay read failed");
                        return LinkEnd::Dropped;
                    }
                };
                match envelope::decode(&text) {
                    Ok(Some(envelope)) => {
                        if events.send(ChannelEvent::Envelope(envelope)).is_err() {
                            return LinkEnd::Stopped;
                        }
                    }
                    Ok(None) => {}
                    Err(err) => {
                        tracing::warn!(target = TARGET, error = %err, "dropping malformed envelope");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relay_url_must_be_websocket() {
        assert!(parse_relay_url("ws://localhost:8000/ws/chat/global/").is_ok());
        assert!(parse_relay_url("wss://relay.example/ws/chat/global/").is_ok());
        assert!(matches!(
            parse_relay_url("http://localhost:8000"),
            Err(TransportError::Setup(_))
        ));
        assert!(matches!(
            parse_relay_url("not a url"),
            Err(TransportError::Setup(_))
        ));
    }
}
