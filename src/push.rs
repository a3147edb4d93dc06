//! Push transport for [`Event`]s over WebSocket.
//!
//! [`Server`] accepts WebSocket connections and turns each one into a
//! [`NotificationHub`] subscriber: every broadcast event is sent as a text
//! frame holding the event name. Clients only listen; anything they send
//! besides pings and close frames is ignored.
//!
//! [`Listener`] is the client side. It keeps a connection open, reconnecting
//! with exponential backoff when the server goes away. The hub keeps no
//! history, so events broadcast while disconnected are missed; a consumer
//! catches up by re-reading the credential on [`Notice::Connected`].

use std::{net::SocketAddr, sync::Arc, time::Duration};

use futures_util::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use url::Url;

use crate::{
    error::{Error, Result},
    events::Event,
    hub::NotificationHub,
    util::with_jitter,
};

/// Serves hub events to WebSocket clients.
pub struct Server {
    listener: TcpListener,
    hub: Arc<NotificationHub>,
}

impl Server {
    /// Bound on the WebSocket handshake of a new connection.
    const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

    /// Bound on sending one frame; a client that does not read is dropped.
    const SEND_TIMEOUT: Duration = Duration::from_secs(5);

    /// Binds to `addr`.
    ///
    /// # Errors
    ///
    /// Returns error if the address cannot be bound, e.g. `AlreadyExists`
    /// when it is in use.
    pub async fn bind(addr: SocketAddr, hub: Arc<NotificationHub>) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { listener, hub })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.listener.local_addr().map_err(Into::into)
    }

    /// Accepts connections until the task is dropped.
    pub async fn run(self) {
        if let Ok(addr) = self.local_addr() {
            info!("push server listening on ws://{addr}");
        }

        loop {
            match self.listener.accept().await {
                Ok((stream, peer)) => {
                    let hub = Arc::clone(&self.hub);
                    tokio::spawn(async move {
                        if let Err(e) = serve(stream, peer, &hub).await {
                            debug!("push client {peer}: {e}");
                        }
                    });
                }
                Err(e) => {
                    // Typically out of file descriptors: back off a little.
                    error!("accepting push client failed: {e}");
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
            }
        }
    }
}

/// Relays hub events to one client until either side goes away.
async fn serve(stream: TcpStream, peer: SocketAddr, hub: &NotificationHub) -> Result<()> {
    let ws_stream = tokio::time::timeout(
        Server::HANDSHAKE_TIMEOUT,
        tokio_tungstenite::accept_async(stream),
    )
    .await??;
    let (mut ws_tx, mut ws_rx) = ws_stream.split();

    let mut subscription = hub.subscribe();
    let id = subscription.id();
    info!("push client {peer} connected as subscriber {id}");

    let result = loop {
        tokio::select! {
            event = subscription.recv() => {
                let Some(event) = event else {
                    break Ok(());
                };

                trace!("sending {event} to {peer}");
                let sent = tokio::time::timeout(
                    Server::SEND_TIMEOUT,
                    ws_tx.send(Message::text(event.to_string())),
                )
                .await;
                match sent {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => break Err(e.into()),
                    Err(e) => break Err(e.into()),
                }
            }
            message = ws_rx.next() => match message {
                Some(Ok(Message::Ping(payload))) => {
                    trace!("ping -> pong");
                    if let Err(e) = ws_tx.send(Message::Pong(payload)).await {
                        break Err(e.into());
                    }
                }
                Some(Ok(Message::Close(_))) | None => break Ok(()),
                Some(Ok(_)) => trace!("ignoring message from push client {peer}"),
                Some(Err(e)) => break Err(Error::from(e)),
            },
        }
    };

    hub.unsubscribe(id);
    info!("push client {peer} disconnected");
    result
}

/// What a [`Listener`] reports to its consumer.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum Notice {
    /// A connection was established; events may have been missed before it.
    Connected,
    Received(Event),
}

/// Receives events from a push server, reconnecting as needed.
#[derive(Clone, Debug)]
pub struct Listener {
    url: Url,
    min_backoff: Duration,
    max_backoff: Duration,
}

impl Listener {
    const MIN_BACKOFF: Duration = Duration::from_secs(1);
    const MAX_BACKOFF: Duration = Duration::from_secs(60);
    const JITTER: Duration = Duration::from_secs(1);

    #[must_use]
    pub fn new(url: Url) -> Self {
        Self {
            url,
            min_backoff: Self::MIN_BACKOFF,
            max_backoff: Self::MAX_BACKOFF,
        }
    }

    #[must_use]
    pub fn with_backoff(mut self, min: Duration, max: Duration) -> Self {
        self.min_backoff = min;
        self.max_backoff = max.max(min);
        self
    }

    /// Delivers notices to `on_notice` forever.
    ///
    /// Every successful connection resets the backoff.
    pub async fn run<F>(&self, mut on_notice: F)
    where
        F: FnMut(Notice) + Send,
    {
        let mut backoff = self.min_backoff;
        loop {
            match self.listen(&mut on_notice).await {
                Ok(()) => {
                    info!("push server closed the connection");
                    backoff = self.min_backoff;
                }
                Err((connected, e)) => {
                    if connected {
                        backoff = self.min_backoff;
                    }
                    warn!("push connection to {} failed: {e}", self.url);
                }
            }

            let delay = with_jitter(backoff, Self::JITTER);
            debug!("reconnecting in {}ms", delay.as_millis());
            tokio::time::sleep(delay).await;
            backoff = (backoff * 2).min(self.max_backoff);
        }
    }

    /// Runs one connection until it closes.
    ///
    /// On failure, also tells whether the connection was established first.
    async fn listen<F>(&self, on_notice: &mut F) -> std::result::Result<(), (bool, Error)>
    where
        F: FnMut(Notice) + Send,
    {
        let (ws_stream, _) = tokio_tungstenite::connect_async(self.url.as_str())
            .await
            .map_err(|e| (false, Error::from(e)))?;
        info!("connected to push server {}", self.url);
        on_notice(Notice::Connected);

        let (mut ws_tx, mut ws_rx) = ws_stream.split();
        while let Some(message) = ws_rx.next().await {
            match message.map_err(|e| (true, Error::from(e)))? {
                Message::Text(text) => match text.as_str().parse::<Event>() {
                    Ok(event) => {
                        debug!("received {event}");
                        on_notice(Notice::Received(event));
                    }
                    Err(e) => warn!("ignoring push message: {e}"),
                },
                Message::Ping(payload) => {
                    ws_tx
                        .send(Message::Pong(payload))
                        .await
                        .map_err(|e| (true, Error::from(e)))?;
                }
                Message::Close(_) => break,
                _ => trace!("message type unimplemented"),
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use tokio::sync::mpsc;

    use super::*;

    async fn server() -> (SocketAddr, Arc<NotificationHub>) {
        let hub = Arc::new(NotificationHub::new());
        let server = Server::bind(SocketAddr::from(([127, 0, 0, 1], 0)), Arc::clone(&hub))
            .await
            .unwrap();
        let addr = server.local_addr().unwrap();
        tokio::spawn(server.run());
        (addr, hub)
    }

    async fn wait_for_subscribers(hub: &NotificationHub, count: usize) {
        while hub.subscriber_count() != count {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn connected_client_receives_renewed() {
        let (addr, hub) = server().await;
        let (mut ws_stream, _) = tokio_tungstenite::connect_async(format!("ws://{addr}"))
            .await
            .unwrap();
        wait_for_subscribers(&hub, 1).await;

        assert_eq!(hub.broadcast(Event::Renewed), 1);
        let message = ws_stream.next().await.unwrap().unwrap();
        assert_eq!(message, Message::text("renewed"));

        ws_stream.close(None).await.unwrap();
        wait_for_subscribers(&hub, 0).await;
    }

    #[tokio::test]
    async fn listener_delivers_events() {
        let (addr, hub) = server().await;
        let url = Url::parse(&format!("ws://{addr}")).unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let listener = Listener::new(url).with_backoff(Duration::from_millis(10), Duration::from_millis(50));
        tokio::spawn(async move {
            listener
                .run(move |notice| {
                    let _ = tx.send(notice);
                })
                .await;
        });

        assert_eq!(rx.recv().await, Some(Notice::Connected));
        wait_for_subscribers(&hub, 1).await;
        hub.broadcast(Event::Renewed);
        assert_eq!(rx.recv().await, Some(Notice::Received(Event::Renewed)));
    }

    #[tokio::test]
    async fn listener_retries_until_server_appears() {
        // Reserve a port, then release it so the first attempts are refused.
        let addr = {
            let reserved = TcpListener::bind("127.0.0.1:0").await.unwrap();
            reserved.local_addr().unwrap()
        };
        let url = Url::parse(&format!("ws://{addr}")).unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();

        let listener = Listener::new(url).with_backoff(Duration::from_millis(10), Duration::from_millis(20));
        tokio::spawn(async move {
            listener
                .run(move |notice| {
                    let _ = tx.send(notice);
                })
                .await;
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let hub = Arc::new(NotificationHub::new());
        let server = Server::bind(addr, Arc::clone(&hub)).await.unwrap();
        tokio::spawn(server.run());

        // Reconnected: told so before any event.
        assert_eq!(rx.recv().await, Some(Notice::Connected));
        wait_for_subscribers(&hub, 1).await;
        hub.broadcast(Event::Renewed);
        assert_eq!(rx.recv().await, Some(Notice::Received(Event::Renewed)));
    }
}
