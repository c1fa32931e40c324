//! Relay transport backed by a [`super::RelayBroker`].
//!
//! A supervisor task owns the WebSocket. It reconnects with exponential
//! backoff and re-subscribes every channel that still has local
//! subscribers, so a broker restart only loses the updates published while
//! it was down. Publishing while disconnected fails fast with
//! [`RelayError::Disconnected`].

use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

use super::broker::BusFrame;
use super::{ChannelTable, RelayError, RelayTransport};

const INITIAL_BACKOFF: Duration = Duration::from_millis(100);
const MAX_BACKOFF: Duration = Duration::from_secs(5);

type Outbound = Arc<Mutex<Option<mpsc::UnboundedSender<Vec<u8>>>>>;

pub struct RemoteBus {
    url: String,
    table: Arc<ChannelTable>,
    /// Present while the broker connection is up
    outbound: Outbound,
    supervisor: JoinHandle<()>,
}

impl RemoteBus {
    /// Start connecting to the broker at `url`. Returns immediately; the
    /// connection is established in the background.
    pub fn connect(url: impl Into<String>) -> Self {
        let url = url.into();
        let table = Arc::new(ChannelTable::default());
        let outbound: Outbound = Arc::new(Mutex::new(None));

        let supervisor = tokio::spawn(Self::supervise(
            url.clone(),
            table.clone(),
            outbound.clone(),
        ));

        Self {
            url,
            table,
            outbound,
            supervisor,
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn is_connected(&self) -> bool {
        self.outbound.lock().is_some()
    }

    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.table.subscriber_count(channel)
    }

    async fn supervise(url: String, table: Arc<ChannelTable>, outbound: Outbound) {
        let mut backoff = INITIAL_BACKOFF;

        loop {
            match tokio_tungstenite::connect_async(&url).await {
                Ok((ws_stream, _)) => {
                    backoff = INITIAL_BACKOFF;
                    let (mut ws_sender, mut ws_receiver) = ws_stream.split();
                    let (tx, mut rx) = mpsc::unbounded_channel::<Vec<u8>>();

                    {
                        let mut guard = outbound.lock();
                        for channel in table.names() {
                            match (BusFrame::Subscribe { channel }).encode() {
                                Ok(bytes) => {
                                    let _ = tx.send(bytes);
                                }
                                Err(e) => log::warn!("Failed to encode resubscription: {e}"),
                            }
                        }
                        *guard = Some(tx);
                    }
                    log::info!("Connected to relay broker {url}");

                    loop {
                        tokio::select! {
                            frame = rx.recv() => match frame {
                                Some(bytes) => {
                                    if ws_sender.send(Message::Binary(bytes.into())).await.is_err() {
                                        break;
                                    }
                                }
                                None => break,
                            },
                            msg = ws_receiver.next() => match msg {
                                Some(Ok(Message::Binary(data))) => match BusFrame::decode(&data) {
                                    Ok(BusFrame::Publish { channel, payload }) => {
                                        table.deliver(&channel, Arc::new(payload));
                                    }
                                    Ok(other) => log::debug!("Ignoring broker frame {other:?}"),
                                    Err(e) => log::warn!("Dropping malformed broker frame: {e}"),
                                },
                                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                                Some(Ok(_)) => {}
                            },
                        }
                    }

                    *outbound.lock() = None;
                    log::warn!("Lost connection to relay broker {url}");
                }
                Err(e) => log::warn!("Relay broker {url} unreachable: {e}"),
            }

            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(MAX_BACKOFF);
        }
    }

    fn send(outbound: &Option<mpsc::UnboundedSender<Vec<u8>>>, frame: &BusFrame) -> Result<(), RelayError> {
        let tx = outbound.as_ref().ok_or(RelayError::Disconnected)?;
        tx.send(frame.encode()?)
            .map_err(|_| RelayError::Disconnected)
    }
}

impl RelayTransport for RemoteBus {
    fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<(), RelayError> {
        let frame = BusFrame::Publish {
            channel: channel.to_string(),
            payload,
        };
        Self::send(&self.outbound.lock(), &frame)
    }

    fn subscribe(&self, channel: &str) -> Result<broadcast::Receiver<Arc<Vec<u8>>>, RelayError> {
        // Held across the table update so a concurrent reconnect cannot
        // miss the new channel
        let outbound = self.outbound.lock();
        let (rx, first) = self.table.subscribe(channel);
        if first && outbound.is_some() {
            let frame = BusFrame::Subscribe {
                channel: channel.to_string(),
            };
            if let Err(e) = Self::send(&outbound, &frame) {
                log::warn!("Broker subscription for {channel} deferred: {e}");
            }
        }
        Ok(rx)
    }

    fn unsubscribe(&self, channel: &str) {
        let outbound = self.outbound.lock();
        if self.table.release(channel) && outbound.is_some() {
            let frame = BusFrame::Unsubscribe {
                channel: channel.to_string(),
            };
            if let Err(e) = Self::send(&outbound, &frame) {
                log::debug!("Broker unsubscribe for {channel} not sent: {e}");
            }
        }
    }
}

impl Drop for RemoteBus {
    fn drop(&mut self) {
        self.supervisor.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::relay::RelayBroker;
    use tokio::time::timeout;

    async fn start_broker() -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let broker = RelayBroker::new(addr.to_string());
            let _ = broker.serve(listener).await;
        });
        format!("ws://{addr}")
    }

    async fn wait_connected(bus: &RemoteBus) {
        for _ in 0..100 {
            if bus.is_connected() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("bus never connected to {}", bus.url());
    }

    #[tokio::test]
    async fn test_publish_reaches_other_instance() {
        let url = start_broker().await;
        let a = RemoteBus::connect(url.clone());
        let b = RemoteBus::connect(url);
        wait_connected(&a).await;
        wait_connected(&b).await;

        let mut rx = b.subscribe("yjs:updates:mindmap-m1").unwrap();
        // Let the subscription reach the broker
        tokio::time::sleep(Duration::from_millis(100)).await;

        a.publish("yjs:updates:mindmap-m1", vec![1, 2, 3]).unwrap();
        let payload = timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("timed out")
            .unwrap();
        assert_eq!(*payload, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn test_publish_while_disconnected_fails() {
        // Nothing listens on this port
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        drop(listener);

        let bus = RemoteBus::connect(url);
        assert!(matches!(
            bus.publish("c", vec![1]),
            Err(RelayError::Disconnected)
        ));

        // Subscriptions are still tracked locally
        let _rx = bus.subscribe("c").unwrap();
        assert_eq!(bus.subscriber_count("c"), 1);
        bus.unsubscribe("c");
        assert_eq!(bus.subscriber_count("c"), 0);
    }
}
