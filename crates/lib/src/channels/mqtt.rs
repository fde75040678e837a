//! MQTT channel: one broker session (TLS unless the address says otherwise), QoS 1 subscriptions,
//! and an event loop task that forwards publishes and reconnects on a fixed interval.

use crate::channels::handle::{Channel, ChannelError};
use crate::channels::inbound::InboundMessage;
use crate::config::{self, BrokerConfig, BrokerScheme};
use async_trait::async_trait;
use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS,
    SubscribeReasonCode, Transport,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Capacity of the request queue between `AsyncClient` and the event loop.
const REQUEST_CAPACITY: usize = 16;

/// MQTT connector. `connect` and `subscribe` drive the event loop inline until the broker
/// acknowledges; after that the loop runs on its own task until `disconnect`.
pub struct MqttChannel {
    id: String,
    client: AsyncClient,
    eventloop: Mutex<Option<EventLoop>>,
    /// Subscriptions restored after a reconnect without a resumed session.
    topics: Arc<StdMutex<Vec<String>>>,
    running: Arc<AtomicBool>,
    reconnect_interval: Duration,
    task: Mutex<Option<JoinHandle<()>>>,
    unsubscribed: Arc<Notify>,
}

impl MqttChannel {
    pub fn new(
        broker: &BrokerConfig,
        credentials: Option<(String, String)>,
    ) -> Result<Self, ChannelError> {
        let addr =
            config::parse_broker_address(&broker.address).map_err(ChannelError::InvalidAddress)?;
        let mut opts = MqttOptions::new(broker.client_id.clone(), addr.host, addr.port);
        opts.set_keep_alive(broker.keep_alive());
        opts.set_clean_session(true);
        if let Some((username, password)) = credentials {
            opts.set_credentials(username, password);
        }
        match addr.scheme {
            BrokerScheme::Tls => {
                opts.set_transport(Transport::tls_with_default_config());
            }
            BrokerScheme::Plain => {
                log::warn!(
                    "mqtt: broker address {} is not TLS; credentials and payloads travel in clear text",
                    broker.address
                );
            }
        }
        let (client, eventloop) = AsyncClient::new(opts, REQUEST_CAPACITY);
        Ok(Self {
            id: "mqtt".to_string(),
            client,
            eventloop: Mutex::new(Some(eventloop)),
            topics: Arc::new(StdMutex::new(Vec::new())),
            running: Arc::new(AtomicBool::new(false)),
            reconnect_interval: broker.reconnect_interval(),
            task: Mutex::new(None),
            unsubscribed: Arc::new(Notify::new()),
        })
    }

    fn remember_topic(&self, topic: &str) {
        let mut g = self.topics.lock().unwrap_or_else(|e| e.into_inner());
        if !g.iter().any(|t| t == topic) {
            g.push(topic.to_string());
        }
    }

    fn forget_topic(&self, topic: &str) {
        let mut g = self.topics.lock().unwrap_or_else(|e| e.into_inner());
        g.retain(|t| t != topic);
    }
}

#[async_trait]
impl Channel for MqttChannel {
    fn id(&self) -> &str {
        &self.id
    }

    async fn connect(&self) -> Result<(), ChannelError> {
        let mut guard = self.eventloop.lock().await;
        let eventloop = guard
            .as_mut()
            .ok_or_else(|| ChannelError::Connect("event loop already running".to_string()))?;
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                    if ack.code != ConnectReturnCode::Success {
                        return Err(ChannelError::Connect(format!(
                            "broker refused connection: {:?}",
                            ack.code
                        )));
                    }
                    self.running.store(true, Ordering::SeqCst);
                    log::info!("mqtt channel: connected to broker");
                    return Ok(());
                }
                Ok(_) => continue,
                Err(e) => return Err(ChannelError::Connect(e.to_string())),
            }
        }
    }

    async fn subscribe(
        &self,
        topic: &str,
        inbound_tx: mpsc::Sender<InboundMessage>,
    ) -> Result<(), ChannelError> {
        let mut guard = self.eventloop.lock().await;
        let eventloop = guard.as_mut().ok_or_else(|| {
            ChannelError::Subscribe("channel already has an active subscription".to_string())
        })?;
        self.client
            .subscribe(topic, QoS::AtLeastOnce)
            .await
            .map_err(|e| ChannelError::Subscribe(e.to_string()))?;
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::SubAck(ack))) => {
                    if ack
                        .return_codes
                        .iter()
                        .any(|c| matches!(c, SubscribeReasonCode::Failure))
                    {
                        return Err(ChannelError::Subscribe(format!(
                            "broker rejected subscription to {}",
                            topic
                        )));
                    }
                    break;
                }
                Ok(Event::Incoming(Packet::Publish(p))) => {
                    forward(&inbound_tx, &p);
                }
                Ok(_) => continue,
                Err(e) => return Err(ChannelError::Subscribe(e.to_string())),
            }
        }
        self.remember_topic(topic);
        log::info!("mqtt channel: subscribed to {}", topic);

        let Some(eventloop) = guard.take() else {
            return Err(ChannelError::Subscribe("event loop missing".to_string()));
        };
        let handle = tokio::spawn(run_event_loop(
            eventloop,
            self.client.clone(),
            inbound_tx,
            self.topics.clone(),
            self.running.clone(),
            self.reconnect_interval,
            self.unsubscribed.clone(),
        ));
        *self.task.lock().await = Some(handle);
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str, wait: Duration) -> Result<(), ChannelError> {
        self.forget_topic(topic);
        let acked = self.unsubscribed.notified();
        self.client
            .unsubscribe(topic)
            .await
            .map_err(|e| ChannelError::Unsubscribe(e.to_string()))?;
        tokio::time::timeout(wait, acked).await.map_err(|_| {
            ChannelError::Unsubscribe(format!("no acknowledgment within {:?}", wait))
        })
    }

    async fn disconnect(&self, grace: Duration) -> Result<(), ChannelError> {
        self.running.store(false, Ordering::SeqCst);
        let deadline = Instant::now() + grace;
        let sent = match tokio::time::timeout_at(deadline, self.client.disconnect()).await {
            Ok(r) => r.map_err(|e| ChannelError::Disconnect(e.to_string())),
            Err(_) => Err(ChannelError::Disconnect(
                "disconnect request not accepted in time".to_string(),
            )),
        };
        let Some(mut task) = self.task.lock().await.take() else {
            return sent;
        };
        if tokio::time::timeout_at(deadline, &mut task).await.is_err() {
            task.abort();
            return Err(ChannelError::Disconnect(format!(
                "no orderly close within {:?}",
                grace
            )));
        }
        sent
    }
}

async fn run_event_loop(
    mut eventloop: EventLoop,
    client: AsyncClient,
    inbound_tx: mpsc::Sender<InboundMessage>,
    topics: Arc<StdMutex<Vec<String>>>,
    running: Arc<AtomicBool>,
    reconnect_interval: Duration,
    unsubscribed: Arc<Notify>,
) {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::Publish(p))) => {
                if !forward(&inbound_tx, &p) {
                    log::debug!("mqtt: inbound channel closed, stopping loop");
                    break;
                }
            }
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                log::info!("mqtt channel: reconnected to broker");
                if !ack.session_present {
                    resubscribe(&client, &topics);
                }
            }
            Ok(Event::Incoming(Packet::SubAck(ack))) => {
                log::debug!("mqtt: suback {:?}", ack.return_codes);
            }
            Ok(Event::Incoming(Packet::UnsubAck(_))) => {
                log::debug!("mqtt: unsubscribe acknowledged");
                unsubscribed.notify_one();
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                log::debug!("mqtt: disconnect sent");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                if !running.load(Ordering::SeqCst) {
                    break;
                }
                log::warn!(
                    "mqtt: connection lost: {}; retrying in {:?}",
                    e,
                    reconnect_interval
                );
                tokio::time::sleep(reconnect_interval).await;
            }
        }
    }
    log::info!("mqtt channel: event loop stopped");
}

/// Hand a publish to the dispatcher without waiting, so `poll` keeps running (pings, acks, reconnects).
/// A full queue drops the message. Returns false once the receiver is gone.
fn forward(inbound_tx: &mpsc::Sender<InboundMessage>, p: &rumqttc::Publish) -> bool {
    let inbound = InboundMessage {
        topic: p.topic.clone(),
        payload: p.payload.to_vec(),
    };
    match inbound_tx.try_send(inbound) {
        Ok(()) => true,
        Err(TrySendError::Full(m)) => {
            log::warn!(
                "mqtt: inbound queue full, dropping message on topic {}",
                m.topic
            );
            true
        }
        Err(TrySendError::Closed(_)) => false,
    }
}

/// Re-issue held subscriptions. Uses the non-blocking client call since this runs on the event loop task.
fn resubscribe(client: &AsyncClient, topics: &StdMutex<Vec<String>>) {
    let topics = topics.lock().unwrap_or_else(|e| e.into_inner()).clone();
    for topic in topics {
        match client.try_subscribe(topic.clone(), QoS::AtLeastOnce) {
            Ok(()) => log::info!("mqtt channel: re-subscribed to {}", topic),
            Err(e) => log::warn!("mqtt: re-subscribe to {} failed: {}", topic, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn broker(address: &str) -> BrokerConfig {
        BrokerConfig {
            address: address.to_string(),
            ..BrokerConfig::default()
        }
    }

    #[test]
    fn rejects_unsupported_address() {
        let err = MqttChannel::new(&broker("http://broker:80"), None).err();
        assert!(matches!(err, Some(ChannelError::InvalidAddress(_))));
    }

    #[tokio::test]
    async fn builds_with_credentials() {
        let ch = MqttChannel::new(
            &broker("mqtt://127.0.0.1:1883"),
            Some(("user".to_string(), "pw".to_string())),
        )
        .unwrap();
        assert_eq!(ch.id(), "mqtt");
    }

    #[tokio::test]
    async fn connect_to_closed_port_fails() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let ch = MqttChannel::new(&broker(&format!("mqtt://127.0.0.1:{}", port)), None).unwrap();
        let err = ch.connect().await.unwrap_err();
        assert!(matches!(err, ChannelError::Connect(_)), "{:?}", err);
    }

    #[tokio::test]
    async fn topics_are_remembered_once_and_forgotten() {
        let ch = MqttChannel::new(&broker("mqtt://127.0.0.1:1883"), None).unwrap();
        ch.remember_topic("a/b");
        ch.remember_topic("a/b");
        assert_eq!(ch.topics.lock().unwrap().len(), 1);
        ch.forget_topic("a/b");
        assert!(ch.topics.lock().unwrap().is_empty());
    }
}
