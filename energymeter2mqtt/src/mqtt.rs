use bytes::Bytes;
use rumqttc::{
    AsyncClient, ClientError, Event, EventLoop, Incoming, LastWill, MqttOptions, Outgoing,
    Publish, QoS,
};
use std::time::Duration;
use tokio::{
    select,
    sync::mpsc::{channel, Receiver, Sender},
};
use tracing::{debug, info, trace, warn};

use crate::homeassistant::OFFLINE;
use crate::settings::MqttSettings;
use crate::Error;

const RECONNECT_DELAY: Duration = Duration::from_secs(1);
const DISCONNECT_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug)]
pub enum Message {
    Publish(Publish),
    Shutdown,
}

/// Build the client options: a randomised client id so that two instances never kick each other off the broker, and
/// a retained last will marking the device unavailable.
pub fn options(settings: &MqttSettings, availability_topic: &str) -> MqttOptions {
    let client_id = format!("{}-{:08x}", settings.main_uid, rand::random::<u32>());
    let mut options = MqttOptions::new(client_id, settings.host.as_str(), settings.port);

    if let (Some(u), Some(p)) = (&settings.user_name, &settings.password) {
        options.set_credentials(u, p);
    }
    options.set_keep_alive(settings.keep_alive.max(Duration::from_secs(1)));
    options.set_last_will(LastWill::new(
        availability_topic,
        OFFLINE,
        QoS::AtLeastOnce,
        true,
    ));

    options
}

pub(crate) fn new(options: MqttOptions) -> (Connection, Handle) {
    let (client, event_loop) = AsyncClient::new(options, 64);

    let (tx, rx) = channel(32);
    (
        Connection {
            client,
            event_loop,
            rx,
        },
        Handle { tx },
    )
}

/// Owns the broker connection. Runs until a `Message::Shutdown` arrives or every `Handle` is dropped, then
/// disconnects cleanly so queued publishes (such as the final availability state) reach the broker.
pub(crate) struct Connection {
    rx: Receiver<Message>,
    client: AsyncClient,
    event_loop: EventLoop,
}

impl Connection {
    pub async fn run(mut self) -> crate::Result<()> {
        info!("Connecting to MQTT broker...");

        loop {
            select! {
                event = self.event_loop.poll() => {
                    match event {
                        Ok(event) => self.handle_event(event),
                        Err(error) => {
                            // The event loop reconnects on the next poll.
                            warn!(%error, "MQTT connection error");
                            tokio::time::sleep(RECONNECT_DELAY).await;
                        }
                    }
                }
                request = self.rx.recv() => {
                    match request {
                        None | Some(Message::Shutdown) => break,
                        Some(Message::Publish(publish)) => self.handle_publish(publish)?,
                    }
                }
            }
        }

        self.disconnect().await;
        Ok(())
    }

    fn handle_event(&mut self, event: Event) {
        match event {
            Event::Incoming(Incoming::ConnAck(_)) => info!("Connected to MQTT broker"),
            Event::Incoming(Incoming::Disconnect) => warn!("Disconnected by MQTT broker"),
            e => trace!(event = ?e),
        }
    }

    fn handle_publish(&mut self, publish: Publish) -> crate::Result<()> {
        let Publish {
            topic,
            payload,
            qos,
            retain,
            ..
        } = publish;
        debug!(%topic, ?payload, retain, "publish");

        // Never wait on the request queue here: the event loop that drains it runs on this same task.
        match self.client.try_publish(topic, qos, retain, payload.to_vec()) {
            Ok(()) => Ok(()),
            Err(ClientError::TryRequest(request)) => {
                warn!(?request, "MQTT request queue full, dropping message");
                Ok(())
            }
            Err(error) => Err(error.into()),
        }
    }

    async fn disconnect(&mut self) {
        if self.client.try_disconnect().is_err() {
            return;
        }

        let drain = async {
            loop {
                match self.event_loop.poll().await {
                    Ok(Event::Outgoing(Outgoing::Disconnect)) | Err(_) => break,
                    Ok(_) => {}
                }
            }
        };
        if tokio::time::timeout(DISCONNECT_TIMEOUT, drain).await.is_err() {
            warn!("Timed out disconnecting from MQTT broker");
        }
        info!("Disconnected from MQTT broker");
    }
}

#[derive(Clone, Debug)]
pub struct Handle {
    tx: Sender<Message>,
}

impl From<Sender<Message>> for Handle {
    fn from(tx: Sender<Message>) -> Self {
        Self { tx }
    }
}

impl Handle {
    pub async fn publish<T, P>(&self, topic: T, payload: P, retain: bool) -> crate::Result<()>
    where
        T: Into<String>,
        P: Into<Bytes>,
    {
        let mut publish = Publish::from_bytes(topic, QoS::AtLeastOnce, payload.into());
        publish.retain = retain;

        self.tx
            .send(Message::Publish(publish))
            .await
            .map_err(|_| Error::SendError)
    }

    pub async fn shutdown(&self) -> crate::Result<()> {
        self.tx
            .send(Message::Shutdown)
            .await
            .map_err(|_| Error::SendError)
    }
}

#[test]
fn options_carry_credentials_and_last_will() {
    let settings = MqttSettings {
        user_name: Some("meter".to_owned()),
        password: Some("secret".to_owned()),
        ..Default::default()
    };
    let options = options(&settings, "energymeter2mqtt/energymeter/status");

    assert_eq!(options.broker_address(), ("localhost".to_owned(), 1883));
    assert!(options.client_id().starts_with("energymeter-"));
    assert_eq!(
        options.credentials(),
        Some(("meter".to_owned(), "secret".to_owned()))
    );
    assert_eq!(options.keep_alive(), Duration::from_secs(5));

    let will = options.last_will().unwrap();
    assert_eq!(will.topic, "energymeter2mqtt/energymeter/status");
    assert_eq!(&will.message[..], OFFLINE.as_bytes());
    assert!(will.retain);
}

#[tokio::test]
async fn handle_sends_publish_messages() {
    let (tx, mut rx) = channel(4);
    let handle = Handle::from(tx);

    handle.publish("a/b", "1.5", true).await.unwrap();
    handle.shutdown().await.unwrap();

    match rx.recv().await {
        Some(Message::Publish(publish)) => {
            assert_eq!(publish.topic, "a/b");
            assert_eq!(&publish.payload[..], b"1.5");
            assert!(publish.retain);
            assert_eq!(publish.qos, QoS::AtLeastOnce);
        }
        other => panic!("unexpected {other:?}"),
    }
    assert!(matches!(rx.recv().await, Some(Message::Shutdown)));
}
