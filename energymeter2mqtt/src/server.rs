use std::{future::Future, time::Duration};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::homeassistant::{Sensors, ONLINE, OFFLINE};
use crate::modbus::{read_parameters, DecodedValue, DefinitionTable, RegisterReader};
use crate::mqtt;
use crate::settings::UserSettings;

/// Poll the meter and publish every reading to MQTT until `shutdown` completes.
///
/// Shutdown is only noticed between poll cycles; a cycle that has started always finishes.
pub async fn run<R>(
    settings: &UserSettings,
    table: &DefinitionTable,
    reader: &mut R,
    shutdown: impl Future,
) -> crate::Result<()>
where
    R: RegisterReader + ?Sized,
{
    let sensors = Sensors::new(settings);
    let (connection, handle) = mqtt::new(mqtt::options(
        &settings.mqtt,
        sensors.availability_topic(),
    ));
    let connection = tokio::spawn(connection.run());

    let mut publisher = Publisher::new(sensors, handle.clone(), settings.mqtt.config_interval);

    let ret = poll_loop(settings, table, reader, &mut publisher, shutdown).await;
    finish(ret, publisher, handle, connection).await
}

/// Mark the device offline, close the MQTT connection and hand back the outcome of the poll loop.
async fn finish(
    ret: crate::Result<()>,
    publisher: Publisher,
    handle: mqtt::Handle,
    connection: JoinHandle<crate::Result<()>>,
) -> crate::Result<()> {
    if let Err(ref err) = ret {
        error!(cause = %err, "publish loop failed");
    }

    // The connection may already be gone; its own error is reported when it is joined below.
    if let Err(err) = publisher.set_availability(OFFLINE).await {
        warn!(cause = %err, "Could not publish availability");
    }
    if let Err(err) = handle.shutdown().await {
        warn!(cause = %err, "Could not request MQTT shutdown");
    }
    drop(publisher);
    drop(handle);

    match connection.await {
        Ok(Err(err)) => error!(cause = %err, "MQTT connection failed"),
        Err(err) => error!(cause = %err, "MQTT connection task failed"),
        Ok(Ok(())) => info!("MQTT connection closed"),
    }

    ret
}

async fn poll_loop<R>(
    settings: &UserSettings,
    table: &DefinitionTable,
    reader: &mut R,
    publisher: &mut Publisher,
    shutdown: impl Future,
) -> crate::Result<()>
where
    R: RegisterReader + ?Sized,
{
    let meter = &settings.energy_meter;
    let mut interval = tokio::time::interval(meter.poll_interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    tokio::pin!(shutdown);

    publisher.set_availability(ONLINE).await?;

    loop {
        tokio::select! {
            _ = interval.tick() => {}
            _ = &mut shutdown => {
                info!("shutting down");
                return Ok(());
            }
        }

        let values = read_parameters(reader, table, meter.slave_id).await?;
        publisher.publish(&values).await?;
    }
}

/// Turns one poll cycle worth of values into discovery configs and states.
pub(crate) struct Publisher {
    sensors: Sensors,
    mqtt: mqtt::Handle,
    config_interval: Duration,
    last_config: Option<Instant>,
}

impl Publisher {
    pub(crate) fn new(sensors: Sensors, mqtt: mqtt::Handle, config_interval: Duration) -> Self {
        Self {
            sensors,
            mqtt,
            config_interval,
            last_config: None,
        }
    }

    pub(crate) async fn set_availability(&self, availability: &'static str) -> crate::Result<()> {
        self.mqtt
            .publish(self.sensors.availability_topic(), availability, true)
            .await
    }

    pub(crate) async fn publish(&mut self, values: &[DecodedValue]) -> crate::Result<()> {
        let now = Instant::now();
        let config_due = self
            .last_config
            .map_or(true, |last| now.duration_since(last) >= self.config_interval);

        if config_due && !values.is_empty() {
            debug!(count = values.len(), "Publishing discovery configs");
            for value in values {
                self.mqtt
                    .publish(
                        self.sensors.config_topic(value),
                        self.sensors.config_payload(value)?,
                        true,
                    )
                    .await?;
            }
            self.last_config = Some(now);
        }

        for value in values {
            self.mqtt
                .publish(
                    self.sensors.state_topic(value),
                    self.sensors.state_payload(value),
                    false,
                )
                .await?;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::modbus::poll::tests::{table, ScriptedReader};
    use crate::modbus::Magnitude;
    use crate::mqtt::Message;
    use pretty_assertions::assert_eq;
    use tokio::sync::mpsc::{channel, Receiver};

    fn drain(rx: &mut Receiver<Message>) -> Vec<(String, String, bool)> {
        let mut published = vec![];
        while let Ok(message) = rx.try_recv() {
            if let Message::Publish(publish) = message {
                published.push((
                    publish.topic,
                    String::from_utf8(publish.payload.to_vec()).unwrap(),
                    publish.retain,
                ));
            }
        }
        published
    }

    fn value(name: &str, value: Magnitude) -> DecodedValue {
        DecodedValue {
            name: name.to_owned(),
            value,
            device_class: None,
            state_class: None,
            unit: None,
        }
    }

    #[tokio::test]
    async fn configs_first_then_states() {
        let (tx, mut rx) = channel(64);
        let sensors = Sensors::new(&UserSettings::default());
        let mut publisher = Publisher::new(sensors, tx.into(), Duration::from_secs(3600));

        let values = vec![value("voltage", Magnitude::Raw(230)), value("current", Magnitude::Scaled(5.2))];
        publisher.publish(&values).await.unwrap();

        let published = drain(&mut rx);
        let topics: Vec<_> = published.iter().map(|(t, _, r)| (t.as_str(), *r)).collect();
        assert_eq!(
            topics,
            vec![
                ("homeassistant/sensor/energymeter/voltage/config", true),
                ("homeassistant/sensor/energymeter/current/config", true),
                ("homeassistant/sensor/energymeter/voltage/state", false),
                ("homeassistant/sensor/energymeter/current/state", false),
            ]
        );
        assert_eq!(published[2].1, "230");
        assert_eq!(published[3].1, "5.2");

        // Within the config interval only states go out.
        publisher.publish(&values).await.unwrap();
        let topics: Vec<_> = drain(&mut rx).into_iter().map(|(t, _, _)| t).collect();
        assert_eq!(
            topics,
            vec![
                "homeassistant/sensor/energymeter/voltage/state",
                "homeassistant/sensor/energymeter/current/state",
            ]
        );
    }

    #[tokio::test]
    async fn configs_repeat_once_interval_elapsed() {
        let (tx, mut rx) = channel(64);
        let sensors = Sensors::new(&UserSettings::default());
        let mut publisher = Publisher::new(sensors, tx.into(), Duration::ZERO);

        let values = vec![value("voltage", Magnitude::Raw(230))];
        publisher.publish(&values).await.unwrap();
        publisher.publish(&values).await.unwrap();

        let configs = drain(&mut rx)
            .into_iter()
            .filter(|(topic, _, _)| topic.ends_with("/config"))
            .count();
        assert_eq!(configs, 2);
    }

    #[tokio::test]
    async fn poll_loop_publishes_until_shutdown() {
        let (tx, mut rx) = channel(64);
        let mut settings = UserSettings::default();
        settings.energy_meter.poll_interval = Duration::from_millis(1);
        settings.energy_meter.slave_id = 9;

        let sensors = Sensors::new(&settings);
        let mut publisher = Publisher::new(sensors, tx.into(), Duration::from_secs(3600));
        let mut reader = ScriptedReader::new([
            Err(std::io::Error::new(std::io::ErrorKind::TimedOut, "timeout")),
            Ok(vec![230]),
            Ok(vec![52]),
        ]);

        // The first tick completes immediately, so exactly one cycle runs before the shutdown future is polled.
        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
        let table = table();
        let run = poll_loop(&settings, &table, &mut reader, &mut publisher, async {
            let _ = stop_rx.await;
        });
        let stopper = async {
            tokio::task::yield_now().await;
            let _ = stop_tx.send(());
        };
        let (result, ()) = tokio::join!(run, stopper);
        result.unwrap();

        assert_eq!(reader.requests.first(), Some(&(9, 0x1C, 2)));
        let published = drain(&mut rx);
        assert_eq!(
            published.first(),
            Some(&(
                "energymeter2mqtt/energymeter/status".to_owned(),
                ONLINE.to_owned(),
                true
            ))
        );
        let states: Vec<_> = published
            .iter()
            .filter(|(topic, _, _)| topic.ends_with("/state"))
            .map(|(topic, payload, _)| (topic.as_str(), payload.as_str()))
            .collect();
        assert_eq!(
            &states[..2],
            &[
                ("homeassistant/sensor/energymeter/voltage/state", "230"),
                ("homeassistant/sensor/energymeter/current/state", "5.2"),
            ]
        );
    }

    #[tokio::test]
    async fn poll_error_survives_a_dead_connection() {
        let (tx, rx) = channel(4);
        drop(rx);
        let handle = mqtt::Handle::from(tx);
        let publisher = Publisher::new(
            Sensors::new(&UserSettings::default()),
            handle.clone(),
            Duration::from_secs(20),
        );
        let connection = tokio::spawn(async { Err::<(), _>(crate::Error::SendError) });

        let ret = Err(crate::Error::UnexpectedResponse {
            name: "voltage".to_owned(),
            expected: 1,
            got: 0,
        });
        let result = finish(ret, publisher, handle, connection).await;

        assert!(matches!(
            result,
            Err(crate::Error::UnexpectedResponse { ref name, .. }) if name == "voltage"
        ));
    }

    #[tokio::test]
    async fn finish_publishes_offline_and_shuts_down() {
        let (tx, mut rx) = channel(4);
        let handle = mqtt::Handle::from(tx);
        let publisher = Publisher::new(
            Sensors::new(&UserSettings::default()),
            handle.clone(),
            Duration::from_secs(20),
        );
        let connection = tokio::spawn(async { Ok(()) });

        finish(Ok(()), publisher, handle, connection).await.unwrap();

        match rx.recv().await {
            Some(Message::Publish(publish)) => {
                assert_eq!(publish.topic, "energymeter2mqtt/energymeter/status");
                assert_eq!(&publish.payload[..], OFFLINE.as_bytes());
                assert!(publish.retain);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(rx.recv().await, Some(Message::Shutdown)));
    }
}
