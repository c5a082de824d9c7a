use anyhow::{Context, Result};
use rumqttc::{Client, ClientError, Connection, MqttOptions, QoS};
use serde::{Deserialize, Deserializer};
use std::time::Duration;

fn deserialize_duration<'de, D>(deserializer: D) -> std::result::Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let text = String::deserialize(deserializer)?;
    humantime::parse_duration(&text).map_err(serde::de::Error::custom)
}

#[derive(Debug, Deserialize, Clone)]
pub struct MqttConfig {
    #[serde(default = "MqttConfig::default_host")]
    host: String,
    #[serde(default = "MqttConfig::default_port")]
    port: u16,
    username: Option<String>,
    password: Option<String>,
    #[serde(default = "MqttConfig::default_topic")]
    topic: String,
    #[serde(default)]
    qos: u8,
    #[serde(default = "MqttConfig::default_client_id")]
    client_id: String,
    #[serde(
        default = "MqttConfig::default_keep_alive",
        deserialize_with = "deserialize_duration"
    )]
    keep_alive: Duration,
    #[serde(
        default = "MqttConfig::default_reconnect_delay",
        deserialize_with = "deserialize_duration"
    )]
    reconnect_delay: Duration,
}

impl MqttConfig {
    fn default_host() -> String {
        "localhost".into()
    }

    fn default_port() -> u16 {
        1883
    }

    fn default_topic() -> String {
        "daren485".into()
    }

    fn generate_random_string(len: usize) -> String {
        use rand::distributions::Alphanumeric;
        use rand::Rng;

        rand::thread_rng()
            .sample_iter(&Alphanumeric)
            .take(len)
            .map(char::from)
            .collect()
    }

    fn default_client_id() -> String {
        format!("daren485-{}", Self::generate_random_string(8))
    }

    fn default_keep_alive() -> Duration {
        Duration::from_secs(30)
    }

    fn default_reconnect_delay() -> Duration {
        Duration::from_secs(5)
    }

    pub const DEFAULT_CONFIG_FILE: &str = "mqtt.yaml";

    pub fn load(config_file_path: &str) -> Result<Self> {
        log::debug!("Loading config file from {config_file_path:?}");
        let config_file = std::fs::File::open(config_file_path)
            .with_context(|| format!("Cannot open MQTT config file {config_file_path:?}"))?;
        let config: Self = serde_yaml::from_reader(&config_file)
            .with_context(|| format!("Cannot read MQTT config from file: {config_file_path:?}"))?;
        Ok(config)
    }

    pub fn qos(&self) -> QoS {
        match self.qos {
            0 => QoS::AtMostOnce,
            1 => QoS::AtLeastOnce,
            2 => QoS::ExactlyOnce,
            other => {
                log::warn!("Invalid QoS {other}, use 0");
                QoS::AtMostOnce
            }
        }
    }

    fn options(&self) -> MqttOptions {
        let mut options = MqttOptions::new(&self.client_id, &self.host, self.port);
        options.set_keep_alive(self.keep_alive.max(Duration::from_secs(1)));
        options.set_clean_session(true);
        if let (Some(username), Some(password)) = (&self.username, &self.password) {
            options.set_credentials(username, password);
        }
        options
    }
}

// The connection has to be iterated for requests to reach the broker; it
// reconnects on the next iteration after an error.
fn drive_connection(mut connection: Connection, reconnect_delay: Duration) {
    for notification in connection.iter() {
        match notification {
            Ok(event) => log::trace!("MQTT event: {event:?}"),
            Err(err) => {
                log::error!("MQTT connection error: {err}");
                std::thread::sleep(reconnect_delay);
            }
        }
    }
    log::info!("MQTT connection closed");
}

pub struct MqttPublisher {
    client: Client,
    config: MqttConfig,
}

impl MqttPublisher {
    pub fn new(config: MqttConfig) -> Result<Self> {
        log::info!(
            "Connecting to MQTT broker {}:{} with client_id: {}",
            config.host,
            config.port,
            config.client_id
        );
        let (client, connection) = Client::new(config.options(), 64);
        let reconnect_delay = config.reconnect_delay;
        std::thread::Builder::new()
            .name("mqtt".into())
            .spawn(move || drive_connection(connection, reconnect_delay))
            .with_context(|| "Cannot start MQTT connection thread")?;
        Ok(Self { client, config })
    }

    pub fn topic(&self) -> &str {
        &self.config.topic
    }

    /// Queues a message for the connection thread. While the broker is
    /// unreachable the queue fills up, further messages are dropped.
    pub fn publish(&mut self, topic: &str, payload: &str) -> Result<()> {
        log::debug!(
            "Publishing to MQTT: Topic='{}', Payload='{payload}', QoS={}",
            topic,
            self.config.qos
        );
        match self
            .client
            .try_publish(topic, self.config.qos(), false, payload.as_bytes())
        {
            Ok(()) => Ok(()),
            Err(ClientError::TryRequest(_)) => {
                log::warn!("MQTT request queue full, dropping message for topic {topic}");
                Ok(())
            }
            Err(err) => Err(err)
                .with_context(|| format!("Failed to publish message to MQTT topic: {}", topic)),
        }
    }
}
