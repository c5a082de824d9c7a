use anyhow::{bail, Context, Result};
use daren485_lib::protocol;
use daren485_lib::serialport::Daren485;
use log::{error, info, warn};
use serde_json::json;
use std::collections::BTreeMap;

use crate::{commandline, mqtt};

#[derive(Debug)]
enum FetchedData {
    Telemetry(protocol::Telemetry),
    Realtime(protocol::RealtimeData),
    Parameters(protocol::SystemParameters),
    Capacity(protocol::CapacityParameters),
    Identity(protocol::DeviceIdentity),
}

impl FetchedData {
    fn to_json_value(&self) -> Result<serde_json::Value> {
        match self {
            FetchedData::Telemetry(s) => serde_json::to_value(s).map_err(Into::into),
            FetchedData::Realtime(s) => serde_json::to_value(s).map_err(Into::into),
            FetchedData::Parameters(s) => serde_json::to_value(s).map_err(Into::into),
            FetchedData::Capacity(s) => serde_json::to_value(s).map_err(Into::into),
            FetchedData::Identity(s) => serde_json::to_value(s).map_err(Into::into),
        }
    }

    fn as_debug_string(&self) -> String {
        match self {
            FetchedData::Telemetry(s) => format!("{s:?}"),
            FetchedData::Realtime(s) => format!("{s:?}"),
            FetchedData::Parameters(s) => format!("{s:?}"),
            FetchedData::Capacity(s) => format!("{s:?}"),
            FetchedData::Identity(s) => format!("{s:?}"),
        }
    }
}

type FetchFn = fn(&mut Daren485) -> Result<FetchedData>;

struct Metric {
    fetch: FetchFn,
    dependencies: &'static [&'static str],
}

fn get_metrics() -> BTreeMap<&'static str, Metric> {
    let mut metrics: BTreeMap<&'static str, Metric> = BTreeMap::new();
    metrics.insert(
        "telemetry",
        Metric {
            fetch: |bms| Ok(bms.poll().map(FetchedData::Telemetry)?),
            dependencies: &[],
        },
    );
    metrics.insert(
        "realtime",
        Metric {
            fetch: |bms| Ok(bms.get_realtime_data().map(FetchedData::Realtime)?),
            dependencies: &["parameters"],
        },
    );
    metrics.insert(
        "parameters",
        Metric {
            fetch: |bms| Ok(bms.get_system_parameters().map(FetchedData::Parameters)?),
            dependencies: &[],
        },
    );
    metrics.insert(
        "capacity",
        Metric {
            fetch: |bms| Ok(bms.get_capacity_parameters().map(FetchedData::Capacity)?),
            dependencies: &[],
        },
    );
    metrics.insert(
        "identity",
        Metric {
            fetch: |bms| Ok(bms.get_identity().map(FetchedData::Identity)?),
            dependencies: &[],
        },
    );
    metrics
}

/// Publishes every leaf of `value` to its own topic below
/// `base_topic/metric_name`, e.g. `daren485/telemetry/cell_voltages/3`.
fn publish_simple_format(
    publisher: &mut mqtt::MqttPublisher,
    base_topic: &str,
    metric_name: &str,
    value: &serde_json::Value,
) {
    fn publish_recursive(
        publisher: &mut mqtt::MqttPublisher,
        topic: &str,
        val: &serde_json::Value,
    ) {
        let payload = match val {
            serde_json::Value::Object(map) => {
                for (k, v) in map {
                    publish_recursive(publisher, &format!("{topic}/{k}"), v);
                }
                return;
            }
            serde_json::Value::Array(arr) => {
                for (i, v) in arr.iter().enumerate() {
                    publish_recursive(publisher, &format!("{topic}/{i}"), v);
                }
                return;
            }
            serde_json::Value::String(s) => s.clone(),
            serde_json::Value::Number(n) => n.to_string(),
            serde_json::Value::Bool(b) => b.to_string(),
            // absent values, e.g. an unreadable barcode
            serde_json::Value::Null => return,
        };
        if let Err(e) = publisher.publish(topic, &payload) {
            error!("Failed to publish message to topic {topic}: {e}");
        }
    }
    let root_topic = format!("{base_topic}/{metric_name}");
    publish_recursive(publisher, &root_topic, value);
}

fn publish_json(publisher: &mut mqtt::MqttPublisher, fetched_data: &BTreeMap<String, FetchedData>) {
    let mut data_to_publish = serde_json::Map::new();
    data_to_publish.insert(
        "timestamp".to_string(),
        json!(chrono::Utc::now().to_rfc3339()),
    );
    for (name, data) in fetched_data {
        match data.to_json_value() {
            Ok(val) => {
                data_to_publish.insert(name.clone(), val);
            }
            Err(e) => error!("Failed to serialize '{name}': {e}"),
        }
    }

    if data_to_publish.len() == 1 {
        info!("No data fetched in this cycle to publish via MQTT.");
        return;
    }
    match serde_json::to_string(&data_to_publish) {
        Ok(json_payload) => {
            let topic = publisher.topic().to_string();
            if let Err(e) = publisher.publish(&topic, &json_payload) {
                error!("Failed to publish data to MQTT: {e:?}");
            } else {
                info!("Successfully published data to MQTT.");
            }
        }
        Err(e) => error!("Failed to serialize data to JSON string: {e}"),
    }
}

/// Expands `all` and rejects unknown names before the first cycle.
fn resolve_metrics(
    available_metrics: &BTreeMap<&'static str, Metric>,
    requested: &[String],
) -> Result<Vec<String>> {
    if requested.iter().any(|m| m == "all") {
        return Ok(available_metrics.keys().map(|s| s.to_string()).collect());
    }
    for name in requested {
        if !available_metrics.contains_key(name.as_str()) {
            bail!("Unknown metric name '{}'", name);
        }
    }
    Ok(requested.to_vec())
}

fn fetch_cycle(
    bms: &mut Daren485,
    available_metrics: &BTreeMap<&'static str, Metric>,
    metrics_to_process: &[String],
) -> BTreeMap<String, FetchedData> {
    let mut fetched_data: BTreeMap<String, FetchedData> = BTreeMap::new();
    for metric_name in metrics_to_process {
        let Some(metric) = available_metrics.get(metric_name.as_str()) else {
            continue;
        };
        for &dep in metric.dependencies {
            if fetched_data.contains_key(dep) {
                continue;
            }
            if let Some(dep_metric) = available_metrics.get(dep) {
                info!("Fetching dependency '{dep}' for '{metric_name}'");
                match (dep_metric.fetch)(bms) {
                    Ok(data) => {
                        if metrics_to_process.iter().any(|m| m == dep) {
                            fetched_data.insert(dep.to_string(), data);
                        }
                    }
                    Err(e) => error!("Error fetching dependency '{dep}': {e:#}"),
                }
            }
        }
        if fetched_data.contains_key(metric_name) {
            continue;
        }
        info!("Fetching metric: {metric_name}");
        match (metric.fetch)(bms) {
            Ok(data) => {
                fetched_data.insert(metric_name.to_string(), data);
            }
            Err(e) => error!("Error fetching metric '{metric_name}': {e:#}"),
        }
    }
    fetched_data
}

pub fn run(
    mut bms: Daren485,
    output: commandline::DaemonOutput,
    interval: std::time::Duration,
    metrics_to_fetch: Vec<String>,
) -> Result<()> {
    info!(
        "Starting daemon mode: output={:?}, interval={:?}, metrics={:?}",
        output, interval, metrics_to_fetch
    );
    let available_metrics = get_metrics();
    let metrics_to_process = resolve_metrics(&available_metrics, &metrics_to_fetch)?;

    let mut mqtt_publisher: Option<mqtt::MqttPublisher> = None;

    if let commandline::DaemonOutput::Mqtt { config_file, .. } = &output {
        let config = mqtt::MqttConfig::load(config_file)
            .with_context(|| format!("Failed to open MQTT config file at '{config_file}'"))?;
        info!("Successfully loaded MQTT config from {config_file}: {config:?}");
        let publisher =
            mqtt::MqttPublisher::new(config).with_context(|| "Failed to create MQTT publisher")?;
        info!("MQTT Publisher created successfully.");
        mqtt_publisher = Some(publisher);
    }

    loop {
        let fetched_data = fetch_cycle(&mut bms, &available_metrics, &metrics_to_process);

        match &output {
            commandline::DaemonOutput::Console => {
                println!("--- Data at {} ---", chrono::Local::now().to_rfc3339());
                for (name, data) in &fetched_data {
                    println!("{}: {}", name, data.as_debug_string());
                }
                println!("--------------------------");
            }
            commandline::DaemonOutput::Mqtt { format, .. } => {
                if let Some(publisher) = &mut mqtt_publisher {
                    match format {
                        commandline::MqttFormat::Json => publish_json(publisher, &fetched_data),
                        commandline::MqttFormat::Simple => {
                            let base_topic = publisher.topic().to_string();
                            for (name, data) in &fetched_data {
                                match data.to_json_value() {
                                    Ok(value) => {
                                        publish_simple_format(publisher, &base_topic, name, &value);
                                    }
                                    Err(e) => error!("Failed to serialize '{name}': {e}"),
                                }
                            }
                        }
                    }
                } else {
                    warn!(
                        "MQTT output selected, but publisher is not initialized. Skipping publish."
                    );
                }
            }
        }
        std::thread::sleep(interval);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn all_expands_to_every_metric() {
        let metrics = get_metrics();
        let resolved = resolve_metrics(&metrics, &["all".to_string()]).unwrap();
        assert_eq!(
            resolved,
            vec!["capacity", "identity", "parameters", "realtime", "telemetry"]
        );
    }

    #[test]
    fn unknown_metric_is_rejected() {
        let metrics = get_metrics();
        let err = resolve_metrics(&metrics, &["soc".to_string()]).unwrap_err();
        assert_eq!(err.to_string(), "Unknown metric name 'soc'");
        let requested = vec!["realtime".to_string(), "identity".to_string()];
        assert_eq!(resolve_metrics(&metrics, &requested).unwrap(), requested);
    }

    #[test]
    fn realtime_needs_parameters() {
        let metrics = get_metrics();
        assert_eq!(metrics["realtime"].dependencies, &["parameters"]);
        for dep in metrics.values().flat_map(|m| m.dependencies) {
            assert!(metrics.contains_key(dep));
        }
    }
}
