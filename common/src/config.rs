use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::boot::FlashLayout;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub poll_interval_seconds: u64,
    pub publish_interval_seconds: u64,
    pub max_consecutive_failures: u32,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            poll_interval_seconds: 30,
            publish_interval_seconds: 3,
            max_consecutive_failures: 5,
        }
    }
}

impl AgentConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_seconds)
    }

    pub fn publish_interval(&self) -> Duration {
        Duration::from_secs(self.publish_interval_seconds)
    }

    pub fn sanitize(&mut self) {
        self.poll_interval_seconds = self.poll_interval_seconds.clamp(1, 86_400);
        self.publish_interval_seconds = self.publish_interval_seconds.clamp(1, 3_600);
        self.max_consecutive_failures = self.max_consecutive_failures.clamp(1, 1_000);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    pub device_id: String,
    pub wifi_ssid: String,
    pub wifi_pass: String,
    pub mqtt_host: String,
    pub mqtt_port: u16,
    pub mqtt_user: String,
    pub mqtt_pass: String,
    pub link_check_interval_seconds: u64,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            device_id: "fota-device".to_string(),
            wifi_ssid: String::new(),
            wifi_pass: String::new(),
            mqtt_host: "192.168.1.100".to_string(),
            mqtt_port: 1883,
            mqtt_user: String::new(),
            mqtt_pass: String::new(),
            link_check_interval_seconds: 5,
        }
    }
}

impl NetworkConfig {
    pub fn sanitize(&mut self) {
        let device_id = self.device_id.trim();
        self.device_id = if device_id.is_empty() {
            NetworkConfig::default().device_id
        } else {
            device_id.to_string()
        };
        if self.mqtt_port == 0 {
            self.mqtt_port = 1883;
        }
        self.link_check_interval_seconds = self.link_check_interval_seconds.clamp(1, 300);
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct UpdateSourceConfig {
    pub manifest_url: String,
    pub drop_dir: String,
}

impl Default for UpdateSourceConfig {
    fn default() -> Self {
        Self {
            manifest_url: String::new(),
            drop_dir: "updates".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SensorConfig {
    pub hub_max_age_seconds: u64,
}

impl Default for SensorConfig {
    fn default() -> Self {
        Self {
            hub_max_age_seconds: 10,
        }
    }
}

impl SensorConfig {
    pub fn hub_max_age(&self) -> Duration {
        Duration::from_secs(self.hub_max_age_seconds)
    }

    pub fn sanitize(&mut self) {
        self.hub_max_age_seconds = self.hub_max_age_seconds.clamp(1, 3_600);
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub agent: AgentConfig,
    pub network: NetworkConfig,
    pub update: UpdateSourceConfig,
    pub flash: FlashLayout,
    pub sensors: SensorConfig,
}

impl RuntimeConfig {
    pub fn sanitize(&mut self) {
        self.agent.sanitize();
        self.network.sanitize();
        self.sensors.sanitize();
    }
}
