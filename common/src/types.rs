use serde::Serialize;

use crate::{
    boot::BootRecord,
    sensor::{SensorSample, DEFAULT_MCU_TEMP},
    stats::LoopStatsSnapshot,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusPayload {
    pub mcutemp: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<i32>,
}

impl StatusPayload {
    pub fn compose(primary: &SensorSample, secondary: &SensorSample) -> Self {
        let mcu = primary.value().unwrap_or(DEFAULT_MCU_TEMP);
        let temperature = match secondary {
            SensorSample::Present(value) => Some(value.whole),
            _ => None,
        };
        Self {
            mcutemp: mcu.whole,
            temperature,
        }
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AgentStatus {
    pub boot: BootRecord,
    #[serde(rename = "linkUp")]
    pub link_up: bool,
    #[serde(rename = "transportHolder")]
    pub transport_holder: Option<&'static str>,
    pub update: LoopStatsSnapshot,
    pub telemetry: LoopStatsSnapshot,
}
