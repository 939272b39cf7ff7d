use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Escalation {
    UpdateFailures { failures: u32 },
    TelemetryFailures { failures: u32 },
    UpdateStaged { generation: u32 },
    ServiceStopped { service: &'static str },
}

impl fmt::Display for Escalation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UpdateFailures { failures } => {
                write!(f, "too many unsuccessful poll attempts ({failures})")
            }
            Self::TelemetryFailures { failures } => {
                write!(f, "too many telemetry errors ({failures})")
            }
            Self::UpdateStaged { generation } => {
                write!(f, "generation {generation} staged, rebooting into it")
            }
            Self::ServiceStopped { service } => write!(f, "{service} service stopped"),
        }
    }
}

/// The only way the agent terminates the device.
///
/// Real implementations do not return. Test implementations record the
/// escalation and return so the caller can observe it.
pub trait DeviceRestart: Send + Sync {
    fn restart_device(&self, reason: &Escalation);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleOutcome {
    Skipped,
    Completed,
    Escalate(Escalation),
}
