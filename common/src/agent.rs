use log::{error, info};

use crate::{
    boot::{validate_boot_state, BootError, BootRecord, BootStateStore},
    config::AgentConfig,
    link::ConnectivityGate,
    restart::{DeviceRestart, Escalation},
    sensor::SensorSource,
    telemetry::{TelemetryClient, TelemetryService, TELEMETRY_SERVICE},
    transport::TransportLock,
    update::{UpdateClient, UpdateService, UPDATE_SERVICE},
};

pub struct Agent<G> {
    config: AgentConfig,
    gate: G,
    lock: TransportLock,
}

impl<G: ConnectivityGate + Clone> Agent<G> {
    pub fn new(mut config: AgentConfig, gate: G) -> Self {
        config.sanitize();
        Self {
            config,
            gate,
            lock: TransportLock::new(),
        }
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn transport(&self) -> &TransportLock {
        &self.lock
    }

    pub fn startup<S: BootStateStore + ?Sized>(
        &self,
        store: &mut S,
    ) -> Result<BootRecord, BootError> {
        validate_boot_state(store)
    }

    pub fn update_service<U: UpdateClient>(&self, client: U) -> UpdateService<U, G> {
        UpdateService::new(client, self.gate.clone(), self.lock.clone(), &self.config)
    }

    pub fn telemetry_service<T, S>(&self, client: T, sensors: S) -> TelemetryService<T, S, G>
    where
        T: TelemetryClient,
        S: SensorSource,
    {
        TelemetryService::new(
            client,
            sensors,
            self.gate.clone(),
            self.lock.clone(),
            &self.config,
        )
    }
}

/// Runs both loops as separate tasks until either escalates, then hands the
/// escalation to `restarter`.
///
/// On a device `restart_device` never returns. When it does (tests, host
/// builds under a supervisor that has not killed us yet) both tasks have
/// already been aborted and the escalation is returned.
pub async fn supervise<U, T, S, G>(
    update: UpdateService<U, G>,
    telemetry: TelemetryService<T, S, G>,
    restarter: &dyn DeviceRestart,
) -> Escalation
where
    U: UpdateClient + 'static,
    T: TelemetryClient + 'static,
    T::Session: 'static,
    S: SensorSource + 'static,
    G: ConnectivityGate + 'static,
{
    info!("starting update and telemetry services");
    let mut update_task = tokio::spawn(update.run());
    let mut telemetry_task = tokio::spawn(telemetry.run());

    let escalation = tokio::select! {
        result = &mut update_task => result.unwrap_or(Escalation::ServiceStopped {
            service: UPDATE_SERVICE,
        }),
        result = &mut telemetry_task => result.unwrap_or(Escalation::ServiceStopped {
            service: TELEMETRY_SERVICE,
        }),
    };

    update_task.abort();
    telemetry_task.abort();

    error!("{escalation}, rebooting!");
    restarter.restart_device(&escalation);
    escalation
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        boot::{BootStatus, FlashBootStore, FlashLayout},
        flash::MemFlash,
        link::LinkState,
        sensor::NoSensors,
        telemetry::TelemetryError,
        types::StatusPayload,
        update::{PollOutcome, UpdateError},
    };
    use async_trait::async_trait;
    use std::{
        sync::{
            atomic::{AtomicBool, AtomicUsize, Ordering},
            Arc, Mutex,
        },
        time::Duration,
    };

    // Flags any moment where two network operations overlap.
    #[derive(Default)]
    struct Wire {
        in_flight: AtomicUsize,
        overlap_seen: AtomicBool,
        polls: AtomicUsize,
        publishes: AtomicUsize,
    }

    impl Wire {
        async fn transfer(&self, took: Duration) {
            if self.in_flight.fetch_add(1, Ordering::SeqCst) != 0 {
                self.overlap_seen.store(true, Ordering::SeqCst);
            }
            tokio::time::sleep(took).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
        }
    }

    struct WireBackend {
        wire: Arc<Wire>,
        healthy_polls: usize,
    }

    #[async_trait]
    impl UpdateClient for WireBackend {
        async fn poll_and_apply(&mut self) -> Result<PollOutcome, UpdateError> {
            self.wire.transfer(Duration::from_millis(1_500)).await;
            let polls = self.wire.polls.fetch_add(1, Ordering::SeqCst) + 1;
            if polls > self.healthy_polls {
                Err(UpdateError::Unreachable("timeout".into()))
            } else {
                Ok(PollOutcome::NoUpdate)
            }
        }
    }

    struct WireCloud {
        wire: Arc<Wire>,
        fail_init: bool,
    }

    #[async_trait]
    impl TelemetryClient for WireCloud {
        type Session = ();

        async fn init(&mut self) -> Result<(), TelemetryError> {
            self.wire.transfer(Duration::from_millis(700)).await;
            if self.fail_init {
                Err(TelemetryError::Connect("refused".into()))
            } else {
                Ok(())
            }
        }

        async fn publish(
            &mut self,
            _session: &mut (),
            _payload: &StatusPayload,
        ) -> Result<(), TelemetryError> {
            self.wire.transfer(Duration::from_millis(900)).await;
            self.wire.publishes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn teardown(&mut self, _session: ()) -> Result<(), TelemetryError> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct RecordingRestart {
        reasons: Mutex<Vec<Escalation>>,
    }

    impl DeviceRestart for RecordingRestart {
        fn restart_device(&self, reason: &Escalation) {
            self.reasons.lock().unwrap().push(*reason);
        }
    }

    #[tokio::test(start_paused = true)]
    async fn loops_never_share_the_transport() {
        let wire = Arc::new(Wire::default());
        let agent = Agent::new(AgentConfig::default(), LinkState::new(true));
        let update = agent.update_service(WireBackend {
            wire: wire.clone(),
            healthy_polls: 6,
        });
        let telemetry = agent.telemetry_service(
            WireCloud {
                wire: wire.clone(),
                fail_init: false,
            },
            NoSensors,
        );
        let restarter = RecordingRestart::default();

        let escalation = supervise(update, telemetry, &restarter).await;

        assert_eq!(escalation, Escalation::UpdateFailures { failures: 5 });
        assert_eq!(*restarter.reasons.lock().unwrap(), vec![escalation]);
        assert!(!wire.overlap_seen.load(Ordering::SeqCst));
        assert_eq!(wire.polls.load(Ordering::SeqCst), 11);
        assert!(wire.publishes.load(Ordering::SeqCst) > 50);
    }

    #[tokio::test(start_paused = true)]
    async fn telemetry_escalation_restarts_whole_device() {
        let wire = Arc::new(Wire::default());
        let agent = Agent::new(AgentConfig::default(), LinkState::new(true));
        let update = agent.update_service(WireBackend {
            wire: wire.clone(),
            healthy_polls: usize::MAX,
        });
        let telemetry = agent.telemetry_service(
            WireCloud {
                wire: wire.clone(),
                fail_init: true,
            },
            NoSensors,
        );
        let restarter = RecordingRestart::default();

        let escalation = supervise(update, telemetry, &restarter).await;

        assert_eq!(escalation, Escalation::TelemetryFailures { failures: 5 });
        assert_eq!(*restarter.reasons.lock().unwrap(), vec![escalation]);
        assert_eq!(wire.polls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn link_down_keeps_both_loops_idle() {
        let wire = Arc::new(Wire::default());
        let link = LinkState::new(false);
        let agent = Agent::new(AgentConfig::default(), link.clone());
        let update = agent.update_service(WireBackend {
            wire: wire.clone(),
            healthy_polls: 0,
        });
        let telemetry = agent.telemetry_service(
            WireCloud {
                wire: wire.clone(),
                fail_init: true,
            },
            NoSensors,
        );
        let update_stats = update.stats();
        let telemetry_stats = telemetry.stats();
        let restarter = RecordingRestart::default();

        let outcome = tokio::time::timeout(
            Duration::from_secs(600),
            supervise(update, telemetry, &restarter),
        )
        .await;

        assert!(outcome.is_err());
        assert!(restarter.reasons.lock().unwrap().is_empty());
        assert_eq!(wire.polls.load(Ordering::SeqCst), 0);
        assert_eq!(update_stats.snapshot().consecutive_failures, 0);
        assert_eq!(telemetry_stats.snapshot().consecutive_failures, 0);
        assert!(telemetry_stats.snapshot().skipped >= 150);
    }

    #[test]
    fn startup_confirms_pending_boot() {
        let agent = Agent::new(AgentConfig::default(), LinkState::new(true));
        let mut store =
            FlashBootStore::new(MemFlash::new(0x0010_0000, 0x1000), FlashLayout::default())
                .unwrap();
        store.stage_update(2).unwrap();

        let record = agent.startup(&mut store).unwrap();

        assert_eq!(record.status, BootStatus::Normal);
        assert_eq!(record.current_generation, 2);
    }
}
