use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use log::{debug, error, info};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::Instant;

use crate::{
    boot::{BootError, BootRecord},
    config::AgentConfig,
    failure::{FailureCounter, FailureVerdict},
    flash::FlashError,
    link::ConnectivityGate,
    restart::{CycleOutcome, Escalation},
    stats::LoopStats,
    transport::TransportLock,
};

pub const UPDATE_SERVICE: &str = "update";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    NoUpdate,
    Staged { generation: u32 },
}

#[derive(Debug, Error)]
pub enum UpdateError {
    #[error("update backend unreachable: {0}")]
    Unreachable(String),
    #[error("update backend protocol error: {0}")]
    Protocol(String),
    #[error("update image rejected: {0}")]
    Image(String),
    #[error(transparent)]
    Boot(#[from] BootError),
    #[error(transparent)]
    Flash(#[from] FlashError),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateManifest {
    pub generation: u32,
    pub image: String,
    pub sha256: String,
}

impl UpdateManifest {
    pub fn parse(raw: &[u8]) -> Result<Self, UpdateError> {
        let manifest: Self = serde_json::from_slice(raw)
            .map_err(|err| UpdateError::Protocol(format!("invalid manifest: {err}")))?;
        manifest.validate()?;
        Ok(manifest)
    }

    pub fn validate(&self) -> Result<(), UpdateError> {
        if self.image.trim().is_empty() {
            return Err(UpdateError::Protocol("manifest has no image".into()));
        }
        let digest = self.sha256.trim();
        if digest.len() != 64 || !digest.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(UpdateError::Protocol(
                "sha256 must be 64 hex characters".into(),
            ));
        }
        if self.generation == crate::boot::NO_PENDING_GENERATION {
            return Err(UpdateError::Protocol("reserved generation number".into()));
        }
        Ok(())
    }

    pub fn is_newer_than(&self, record: &BootRecord) -> bool {
        let known = record
            .pending()
            .map_or(record.current_generation, |pending| {
                pending.max(record.current_generation)
            });
        self.generation > known
    }

    pub fn check_digest(&self, digest: &[u8]) -> Result<(), UpdateError> {
        let actual = hex_digest(digest);
        let expected = self.sha256.trim().to_ascii_lowercase();
        if actual != expected {
            return Err(UpdateError::Image(format!(
                "sha256 mismatch (expected {expected}, got {actual})"
            )));
        }
        Ok(())
    }
}

pub fn hex_digest(digest: &[u8]) -> String {
    use std::fmt::Write as _;

    let mut hex = String::with_capacity(digest.len() * 2);
    for byte in digest {
        let _ = write!(&mut hex, "{byte:02x}");
    }
    hex
}

#[async_trait]
pub trait UpdateClient: Send {
    async fn poll_and_apply(&mut self) -> Result<PollOutcome, UpdateError>;
}

pub struct UpdateService<U, G> {
    client: U,
    gate: G,
    lock: TransportLock,
    interval: Duration,
    failures: FailureCounter,
    stats: Arc<LoopStats>,
}

impl<U: UpdateClient, G: ConnectivityGate> UpdateService<U, G> {
    pub fn new(client: U, gate: G, lock: TransportLock, config: &AgentConfig) -> Self {
        Self {
            client,
            gate,
            lock,
            interval: config.poll_interval(),
            failures: FailureCounter::new(config.max_consecutive_failures),
            stats: Arc::new(LoopStats::default()),
        }
    }

    pub fn stats(&self) -> Arc<LoopStats> {
        self.stats.clone()
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.failures.count()
    }

    pub async fn run(mut self) -> Escalation {
        info!("starting update service (poll every {:?})", self.interval);
        loop {
            tokio::time::sleep(self.interval).await;
            if let CycleOutcome::Escalate(escalation) = self.run_cycle().await {
                return escalation;
            }
        }
    }

    pub async fn run_cycle(&mut self) -> CycleOutcome {
        if !self.gate.is_link_up() {
            debug!("no network link, skipping update poll");
            self.stats.record_skip();
            return CycleOutcome::Skipped;
        }

        let lock = self.lock.clone();
        let transport = lock.acquire(UPDATE_SERVICE).await;
        let held_since = Instant::now();

        let outcome = match self.client.poll_and_apply().await {
            Ok(PollOutcome::NoUpdate) => {
                self.record_success();
                CycleOutcome::Completed
            }
            Ok(PollOutcome::Staged { generation }) => {
                self.record_success();
                CycleOutcome::Escalate(Escalation::UpdateStaged { generation })
            }
            Err(err) => {
                let verdict = self.failures.record_failure();
                match verdict {
                    FailureVerdict::Retry { failures } => {
                        debug!("failed update poll attempt {failures}: {err}");
                        self.stats.record_failure(failures);
                        CycleOutcome::Completed
                    }
                    FailureVerdict::Escalate { failures } => {
                        error!("update poll failed {failures} times in a row: {err}");
                        self.stats.record_failure(failures);
                        CycleOutcome::Escalate(Escalation::UpdateFailures { failures })
                    }
                }
            }
        };

        drop(transport);
        let held = held_since.elapsed();
        let cycle = self.stats.record_watermark(held);
        debug!("update cycle {cycle} held the transport for {held:?}");
        outcome
    }

    fn record_success(&mut self) {
        self.failures.record_success();
        self.stats.record_success();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::LinkState;
    use std::collections::VecDeque;

    struct ScriptedBackend {
        results: VecDeque<Result<PollOutcome, UpdateError>>,
        polls: usize,
    }

    impl ScriptedBackend {
        fn new(script: &str) -> Self {
            let results = script
                .chars()
                .map(|c| match c {
                    'S' => Ok(PollOutcome::NoUpdate),
                    _ => Err(UpdateError::Unreachable("connection refused".into())),
                })
                .collect();
            Self { results, polls: 0 }
        }
    }

    #[async_trait]
    impl UpdateClient for ScriptedBackend {
        async fn poll_and_apply(&mut self) -> Result<PollOutcome, UpdateError> {
            self.polls += 1;
            self.results
                .pop_front()
                .unwrap_or(Ok(PollOutcome::NoUpdate))
        }
    }

    fn service(script: &str, link: &LinkState) -> UpdateService<ScriptedBackend, LinkState> {
        UpdateService::new(
            ScriptedBackend::new(script),
            link.clone(),
            TransportLock::new(),
            &AgentConfig::default(),
        )
    }

    async fn drive(
        service: &mut UpdateService<ScriptedBackend, LinkState>,
        cycles: usize,
    ) -> Vec<CycleOutcome> {
        let mut outcomes = Vec::new();
        for _ in 0..cycles {
            outcomes.push(service.run_cycle().await);
        }
        outcomes
    }

    #[tokio::test]
    async fn fifth_consecutive_failure_escalates() {
        let link = LinkState::new(true);
        let mut service = service("FFFFF", &link);

        let outcomes = drive(&mut service, 5).await;

        assert!(outcomes[..4]
            .iter()
            .all(|outcome| *outcome == CycleOutcome::Completed));
        assert_eq!(
            outcomes[4],
            CycleOutcome::Escalate(Escalation::UpdateFailures { failures: 5 })
        );
    }

    #[tokio::test]
    async fn success_in_between_prevents_escalation() {
        let link = LinkState::new(true);
        let mut service = service("FFSFF", &link);

        let outcomes = drive(&mut service, 5).await;

        assert!(outcomes
            .iter()
            .all(|outcome| *outcome == CycleOutcome::Completed));
        assert_eq!(service.consecutive_failures(), 2);
        assert_eq!(service.stats().snapshot().successes, 1);
    }

    #[tokio::test]
    async fn link_down_skips_without_touching_counter() {
        let link = LinkState::new(true);
        let mut service = service("FFFFF", &link);
        drive(&mut service, 2).await;
        assert_eq!(service.consecutive_failures(), 2);

        link.set(false);
        let outcomes = drive(&mut service, 10).await;
        assert!(outcomes
            .iter()
            .all(|outcome| *outcome == CycleOutcome::Skipped));
        assert_eq!(service.consecutive_failures(), 2);
        assert_eq!(service.client.polls, 2);

        link.set(true);
        let outcomes = drive(&mut service, 3).await;
        assert_eq!(
            outcomes[2],
            CycleOutcome::Escalate(Escalation::UpdateFailures { failures: 5 })
        );
    }

    #[tokio::test]
    async fn staged_update_resets_counter_and_requests_reboot() {
        let link = LinkState::new(true);
        let mut service = service("FF", &link);
        drive(&mut service, 2).await;
        service
            .client
            .results
            .push_back(Ok(PollOutcome::Staged { generation: 9 }));

        let outcome = service.run_cycle().await;

        assert_eq!(
            outcome,
            CycleOutcome::Escalate(Escalation::UpdateStaged { generation: 9 })
        );
        assert_eq!(service.consecutive_failures(), 0);
    }

    #[tokio::test]
    async fn transport_released_after_each_cycle() {
        let link = LinkState::new(true);
        let mut service = service("SF", &link);
        drive(&mut service, 2).await;

        assert_eq!(service.lock.holder(), None);
        assert_eq!(service.stats().snapshot().cycles, 2);
    }

    struct HolderCheck {
        lock: TransportLock,
        seen: Option<&'static str>,
    }

    #[async_trait]
    impl UpdateClient for HolderCheck {
        async fn poll_and_apply(&mut self) -> Result<PollOutcome, UpdateError> {
            self.seen = self.lock.holder();
            Ok(PollOutcome::NoUpdate)
        }
    }

    #[tokio::test]
    async fn poll_runs_while_holding_transport() {
        let lock = TransportLock::new();
        let client = HolderCheck {
            lock: lock.clone(),
            seen: None,
        };
        let mut service = UpdateService::new(
            client,
            LinkState::new(true),
            lock.clone(),
            &AgentConfig::default(),
        );

        assert_eq!(service.run_cycle().await, CycleOutcome::Completed);

        assert_eq!(service.client.seen, Some(UPDATE_SERVICE));
        assert_eq!(service.stats().snapshot().successes, 1);
        assert_eq!(lock.holder(), None);
    }

    #[test]
    fn manifest_checks_digest_and_generation() {
        use crate::boot::BootStatus;
        use sha2::{Digest, Sha256};

        let image = b"firmware image v7";
        let digest = Sha256::digest(image);
        let manifest = UpdateManifest::parse(
            format!(
                r#"{{"generation":7,"image":"app-v7.bin","sha256":"{}"}}"#,
                hex_digest(&digest).to_ascii_uppercase()
            )
            .as_bytes(),
        )
        .unwrap();

        assert!(manifest.check_digest(&digest).is_ok());
        assert!(matches!(
            manifest.check_digest(&Sha256::digest(b"tampered")),
            Err(UpdateError::Image(_))
        ));

        let running = BootRecord {
            current_generation: 6,
            ..BootRecord::default()
        };
        assert!(manifest.is_newer_than(&running));
        let staged = BootRecord {
            current_generation: 6,
            pending_generation: 7,
            status: BootStatus::Ongoing,
        };
        assert!(!manifest.is_newer_than(&staged));
    }

    #[test]
    fn manifest_rejects_bad_digest() {
        let err = UpdateManifest::parse(br#"{"generation":1,"image":"a.bin","sha256":"abc"}"#)
            .unwrap_err();
        assert!(matches!(err, UpdateError::Protocol(_)));
        assert!(UpdateManifest::parse(b"not json").is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn run_returns_escalation_after_sustained_failure() {
        let link = LinkState::new(true);
        let service = service("FFFFFFFF", &link);
        let started = Instant::now();

        let escalation = service.run().await;

        assert_eq!(escalation, Escalation::UpdateFailures { failures: 5 });
        let elapsed = started.elapsed();
        assert!(elapsed >= Duration::from_secs(150) && elapsed < Duration::from_secs(151));
    }
}
