#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FailureCounter {
    count: u32,
    threshold: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureVerdict {
    Retry { failures: u32 },
    Escalate { failures: u32 },
}

impl FailureCounter {
    pub fn new(threshold: u32) -> Self {
        Self {
            count: 0,
            threshold: threshold.max(1),
        }
    }

    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn threshold(&self) -> u32 {
        self.threshold
    }

    pub fn record_success(&mut self) {
        self.count = 0;
    }

    pub fn record_failure(&mut self) -> FailureVerdict {
        self.count = self.count.saturating_add(1);
        if self.count >= self.threshold {
            FailureVerdict::Escalate {
                failures: self.count,
            }
        } else {
            FailureVerdict::Retry {
                failures: self.count,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn replay(threshold: u32, results: &str) -> (u32, Option<usize>) {
        let mut counter = FailureCounter::new(threshold);
        let mut escalated_at = None;
        for (i, result) in results.chars().enumerate() {
            match result {
                'S' => counter.record_success(),
                _ => {
                    if let FailureVerdict::Escalate { .. } = counter.record_failure() {
                        escalated_at.get_or_insert(i);
                    }
                }
            }
        }
        (counter.count(), escalated_at)
    }

    #[test]
    fn escalates_on_fifth_consecutive_failure() {
        assert_eq!(replay(5, "FFFF"), (4, None));
        assert_eq!(replay(5, "FFFFF"), (5, Some(4)));
    }

    #[test]
    fn success_resets_the_run() {
        assert_eq!(replay(5, "FFSFF"), (2, None));
        assert_eq!(replay(5, "FFFFSFFFFS"), (0, None));
        assert_eq!(replay(5, "FFFFSFFFFF"), (5, Some(9)));
    }

    #[test]
    fn zero_threshold_is_clamped_to_one() {
        let mut counter = FailureCounter::new(0);
        assert_eq!(counter.threshold(), 1);
        assert_eq!(
            counter.record_failure(),
            FailureVerdict::Escalate { failures: 1 }
        );
    }
}
