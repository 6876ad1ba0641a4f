use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;

/// Endpoint used when the operator enables reporting without naming a collector.
pub const DEFAULT_REPORT_ENDPOINT: &str = "http://localhost:5000";

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CampaignError {
    /// The parameters cannot drive a run: empty or out-of-range rates, a zero
    /// phase target, or a campaign that was never initialized.
    #[error("Invalid campaign configuration: {0}")]
    ConfigurationInvalid(String),

    #[error("Cannot {action} a campaign that is {status}")]
    InvalidTransition {
        action: &'static str,
        status: CampaignStatus,
    },
}

/// How progress through one rate-slot is measured, and when the slot is exhausted.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(tag = "mode", rename_all = "kebab-case")]
pub enum PhaseGoal {
    /// Counts every individual bit flipped.
    BitCount { target: u64 },
    /// Counts every injection that flipped at least one bit.
    VariableCount { target: u64 },
    /// Measures wall-clock time since the slot started.
    Duration { span: Duration },
}

impl PhaseGoal {
    pub fn mode_name(&self) -> &'static str {
        match self {
            PhaseGoal::BitCount { .. } => "bit-count",
            PhaseGoal::VariableCount { .. } => "variable-count",
            PhaseGoal::Duration { .. } => "duration",
        }
    }
}

impl fmt::Display for PhaseGoal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PhaseGoal::BitCount { target } => write!(f, "{target} bits per rate"),
            PhaseGoal::VariableCount { target } => write!(f, "{target} variables per rate"),
            PhaseGoal::Duration { span } => write!(f, "{span:?} per rate"),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub struct ReportSinkConfig {
    pub enabled: bool,
    pub endpoint: String,
}

impl Default for ReportSinkConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: DEFAULT_REPORT_ENDPOINT.to_string(),
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum CampaignStatus {
    /// No valid parameters yet.
    Idle,
    /// Initialized, not started.
    Ready,
    Running,
    /// Every rate-slot is exhausted, or the operator stopped the run.
    Completed,
}

impl fmt::Display for CampaignStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CampaignStatus::Idle => "idle",
            CampaignStatus::Ready => "ready",
            CampaignStatus::Running => "running",
            CampaignStatus::Completed => "completed",
        };
        f.write_str(s)
    }
}

/// Outcome of evaluating the active rate-slot at the top of an injection.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum PhaseCheck {
    /// The slot still has budget; mutate at this rate.
    Active { rate: f64 },
    /// The previous slot was exhausted and the next one is now active.
    Advanced { from: usize, to: usize, rate: f64 },
    /// The last slot was exhausted; the campaign is now complete.
    Completed,
}

/// The persisted configuration and progress of one fault-injection run.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct Campaign {
    pub initialized: bool,
    pub running: bool,
    #[serde(default)]
    pub restart_requested: bool,
    /// Bumped by every applied restart so another process sharing the store
    /// can tell that progress was reset.
    #[serde(default)]
    pub restart_generation: u64,
    #[serde(default)]
    pub completed: bool,
    pub phase: PhaseGoal,
    pub error_rates: Vec<f64>,
    #[serde(default)]
    pub rate_index: usize,
    #[serde(default)]
    pub phase_counter: u64,
    pub phase_start: DateTime<Utc>,
    #[serde(default)]
    pub report_sink: ReportSinkConfig,
}

impl Default for Campaign {
    fn default() -> Self {
        Self {
            initialized: false,
            running: false,
            restart_requested: false,
            restart_generation: 0,
            completed: false,
            phase: PhaseGoal::BitCount { target: 0 },
            error_rates: vec![0.1],
            rate_index: 0,
            phase_counter: 0,
            phase_start: Utc::now(),
            report_sink: ReportSinkConfig::default(),
        }
    }
}

impl Campaign {
    pub fn status(&self) -> CampaignStatus {
        if !self.initialized {
            CampaignStatus::Idle
        } else if self.completed {
            CampaignStatus::Completed
        } else if self.running {
            CampaignStatus::Running
        } else {
            CampaignStatus::Ready
        }
    }

    pub fn is_running(&self) -> bool {
        self.status() == CampaignStatus::Running
    }

    /// The rate of the active slot, if the index is in bounds.
    pub fn current_rate(&self) -> Option<f64> {
        self.error_rates.get(self.rate_index).copied()
    }

    pub fn validate(&self) -> Result<(), CampaignError> {
        self.validate_parameters()?;
        if self.rate_index >= self.error_rates.len() {
            return Err(CampaignError::ConfigurationInvalid(format!(
                "rate index {} out of bounds for {} rates",
                self.rate_index,
                self.error_rates.len()
            )));
        }
        Ok(())
    }

    /// Checks everything except progress, which a restart discards anyway.
    pub fn validate_parameters(&self) -> Result<(), CampaignError> {
        if !self.initialized {
            return Err(CampaignError::ConfigurationInvalid(
                "campaign has not been initialized".to_string(),
            ));
        }
        validate_rates(&self.error_rates)?;
        match self.phase {
            PhaseGoal::BitCount { target: 0 } | PhaseGoal::VariableCount { target: 0 } => {
                return Err(CampaignError::ConfigurationInvalid(
                    "phase target must be positive".to_string(),
                ));
            }
            PhaseGoal::Duration { span } if span.is_zero() => {
                return Err(CampaignError::ConfigurationInvalid(
                    "phase duration must be positive".to_string(),
                ));
            }
            _ => {}
        }
        Ok(())
    }

    /// Ready → Running. Progress already made in the current slot is kept; the
    /// duration anchor is reset.
    pub fn start(&mut self, now: DateTime<Utc>) -> Result<(), CampaignError> {
        match self.status() {
            CampaignStatus::Running => return Ok(()),
            CampaignStatus::Completed => {
                return Err(CampaignError::InvalidTransition {
                    action: "start",
                    status: CampaignStatus::Completed,
                });
            }
            CampaignStatus::Idle | CampaignStatus::Ready => {}
        }
        self.validate()?;
        self.running = true;
        self.restart_requested = false;
        self.phase_start = now;
        debug!(rate_index = self.rate_index, "campaign started");
        Ok(())
    }

    /// Ends the run. Resuming afterwards requires a restart.
    pub fn stop(&mut self) {
        if self.status() == CampaignStatus::Running {
            self.completed = true;
        }
        self.running = false;
        self.restart_requested = false;
        debug!(rate_index = self.rate_index, "campaign stopped");
    }

    /// Marks a destructive restart to be applied by the next injection.
    pub fn request_restart(&mut self) {
        self.restart_requested = true;
        self.running = true;
    }

    /// Discards all progress and re-enters `Running` at the first rate.
    pub fn restart(&mut self, now: DateTime<Utc>) -> Result<(), CampaignError> {
        self.validate_parameters()?;
        self.rate_index = 0;
        self.phase_counter = 0;
        self.restart_generation += 1;
        self.completed = false;
        self.running = true;
        self.restart_requested = false;
        self.phase_start = now;
        debug!("campaign restarted");
        Ok(())
    }

    /// Applies a restart requested through [`Campaign::request_restart`].
    /// Returns whether one was pending.
    pub fn apply_pending_restart(&mut self, now: DateTime<Utc>) -> Result<bool, CampaignError> {
        if !self.restart_requested {
            return Ok(false);
        }
        self.restart(now)?;
        Ok(true)
    }

    fn phase_exhausted(&self, now: DateTime<Utc>) -> bool {
        match self.phase {
            PhaseGoal::BitCount { target } | PhaseGoal::VariableCount { target } => {
                self.phase_counter >= target
            }
            PhaseGoal::Duration { span } => now
                .signed_duration_since(self.phase_start)
                .to_std()
                .map(|elapsed| elapsed >= span)
                .unwrap_or(false),
        }
    }

    /// Evaluates the active rate-slot and advances or completes the campaign.
    ///
    /// Must only be called while `Running`. Never leaves `rate_index` out of bounds
    /// while running.
    pub fn check_phase(&mut self, now: DateTime<Utc>) -> PhaseCheck {
        let last = self.error_rates.len().saturating_sub(1);
        if self.rate_index > last || self.error_rates.is_empty() {
            self.complete();
            return PhaseCheck::Completed;
        }
        if !self.phase_exhausted(now) {
            return PhaseCheck::Active {
                rate: self.error_rates[self.rate_index],
            };
        }
        if self.rate_index == last {
            self.complete();
            return PhaseCheck::Completed;
        }

        let from = self.rate_index;
        self.rate_index += 1;
        self.phase_counter = 0;
        self.phase_start = now;
        let rate = self.error_rates[self.rate_index];
        debug!(from, to = self.rate_index, rate, "advanced to next error rate");
        PhaseCheck::Advanced {
            from,
            to: self.rate_index,
            rate,
        }
    }

    fn complete(&mut self) {
        self.completed = true;
        self.running = false;
        debug!(rate_index = self.rate_index, "campaign completed");
    }

    /// Accounts for one mutation pass that flipped `flipped` bits.
    pub fn record_flips(&mut self, flipped: usize) {
        if flipped == 0 {
            return;
        }
        match self.phase {
            PhaseGoal::BitCount { .. } => self.phase_counter += flipped as u64,
            PhaseGoal::VariableCount { .. } => self.phase_counter += 1,
            PhaseGoal::Duration { .. } => {}
        }
    }
}

fn validate_rates(rates: &[f64]) -> Result<(), CampaignError> {
    if rates.is_empty() {
        return Err(CampaignError::ConfigurationInvalid(
            "at least one error rate is required".to_string(),
        ));
    }
    if let Some(bad) = rates.iter().find(|r| !(**r > 0.0 && **r <= 1.0)) {
        return Err(CampaignError::ConfigurationInvalid(format!(
            "error rate {bad} is outside (0, 1]"
        )));
    }
    Ok(())
}

/// Parses a comma-separated list of error rates such as `0.1,0.01,0.001`.
pub fn parse_rates(input: &str) -> Result<Vec<f64>, CampaignError> {
    if input.trim().is_empty() {
        return Err(CampaignError::ConfigurationInvalid(
            "must list error rates".to_string(),
        ));
    }
    if input.contains(char::is_whitespace) {
        return Err(CampaignError::ConfigurationInvalid(
            "error rates cannot contain spaces".to_string(),
        ));
    }
    let rates = input
        .split(',')
        .map(|entry| {
            entry.parse::<f64>().map_err(|_| {
                CampaignError::ConfigurationInvalid(format!("invalid error rate \"{entry}\""))
            })
        })
        .collect::<Result<Vec<_>, _>>()?;
    validate_rates(&rates)?;
    Ok(rates)
}

/// Builds an initialized, not yet started campaign.
#[derive(Debug, Clone)]
pub struct CampaignBuilder {
    phase: PhaseGoal,
    error_rates: Vec<f64>,
    report_sink: ReportSinkConfig,
}

impl CampaignBuilder {
    pub fn new(phase: PhaseGoal) -> Self {
        Self {
            phase,
            error_rates: Vec::new(),
            report_sink: ReportSinkConfig::default(),
        }
    }

    pub fn rates(mut self, rates: impl Into<Vec<f64>>) -> Self {
        self.error_rates = rates.into();
        self
    }

    pub fn report_to(mut self, endpoint: impl Into<String>) -> Self {
        self.report_sink = ReportSinkConfig {
            enabled: true,
            endpoint: endpoint.into(),
        };
        self
    }

    pub fn build(self) -> Result<Campaign, CampaignError> {
        let campaign = Campaign {
            initialized: true,
            phase: self.phase,
            error_rates: self.error_rates,
            report_sink: self.report_sink,
            ..Campaign::default()
        };
        campaign.validate()?;
        Ok(campaign)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;

    fn variable_campaign(rates: &[f64], target: u64) -> Campaign {
        CampaignBuilder::new(PhaseGoal::VariableCount { target })
            .rates(rates.to_vec())
            .build()
            .unwrap()
    }

    #[test]
    fn lifecycle_moves_through_every_status() {
        let mut campaign = Campaign::default();
        assert_eq!(campaign.status(), CampaignStatus::Idle);
        assert!(matches!(
            campaign.start(Utc::now()),
            Err(CampaignError::ConfigurationInvalid(_))
        ));

        let mut campaign = variable_campaign(&[0.5], 1);
        assert_eq!(campaign.status(), CampaignStatus::Ready);
        campaign.start(Utc::now()).unwrap();
        assert_eq!(campaign.status(), CampaignStatus::Running);
        campaign.stop();
        assert_eq!(campaign.status(), CampaignStatus::Completed);
        assert!(matches!(
            campaign.start(Utc::now()),
            Err(CampaignError::InvalidTransition { .. })
        ));
        campaign.restart(Utc::now()).unwrap();
        assert_eq!(campaign.status(), CampaignStatus::Running);
    }

    #[test]
    fn counter_modes_advance_then_complete() {
        let now = Utc::now();
        let mut campaign = variable_campaign(&[0.5, 1.0], 2);
        campaign.start(now).unwrap();

        assert_eq!(campaign.check_phase(now), PhaseCheck::Active { rate: 0.5 });
        campaign.record_flips(3);
        campaign.record_flips(1);
        assert_eq!(campaign.phase_counter, 2);

        assert_eq!(
            campaign.check_phase(now),
            PhaseCheck::Advanced {
                from: 0,
                to: 1,
                rate: 1.0
            }
        );
        assert_eq!(campaign.phase_counter, 0);
        campaign.record_flips(1);
        campaign.record_flips(1);

        assert_eq!(campaign.check_phase(now), PhaseCheck::Completed);
        assert_eq!(campaign.status(), CampaignStatus::Completed);
        assert_eq!(campaign.rate_index, 1);
    }

    #[test]
    fn bit_count_counts_every_flipped_bit() {
        let mut campaign = CampaignBuilder::new(PhaseGoal::BitCount { target: 10 })
            .rates(vec![0.1])
            .build()
            .unwrap();
        campaign.record_flips(4);
        campaign.record_flips(0);
        campaign.record_flips(3);
        assert_eq!(campaign.phase_counter, 7);
    }

    #[test]
    fn duration_mode_ignores_counter_and_resets_anchor_on_advance() {
        let start = Utc::now();
        let mut campaign = CampaignBuilder::new(PhaseGoal::Duration {
            span: Duration::from_secs(60),
        })
        .rates(vec![0.2, 0.4])
        .build()
        .unwrap();
        campaign.start(start).unwrap();

        campaign.record_flips(100);
        assert_eq!(campaign.phase_counter, 0);
        let later = start + TimeDelta::seconds(30);
        assert_eq!(campaign.check_phase(later), PhaseCheck::Active { rate: 0.2 });

        let after_slot = start + TimeDelta::seconds(60);
        assert!(matches!(
            campaign.check_phase(after_slot),
            PhaseCheck::Advanced { to: 1, .. }
        ));
        assert_eq!(campaign.phase_start, after_slot);

        let before_end = after_slot + TimeDelta::seconds(59);
        assert_eq!(
            campaign.check_phase(before_end),
            PhaseCheck::Active { rate: 0.4 }
        );
        let end = after_slot + TimeDelta::seconds(61);
        assert_eq!(campaign.check_phase(end), PhaseCheck::Completed);
    }

    #[test]
    fn clock_going_backwards_does_not_exhaust_duration() {
        let start = Utc::now();
        let mut campaign = CampaignBuilder::new(PhaseGoal::Duration {
            span: Duration::from_secs(1),
        })
        .rates(vec![0.2])
        .build()
        .unwrap();
        campaign.start(start).unwrap();
        let earlier = start - TimeDelta::seconds(10);
        assert_eq!(campaign.check_phase(earlier), PhaseCheck::Active { rate: 0.2 });
    }

    #[test]
    fn restart_resets_progress_regardless_of_state() {
        let now = Utc::now();
        let mut campaign = variable_campaign(&[0.1, 0.2, 0.3], 1);
        campaign.start(now).unwrap();
        campaign.rate_index = 2;
        campaign.phase_counter = 1;
        assert_eq!(campaign.check_phase(now), PhaseCheck::Completed);

        campaign.request_restart();
        assert!(campaign.apply_pending_restart(now).unwrap());
        assert_eq!(campaign.rate_index, 0);
        assert_eq!(campaign.phase_counter, 0);
        assert!(campaign.running);
        assert!(!campaign.restart_requested);
        assert!(!campaign.completed);
        assert_eq!(campaign.restart_generation, 1);
        assert!(!campaign.apply_pending_restart(now).unwrap());
        assert_eq!(campaign.restart_generation, 1);
    }

    #[test]
    fn failed_restart_leaves_progress_untouched() {
        let now = Utc::now();
        let mut campaign = variable_campaign(&[0.1, 0.2], 3);
        campaign.start(now).unwrap();
        campaign.rate_index = 1;
        campaign.phase_counter = 2;
        campaign.error_rates = vec![0.1, 0.0];

        assert!(matches!(
            campaign.restart(now),
            Err(CampaignError::ConfigurationInvalid(_))
        ));
        assert_eq!(campaign.rate_index, 1);
        assert_eq!(campaign.phase_counter, 2);
        assert_eq!(campaign.restart_generation, 0);
        assert!(campaign.running);
    }

    #[test]
    fn restart_accepts_out_of_range_progress() {
        let now = Utc::now();
        let mut campaign = variable_campaign(&[0.1, 0.2], 3);
        campaign.rate_index = 7;
        assert!(campaign.validate().is_err());
        campaign.restart(now).unwrap();
        assert_eq!(campaign.rate_index, 0);
        assert!(campaign.validate().is_ok());
    }

    #[test]
    fn validation_rejects_bad_configurations() {
        let invalid = |phase, rates: Vec<f64>| {
            matches!(
                CampaignBuilder::new(phase).rates(rates).build(),
                Err(CampaignError::ConfigurationInvalid(_))
            )
        };
        assert!(invalid(PhaseGoal::BitCount { target: 1 }, vec![]));
        assert!(invalid(PhaseGoal::BitCount { target: 1 }, vec![0.0]));
        assert!(invalid(PhaseGoal::BitCount { target: 1 }, vec![1.5]));
        assert!(invalid(PhaseGoal::BitCount { target: 1 }, vec![f64::NAN]));
        assert!(invalid(PhaseGoal::VariableCount { target: 0 }, vec![0.1]));
        assert!(invalid(
            PhaseGoal::Duration {
                span: Duration::ZERO
            },
            vec![0.1]
        ));
    }

    #[test]
    fn parse_rates_accepts_lists_and_rejects_garbage() {
        assert_eq!(parse_rates("0.1,0.01,1").unwrap(), vec![0.1, 0.01, 1.0]);
        assert!(parse_rates("").is_err());
        assert!(parse_rates("0.1, 0.2").is_err());
        assert!(parse_rates("0.1,abc").is_err());
        assert!(parse_rates("0.1,0").is_err());
        assert!(parse_rates("-0.5").is_err());
    }

    #[test]
    fn campaign_json_round_trips() {
        let campaign = CampaignBuilder::new(PhaseGoal::Duration {
            span: Duration::from_millis(1500),
        })
        .rates(vec![0.25, 0.5])
        .report_to("http://collector:5000/express")
        .build()
        .unwrap();
        let json = serde_json::to_string_pretty(&campaign).unwrap();
        assert!(json.contains("\"mode\": \"duration\""));
        let back: Campaign = serde_json::from_str(&json).unwrap();
        assert_eq!(back, campaign);
    }
}
