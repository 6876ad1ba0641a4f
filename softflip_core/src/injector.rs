use crate::campaign::{Campaign, CampaignError, CampaignStatus, PhaseCheck};
use crate::config::{InjectorSettings, SoftflipSettings};
use crate::mutator::{BitFlipMutator, FlipTrial, Mutator};
use crate::report::{DeliveryError, IterationRecord, LogReporter, Reporter};
use crate::store::{CampaignStore, JsonFileStore, StoreError};
use crate::value::{Injectable, Value};
use chrono::{DateTime, Local, Utc};
use parking_lot::Mutex;
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use rand_core::SeedableRng;
use std::any::Any;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Source of wall-clock time for duration-based phases.
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// What one call to [`Injector::inject`] did.
#[derive(Debug, Clone, PartialEq)]
pub struct Injection {
    /// The value handed back to the host; same shape as the input.
    pub value: Value,
    /// Present only when at least one bit flipped.
    pub record: Option<IterationRecord>,
    /// Campaign status after the call.
    pub status: CampaignStatus,
    /// Set when the record could not be delivered to the remote collector.
    pub delivery_failure: Option<DeliveryError>,
}

#[derive(Error, Debug)]
pub enum InjectError {
    /// The injection took effect but the campaign's progress is not durable.
    #[error("Campaign progress could not be persisted: {source}")]
    Persistence {
        injection: Box<Injection>,
        source: StoreError,
    },
}

#[derive(Error, Debug)]
pub enum ControlError {
    #[error(transparent)]
    Campaign(#[from] CampaignError),
    #[error("Campaign state could not be persisted: {0}")]
    Persistence(#[from] StoreError),
}

struct EngineState {
    campaign: Campaign,
    mutator: BitFlipMutator<ChaCha8Rng>,
    rng: ChaCha8Rng,
    reporter: Box<dyn Reporter>,
}

/// The fault-injection engine a host calls into.
///
/// One mutex guards the whole check-advance-mutate-report-persist sequence, so a
/// single injector may be shared between threads.
pub struct Injector {
    state: Mutex<EngineState>,
    store: Arc<dyn CampaignStore>,
    clock: Arc<dyn Clock>,
    poll_controls: bool,
}

impl Injector {
    /// Creates an injector that resumes `campaign`.
    ///
    /// A campaign that claims to be running but fails validation is halted
    /// here, so it passes values through until an operator fixes it.
    ///
    /// # Arguments
    /// * `campaign`: The campaign to drive, usually just loaded from `store`.
    /// * `store`: Where progress is saved after every mutating call and control change.
    /// * `reporter`: Receives one `IterationRecord` per mutation that flipped bits.
    /// * `settings`: Flip trial, RNG seed and whether to poll the store for controls.
    pub fn new(
        mut campaign: Campaign,
        store: Arc<dyn CampaignStore>,
        reporter: Box<dyn Reporter>,
        settings: &InjectorSettings,
    ) -> Self {
        let rng = match settings.seed {
            Some(seed) => ChaCha8Rng::seed_from_u64(seed),
            None => ChaCha8Rng::seed_from_u64(rand::rng().random()),
        };
        if let Err(e) = check_runnable(&campaign) {
            warn!(error = %e, "campaign cannot run as loaded; halting it");
            campaign.running = false;
            campaign.restart_requested = false;
        }
        Self {
            state: Mutex::new(EngineState {
                campaign,
                mutator: BitFlipMutator::with_kind(settings.trial),
                rng,
                reporter,
            }),
            store,
            clock: Arc::new(SystemClock),
            poll_controls: settings.poll_controls,
        }
    }

    /// Builds an injector over the JSON store and HTTP reporter named by `settings`,
    /// resuming whatever campaign the store holds.
    pub fn from_settings(settings: &SoftflipSettings) -> Result<Self, StoreError> {
        let store = Arc::new(JsonFileStore::new(settings.store.path.clone()));
        let campaign = store.load_or_default()?;
        let reporter = Box::new(LogReporter::http(settings.reporter.timeout()));
        Ok(Self::new(campaign, store, reporter, &settings.injector))
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_trial(mut self, trial: Box<dyn FlipTrial<ChaCha8Rng> + Send>) -> Self {
        self.state.get_mut().mutator = BitFlipMutator::new(trial);
        self
    }

    /// A snapshot of the campaign as the injector currently sees it.
    pub fn campaign(&self) -> Campaign {
        self.state.lock().campaign.clone()
    }

    pub fn status(&self) -> CampaignStatus {
        self.state.lock().campaign.status()
    }

    pub fn start(&self) -> Result<(), ControlError> {
        self.control(|campaign, now| campaign.start(now))
    }

    pub fn stop(&self) -> Result<(), ControlError> {
        self.control(|campaign, _| {
            campaign.stop();
            Ok(())
        })
    }

    pub fn restart(&self) -> Result<(), ControlError> {
        self.control(|campaign, now| campaign.restart(now))
    }

    /// Queues a restart that the next injection applies, whichever process
    /// performs it.
    pub fn request_restart(&self) -> Result<(), ControlError> {
        self.control(|campaign, _| {
            campaign.validate_parameters()?;
            campaign.request_restart();
            Ok(())
        })
    }

    fn control(
        &self,
        change: impl FnOnce(&mut Campaign, DateTime<Utc>) -> Result<(), CampaignError>,
    ) -> Result<(), ControlError> {
        let mut state = self.state.lock();
        change(&mut state.campaign, self.clock.now())?;
        self.store.save(&state.campaign)?;
        Ok(())
    }

    /// Offers `value` for possible corruption at the active error rate.
    ///
    /// Never fails on the value path: unsupported or unencodable values, a stopped
    /// or completed campaign, and passes that flip nothing all return the input
    /// unchanged. The only error is a failed save, which still carries the result.
    pub fn inject(&self, value: Value) -> Result<Injection, InjectError> {
        let mut state = self.state.lock();
        let now = self.clock.now();
        let mut dirty = false;

        if self.poll_controls {
            self.sync_controls(&mut state.campaign);
        }

        match state.campaign.apply_pending_restart(now) {
            Ok(true) => {
                info!("applied pending campaign restart");
                dirty = true;
            }
            Ok(false) => {}
            Err(e) => {
                warn!(error = %e, "discarding restart request for invalid campaign");
                state.campaign.restart_requested = false;
                state.campaign.running = false;
                dirty = true;
            }
        }

        if !state.campaign.is_running() {
            return self.finish(&state.campaign, dirty, passthrough(value, &state.campaign));
        }

        let rate = match state.campaign.check_phase(now) {
            PhaseCheck::Active { rate } => rate,
            PhaseCheck::Advanced { rate, .. } => {
                dirty = true;
                rate
            }
            PhaseCheck::Completed => {
                info!(
                    rates = state.campaign.error_rates.len(),
                    "campaign completed; injector is now pass-through"
                );
                return self.finish(&state.campaign, true, passthrough(value, &state.campaign));
            }
        };

        let kind = value.kind();
        let bytes = match value.encode() {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(error = %e, "value cannot be encoded; passing through unchanged");
                return self.finish(&state.campaign, dirty, passthrough(value, &state.campaign));
            }
        };

        let mutation = {
            let EngineState { mutator, rng, .. } = &mut *state;
            mutator.mutate(&bytes, rate, rng)
        };
        if mutation.is_noop() {
            return self.finish(&state.campaign, dirty, passthrough(value, &state.campaign));
        }

        let mutated = match Value::decode(&mutation.bytes, kind) {
            Ok(mutated) => mutated,
            Err(e) => {
                warn!(error = %e, "mutated bytes cannot be decoded; passing through unchanged");
                return self.finish(&state.campaign, dirty, passthrough(value, &state.campaign));
            }
        };

        let rate_index = state.campaign.rate_index;
        let counter_at_start = state.campaign.phase_counter;
        state.campaign.record_flips(mutation.flipped.len());
        debug!(
            rate,
            rate_index,
            flipped = mutation.flipped.len(),
            phase_counter = state.campaign.phase_counter,
            "mutation applied"
        );

        let record = IterationRecord::new(
            rate,
            rate_index,
            counter_at_start,
            kind.name(),
            bytes,
            mutation.bytes,
            mutation.flipped,
            now.with_timezone(&Local),
        );

        let delivery_failure = {
            let EngineState {
                reporter, campaign, ..
            } = &mut *state;
            reporter.report(&record, &campaign.report_sink).err()
        };
        if let Some(e) = &delivery_failure {
            warn!(error = %e, "failed to deliver iteration record");
        }

        let injection = Injection {
            value: mutated,
            record: Some(record),
            status: state.campaign.status(),
            delivery_failure,
        };
        self.finish(&state.campaign, true, injection)
    }

    /// Typed entry point: always hands back a `T`, the original on any failure.
    /// Persistence failures are logged rather than returned.
    pub fn inject_as<T: Injectable + Clone>(&self, value: T) -> T {
        let original = value.clone();
        let injection = match self.inject(value.into_value()) {
            Ok(injection) => injection,
            Err(InjectError::Persistence { injection, .. }) => *injection,
        };
        T::from_value(injection.value).unwrap_or(original)
    }

    /// Entry point for dynamically typed hosts. Values of an unsupported type
    /// come back untouched.
    pub fn inject_any(&self, value: Box<dyn Any + Send>) -> Box<dyn Any + Send> {
        let parsed = match Value::from_any(&*value) {
            Ok(parsed) => parsed,
            Err(e) => {
                debug!(error = %e, "skipping injection");
                return value;
            }
        };
        let injection = match self.inject(parsed) {
            Ok(injection) => injection,
            Err(InjectError::Persistence { injection, .. }) => *injection,
        };
        injection.value.into_any()
    }

    fn finish(
        &self,
        campaign: &Campaign,
        dirty: bool,
        injection: Injection,
    ) -> Result<Injection, InjectError> {
        if !dirty {
            return Ok(injection);
        }
        match self.store.save(campaign) {
            Ok(()) => Ok(injection),
            Err(source) => {
                error!(error = %source, "failed to persist campaign progress");
                Err(InjectError::Persistence {
                    injection: Box::new(injection),
                    source,
                })
            }
        }
    }

    /// Picks up start, stop and restart commands written to the store by
    /// another process. In-memory progress stays authoritative otherwise, and a
    /// stored campaign that cannot run is never adopted.
    fn sync_controls(&self, current: &mut Campaign) {
        let stored = match self.store.load() {
            Ok(stored) => stored,
            Err(StoreError::NotFound(_)) => return,
            Err(e) => {
                warn!(error = %e, "could not poll campaign controls; keeping in-memory state");
                return;
            }
        };
        let adopt = stored.restart_requested
            || stored.restart_generation > current.restart_generation
            || (!current.is_running() && stored.is_running());
        if adopt {
            if let Err(e) = check_runnable(&stored) {
                warn!(error = %e, "ignoring invalid campaign in store");
                return;
            }
            debug!(status = %stored.status(), "adopting campaign from store");
            *current = stored;
        } else if current.is_running() && !stored.running {
            debug!("campaign stopped through store");
            current.stop();
        }
    }
}

/// Whether `campaign` may drive injections as it stands. A pending restart
/// discards progress, so only its parameters are checked.
fn check_runnable(campaign: &Campaign) -> Result<(), CampaignError> {
    if campaign.restart_requested {
        campaign.validate_parameters()
    } else if campaign.is_running() {
        campaign.validate()
    } else {
        Ok(())
    }
}

fn passthrough(value: Value, campaign: &Campaign) -> Injection {
    Injection {
        value,
        record: None,
        status: campaign.status(),
        delivery_failure: None,
    }
}
