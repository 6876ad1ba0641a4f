use crate::campaign::ReportSinkConfig;
use chrono::{DateTime, Local};
use num_bigint::{BigInt, BigUint};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info};

/// Wall-clock stamp format carried by every record.
pub const TIMESTAMP_FORMAT: &str = "%m-%d-%Y %H:%M:%S%.9f";

/// Default bound on how long an injection waits for a remote collector.
pub const DEFAULT_REPORT_TIMEOUT: Duration = Duration::from_millis(2000);

/// Failure to deliver a record to the remote collector. Never fatal.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DeliveryError {
    #[error("Record delivery transport error: {0}")]
    Transport(String),

    #[error("Collector rejected record with HTTP status {status}")]
    Rejected { status: u16 },

    #[error("Collector did not answer within {0:?}")]
    TimedOut(Duration),

    #[error("Record delivery worker exited without a result")]
    Disconnected,

    #[error("Failed to encode record for delivery: {0}")]
    Encoding(String),
}

/// One observed mutation: what the value was, what it became, and which bits moved.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct IterationRecord {
    pub rate: f64,
    pub rate_index: usize,
    pub phase_counter_at_start: u64,
    pub value_kind: String,
    pub previous_bytes: Vec<u8>,
    pub previous_hex: String,
    pub new_bytes: Vec<u8>,
    pub new_hex: String,
    pub flipped_bit_positions: Vec<usize>,
    /// `new - previous`, both read as unsigned big-endian integers.
    #[serde(with = "decimal")]
    pub delta: BigInt,
    pub timestamp: String,
}

impl IterationRecord {
    /// Builds the record of one mutation and derives its hex forms and delta.
    ///
    /// # Arguments
    /// * `rate`: The error rate the mutation ran at.
    /// * `rate_index`: Index of that rate in the campaign's sweep.
    /// * `phase_counter_at_start`: The phase counter before this mutation was counted.
    /// * `value_kind`: Human-readable shape name, see `ValueKind::name`.
    /// * `previous_bytes`: The canonical encoding before mutation.
    /// * `new_bytes`: The encoding after mutation; same length as `previous_bytes`.
    /// * `flipped_bit_positions`: Global bit positions that were inverted.
    /// * `when`: Local wall-clock time, rendered with [`TIMESTAMP_FORMAT`].
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        rate: f64,
        rate_index: usize,
        phase_counter_at_start: u64,
        value_kind: &str,
        previous_bytes: Vec<u8>,
        new_bytes: Vec<u8>,
        flipped_bit_positions: Vec<usize>,
        when: DateTime<Local>,
    ) -> Self {
        let previous = BigInt::from(BigUint::from_bytes_be(&previous_bytes));
        let new = BigInt::from(BigUint::from_bytes_be(&new_bytes));
        Self {
            rate,
            rate_index,
            phase_counter_at_start,
            value_kind: value_kind.to_string(),
            previous_hex: format!("0x{}", hex::encode(&previous_bytes)),
            new_hex: format!("0x{}", hex::encode(&new_bytes)),
            previous_bytes,
            new_bytes,
            flipped_bit_positions,
            delta: new - previous,
            timestamp: when.format(TIMESTAMP_FORMAT).to_string(),
        }
    }
}

mod decimal {
    use num_bigint::BigInt;
    use serde::{Deserialize, Deserializer, Serializer, de::Error};

    pub fn serialize<S: Serializer>(value: &BigInt, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<BigInt, D::Error> {
        let text = String::deserialize(deserializer)?;
        text.parse().map_err(D::Error::custom)
    }
}

/// Delivers a JSON payload to a remote collector. Retry policy, if any,
/// belongs to the implementation.
pub trait ResultSink: Send + Sync {
    /// Returns the HTTP status the collector answered with.
    fn send(&self, endpoint: &str, payload: &serde_json::Value) -> Result<u16, DeliveryError>;
}

/// Posts records over HTTP as a body-less `POST` carrying the JSON record in
/// the `params` query parameter, the shape existing collectors read.
#[derive(Debug, Clone)]
pub struct HttpSink {
    agent: ureq::Agent,
}

impl HttpSink {
    pub fn new(timeout: Duration) -> Self {
        Self {
            agent: ureq::AgentBuilder::new().timeout(timeout).build(),
        }
    }
}

impl Default for HttpSink {
    fn default() -> Self {
        Self::new(DEFAULT_REPORT_TIMEOUT)
    }
}

impl ResultSink for HttpSink {
    fn send(&self, endpoint: &str, payload: &serde_json::Value) -> Result<u16, DeliveryError> {
        let request = self
            .agent
            .post(endpoint)
            .query("params", &payload.to_string());
        match request.call() {
            Ok(response) => Ok(response.status()),
            Err(ureq::Error::Status(status, _)) => Err(DeliveryError::Rejected { status }),
            Err(e) => Err(DeliveryError::Transport(e.to_string())),
        }
    }
}

/// Consumes iteration records as they are produced.
pub trait Reporter: Send {
    /// Handles one record. A returned error is a delivery failure only; the
    /// record has already been logged or retained.
    fn report(
        &mut self,
        record: &IterationRecord,
        sink: &ReportSinkConfig,
    ) -> Result<(), DeliveryError>;
}

/// Logs every record and, when the campaign enables it, forwards it to the
/// remote collector without blocking the caller longer than `timeout`.
pub struct LogReporter {
    sink: Arc<dyn ResultSink>,
    timeout: Duration,
}

impl LogReporter {
    pub fn new(sink: Arc<dyn ResultSink>, timeout: Duration) -> Self {
        Self { sink, timeout }
    }

    pub fn http(timeout: Duration) -> Self {
        Self::new(Arc::new(HttpSink::new(timeout)), timeout)
    }

    fn deliver(&self, endpoint: &str, payload: serde_json::Value) -> Result<u16, DeliveryError> {
        let (tx, rx) = mpsc::sync_channel(1);
        let sink = Arc::clone(&self.sink);
        let endpoint = endpoint.to_string();
        thread::Builder::new()
            .name("softflip-report".to_string())
            .spawn(move || {
                // The receiver may have given up already; nothing to do then.
                let _ = tx.send(sink.send(&endpoint, &payload));
            })
            .map_err(|e| DeliveryError::Transport(format!("Failed to spawn delivery: {e}")))?;

        match rx.recv_timeout(self.timeout) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => Err(DeliveryError::TimedOut(self.timeout)),
            Err(RecvTimeoutError::Disconnected) => Err(DeliveryError::Disconnected),
        }
    }
}

impl std::fmt::Debug for LogReporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogReporter")
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

impl Reporter for LogReporter {
    fn report(
        &mut self,
        record: &IterationRecord,
        sink: &ReportSinkConfig,
    ) -> Result<(), DeliveryError> {
        let payload =
            serde_json::to_value(record).map_err(|e| DeliveryError::Encoding(e.to_string()))?;
        info!(
            target: "softflip::record",
            rate = record.rate,
            flipped = record.flipped_bit_positions.len(),
            record = %payload,
            "bit flip injected"
        );

        if !sink.enabled {
            return Ok(());
        }
        let status = self.deliver(&sink.endpoint, payload)?;
        debug!(endpoint = %sink.endpoint, status, "record delivered");
        Ok(())
    }
}

/// All records observed at one error rate.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "kebab-case")]
pub struct RateResults {
    pub rate: f64,
    pub records: Vec<IterationRecord>,
}

/// Retains every record in memory, grouped by rate-slot in sweep order.
///
/// Suited to bounded exploratory runs; long-running hosts should prefer
/// [`LogReporter`], which keeps nothing.
#[derive(Debug, Default)]
pub struct CollectingReporter {
    results: Vec<(usize, RateResults)>,
}

impl CollectingReporter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn results(&self) -> Vec<&RateResults> {
        self.results.iter().map(|(_, group)| group).collect()
    }

    pub fn into_results(self) -> Vec<RateResults> {
        self.results.into_iter().map(|(_, group)| group).collect()
    }

    pub fn total_records(&self) -> usize {
        self.results.iter().map(|(_, g)| g.records.len()).sum()
    }
}

impl Reporter for CollectingReporter {
    fn report(
        &mut self,
        record: &IterationRecord,
        _sink: &ReportSinkConfig,
    ) -> Result<(), DeliveryError> {
        match self
            .results
            .iter_mut()
            .find(|(index, _)| *index == record.rate_index)
        {
            Some((_, group)) => group.records.push(record.clone()),
            None => self.results.push((
                record.rate_index,
                RateResults {
                    rate: record.rate,
                    records: vec![record.clone()],
                },
            )),
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod test_utils {
    use super::*;
    use parking_lot::Mutex;

    /// Remembers every payload instead of sending it anywhere.
    #[derive(Debug, Default)]
    pub struct RecordingSink {
        pub sent: Mutex<Vec<(String, serde_json::Value)>>,
    }

    impl ResultSink for RecordingSink {
        fn send(&self, endpoint: &str, payload: &serde_json::Value) -> Result<u16, DeliveryError> {
            self.sent.lock().push((endpoint.to_string(), payload.clone()));
            Ok(200)
        }
    }

    #[derive(Debug, Default)]
    pub struct FailingSink;

    impl ResultSink for FailingSink {
        fn send(&self, _endpoint: &str, _payload: &serde_json::Value) -> Result<u16, DeliveryError> {
            Err(DeliveryError::Transport("connection refused".to_string()))
        }
    }

    #[derive(Debug)]
    pub struct SlowSink(pub Duration);

    impl ResultSink for SlowSink {
        fn send(&self, _endpoint: &str, _payload: &serde_json::Value) -> Result<u16, DeliveryError> {
            thread::sleep(self.0);
            Ok(200)
        }
    }
}
