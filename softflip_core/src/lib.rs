pub mod campaign;
pub mod config;
pub mod injector;
pub mod mutator;
pub mod report;
pub mod store;
pub mod value;

pub use campaign::{
    Campaign, CampaignBuilder, CampaignError, CampaignStatus, PhaseCheck, PhaseGoal,
    ReportSinkConfig, parse_rates,
};
pub use config::SoftflipSettings;
pub use injector::{Clock, ControlError, InjectError, Injection, Injector, SystemClock};
pub use mutator::{
    BernoulliTrial, BitFlipMutator, FlipTrial, Mutation, Mutator, QuotientMatchTrial, TrialKind,
};
pub use report::{
    CollectingReporter, DeliveryError, HttpSink, IterationRecord, LogReporter, RateResults,
    Reporter, ResultSink,
};
pub use store::{CampaignStore, JsonFileStore, MemoryStore, StoreError};
pub use value::{CodecError, Injectable, IntWidth, Value, ValueKind};
