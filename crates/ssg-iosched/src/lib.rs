#![warn(missing_docs)]

//! SSG block I/O scheduler: deadline dispatch, zone write locking, cgroup and
//! thread-group admission throttling
//!
//! The scheduler sits between a block-device submission path and a fixed-size
//! hardware tag pool. It orders pending requests per direction by sector and
//! by arrival, chooses what hardware gets next, and shrinks the allocator's
//! effective depth for submitters (cgroups, asynchronous writers, greedy
//! thread groups) that already hold their share of tags.

pub mod admission;
pub mod cgroup;
pub mod clock;
pub mod config;
pub mod elevator;
pub mod error;
pub mod introspect;
pub mod ledger;
pub mod logging;
pub mod ordered_queue;
pub mod request;
pub mod scheduler;
pub mod stats;
pub mod tags;
pub mod tunables;
pub mod zone;

pub use admission::{AdmissionController, AdmissionLimits, AdmissionStats};
pub use cgroup::{
    CgroupId, CgroupThrottleInstance, CgroupThrottlePolicy, CgroupThrottleRegistry,
    CgroupThrottleStat, DeviceId, ThrottleLimits,
};
pub use clock::{Clock, ManualClock, MonotonicClock};
pub use config::SsgConfig;
pub use elevator::{BioMergeOutcome, Elevator, ElevatorFeatures};
pub use error::{SchedError, SchedResult};
pub use introspect::DebugSnapshot;
pub use ledger::{LedgerEntry, Preparation, RequestLedger};
pub use logging::init_tracing;
pub use ordered_queue::OrderedQueue;
pub use request::{Bio, Direction, MergeKind, Request, RequestId, Submitter, Tag, SECTOR_SIZE};
pub use scheduler::SsgScheduler;
pub use stats::{
    CompletionEvent, NullStatsSink, StatsSink, TgroupIoStats, TgroupTotals, TracingStatsSink,
};
pub use tags::{BitmapTagAllocator, TagAllocator, TagGeometry};
pub use tunables::{Attribute, Tunables};
pub use zone::ZonedConfig;
