//! The operations a block layer drives an I/O scheduler through.

use serde::{Deserialize, Serialize};

use crate::request::{Bio, Direction, MergeKind, Request, RequestId, Submitter};
use crate::tags::TagGeometry;

/// Result of offering a bio to the queued requests.
#[derive(Debug, Default)]
pub struct BioMergeOutcome {
    /// Request now carrying the bio's sectors, and how the bio was attached.
    pub merged: Option<(RequestId, MergeKind)>,
    /// Request absorbed by a follow-up merge. The caller owns it and must
    /// still finish it.
    pub freed: Option<Request>,
}

impl BioMergeOutcome {
    /// Whether the bio was merged.
    #[inline]
    pub fn is_merged(&self) -> bool {
        self.merged.is_some()
    }
}

/// Capabilities advertised by a scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ElevatorFeatures {
    /// Serializes writes per zone on zoned devices.
    pub zoned: bool,
}

/// Scheduler operations, called concurrently from submission, dispatch and
/// completion contexts.
pub trait Elevator: Send + Sync {
    /// Scheduler name.
    fn name(&self) -> &'static str;

    /// Capability flags.
    fn features(&self) -> ElevatorFeatures;

    /// Per-word tag depth the allocator should use for this submission, or
    /// `None` for the full depth.
    fn limit_depth(&self, direction: Direction, sync: bool, submitter: &Submitter) -> Option<u32>;

    /// Accounts a request that was just given a tag.
    fn prepare_request(&self, rq: &mut Request, submitter: &Submitter);

    /// Queues requests. `at_head` bypasses sorting. Requests merged into an
    /// already queued request are returned.
    fn insert_requests(&self, rqs: Vec<Request>, at_head: bool) -> Vec<Request>;

    /// Next request for hardware. `None` is normal even with work queued.
    fn dispatch_request(&self) -> Option<Request>;

    /// Releases the accounting of a completed or dropped request. Returns
    /// true when the dispatch path should be re-run.
    fn finish_request(&self, rq: &mut Request) -> bool;

    /// Looks for a queued request the bio could be prepended to.
    fn request_merge(&self, bio: &Bio) -> Option<(RequestId, MergeKind)>;

    /// Attempts to merge a bio into a queued request.
    fn bio_merge(&self, bio: &Bio) -> BioMergeOutcome;

    /// Merges queued `absorbed` into queued `survivor`, which must end where
    /// `absorbed` starts. Returns the absorbed request.
    fn requests_merged(&self, survivor: RequestId, absorbed: RequestId) -> Option<Request>;

    /// Takes a request back out of the scheduler.
    fn remove_request(&self, id: RequestId) -> Option<Request>;

    /// Whether anything is queued.
    fn has_work(&self) -> bool;

    /// Adapts to a new tag geometry.
    fn depth_updated(&self, geometry: TagGeometry);

    /// Tears the scheduler down.
    fn exit_sched(&self);
}
