//! Wire-layout definitions shared between the FineLame user-space daemon and
//! the in-kernel instrumentation program.
//!
//! The instrumentation program is plain C compiled to BPF bytecode; the
//! structs below mirror its map value layouts byte for byte. Every type is
//! `#[repr(C)]` with explicit padding so the user side can read map values
//! with a plain pointer cast.

use bytemuck::{Pod, Zeroable};

/// Capacity of the per-request distance vector in [`OutlierScores`].
///
/// The instrumentation program sizes its scoring loop with the `$K` macro,
/// but the map value itself always carries this many slots so the layout is
/// independent of the configured cluster count. `model_params.k` must not
/// exceed this.
pub const MAX_CLUSTERS: usize = 8;

/// Length of the inline message buffer in a [`Notification`].
pub const NOTIFY_MSG_LEN: usize = 32;

/// Names of the maps the instrumentation program must export.
pub mod maps {
    /// `rid -> RequestFingerprint`, live request accounting.
    pub const DATAPOINTS: &str = "datapoints";
    /// `u64[2 * features]`, packed scaled `(mean, std)` pairs.
    pub const TRAIN_SET_PARAMS: &str = "train_set_params";
    /// `u64[1]`, precomputed normalization offset.
    pub const CENTROID_OFFSET: &str = "centroid_offset";
    /// `i64[k]`, signed L1 sum of each scaled centroid.
    pub const CENTROID_L1S: &str = "centroid_l1s";
    /// `u64[k]`, per-cluster outlier threshold. A non-zero entry is the
    /// readiness signal that scoring may begin.
    pub const CLUSTER_THRESHOLDS: &str = "cluster_thresholds";
    /// `rid -> OutlierScores`, scoring state for classified requests.
    pub const OUTLIER_SCORES: &str = "outlier_scores_m";
    /// Perf event channel for ad-hoc diagnostics.
    pub const NOTIFICATION_EVT: &str = "notification_evt";
}

/// Per-request resource fingerprint, accumulated by the data plane between a
/// request's entry and exit probes.
///
/// `completion_ts` is zero while the request is live; the exit probe stamps
/// it, freezing the counter vector.
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct RequestFingerprint {
    pub origin_ts: u64,
    pub completion_ts: u64,
    /// Program-counter value where the request was first observed. Opaque.
    pub origin_ip: u64,

    pub cputime: u64,
    pub allocs: u64,
    pub page_faults: u64,
    pub cache_misses: u64,
    pub cache_refs: u64,
    pub sent_bytes: u64,
    pub recv_bytes: u64,
}

impl RequestFingerprint {
    /// Counter fields that configuration may select as features, in struct
    /// order.
    pub const COUNTER_FIELDS: [&'static str; 7] = [
        "cputime",
        "allocs",
        "page_faults",
        "cache_misses",
        "cache_refs",
        "sent_bytes",
        "recv_bytes",
    ];

    /// Look up a counter by its configured field name.
    pub fn counter(&self, field: &str) -> Option<u64> {
        match field {
            "cputime" => Some(self.cputime),
            "allocs" => Some(self.allocs),
            "page_faults" => Some(self.page_faults),
            "cache_misses" => Some(self.cache_misses),
            "cache_refs" => Some(self.cache_refs),
            "sent_bytes" => Some(self.sent_bytes),
            "recv_bytes" => Some(self.recv_bytes),
            _ => None,
        }
    }

    /// True once the exit probe has stamped the completion timestamp.
    pub fn is_frozen(&self) -> bool {
        self.completion_ts != 0
    }
}

/// Scoring state the data plane keeps for every request classified after
/// model publication.
#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
pub struct OutlierScores {
    /// Signed L1 distance of the normalized fingerprint to each centroid.
    /// Only the first `k` slots are meaningful.
    pub distances: [i64; MAX_CLUSTERS],
    pub detection_ts: u64,
    pub detection_cputime: u64,
    pub last_ts: u64,
    pub is_outlier: u32,
    pub _pad: u32,
}

impl OutlierScores {
    /// Index and signed value of the distance with the smallest magnitude
    /// among the first `k` slots.
    pub fn nearest(&self, k: usize) -> (usize, i64) {
        let k = k.clamp(1, MAX_CLUSTERS);
        let mut best = 0;
        for i in 1..k {
            if self.distances[i].unsigned_abs() < self.distances[best].unsigned_abs() {
                best = i;
            }
        }
        (best, self.distances[best])
    }
}

/// Diagnostic message emitted by the data plane on `notification_evt`.
///
/// `load` is the bit pattern of either an `i64` or an `f64`, selected by
/// `kind` (see the tag constants).
#[repr(C)]
#[derive(Copy, Clone, Debug, Pod, Zeroable)]
pub struct Notification {
    pub kind: i32,
    pub _pad: u32,
    pub msg_size: u64,
    pub msg: [u8; NOTIFY_MSG_LEN],
    pub load: u64,
}

/// `kind` tag: message only.
pub const NOTIFY_KIND_STR: i32 = 0;
/// `kind` tag: message plus integer payload.
pub const NOTIFY_KIND_INT: i32 = 1;
/// `kind` tag: message plus floating payload.
pub const NOTIFY_KIND_FLOAT: i32 = 2;
