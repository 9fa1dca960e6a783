//! Latency thresholds and the region-aware scorer.
//!
//! Base values describe acceptable operation latency measured from the
//! US region; other regions scale them by a fixed multiplier. Group
//! operations carry one base value per bucketed member count and the
//! scorer snaps a requested size to the closest bucket, preferring the
//! smaller bucket on ties. Unknown operations fall back to a per-type
//! default rather than failing the run.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use tracing::warn;

/// Minimum acceptable delivery rate, in percent. Not region-scaled:
/// distance excuses latency, never loss.
pub const DELIVERY_RATE_FLOOR: f64 = 99.9;
/// Minimum acceptable in-order rate, in percent. Not region-scaled.
pub const ORDER_RATE_FLOOR: f64 = 95.0;

const DEFAULT_CORE_MS: u64 = 2_000;
const DEFAULT_GROUP_MS: u64 = 10_000;
const DEFAULT_NETWORK_MS: u64 = 500;
const DEFAULT_GROUP_SIZE: u32 = 10;

const CORE_THRESHOLDS: &[(&str, u64)] = &[
    ("clientcreate", 2_000),
    ("inboxstate", 600),
    ("canmessage", 1_000),
    ("createdm", 1_200),
    ("senddm", 350),
    ("receivedm", 700),
    ("sync", 900),
];

const NETWORK_THRESHOLDS: &[(&str, u64)] = &[
    ("dns_lookup", 100),
    ("tcp_connection", 150),
    ("tls_handshake", 250),
    ("server_call", 400),
    ("processing", 150),
];

/// Member-count buckets shared by every group operation.
pub const GROUP_SIZE_BUCKETS: &[u32] = &[5, 10, 20, 50, 100];

const GROUP_THRESHOLDS: &[(&str, [u64; 5])] = &[
    ("creategroup", [2_000, 2_600, 3_800, 6_500, 11_000]),
    ("syncgroup", [800, 1_100, 1_700, 3_200, 5_500]),
    ("updategroupname", [600, 800, 1_100, 1_900, 3_200]),
    ("addmembers", [900, 1_200, 1_800, 3_400, 5_800]),
    ("removemembers", [900, 1_200, 1_800, 3_400, 5_800]),
    ("sendgroupmessage", [400, 500, 700, 1_100, 1_800]),
    ("receivegroupmessage", [800, 1_000, 1_400, 2_300, 3_800]),
];

/// Broad operation family, selecting which base table applies.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum OperationType {
    /// Single-client operations: client create, DM send, sync.
    Core,
    /// Group operations whose cost scales with member count.
    Group,
    /// Transport-phase measurements (DNS, TCP, TLS, server time).
    Network,
}

/// Geographic region the run executes from.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Region {
    #[default]
    Us,
    Europe,
    Asia,
    SouthAmerica,
}

impl Region {
    /// Latency scale applied to every duration threshold.
    #[must_use]
    pub fn multiplier(&self) -> f64 {
        match self {
            Region::Us => 1.0,
            Region::Europe => 1.2,
            Region::Asia => 1.5,
            Region::SouthAmerica => 1.8,
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Region::Us => "us",
            Region::Europe => "europe",
            Region::Asia => "asia",
            Region::SouthAmerica => "south-america",
        }
    }
}

impl fmt::Display for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Region {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "us" => Ok(Region::Us),
            "europe" => Ok(Region::Europe),
            "asia" => Ok(Region::Asia),
            "south-america" | "southamerica" => Ok(Region::SouthAmerica),
            other => Err(format!("unknown region {other:?}")),
        }
    }
}

/// Lowercase an operation name and split off a trailing `-<count>`
/// member-count suffix if present.
#[must_use]
pub fn normalize_operation(operation: &str) -> (String, Option<u32>) {
    let lowered = operation.trim().to_lowercase();
    if let Some((base, suffix)) = lowered.rsplit_once('-') {
        if let Ok(count) = suffix.parse::<u32>() {
            return (base.to_owned(), Some(count));
        }
    }
    (lowered, None)
}

/// Infer the operation family from its name and member count.
///
/// Known transport-phase names classify as `Network`; anything carrying
/// a member count, or named in the group table, classifies as `Group`;
/// the rest are `Core`.
#[must_use]
pub fn classify_operation(operation: &str, member_count: Option<u32>) -> OperationType {
    let (base_op, suffix_count) = normalize_operation(operation);
    if lookup_flat(NETWORK_THRESHOLDS, &base_op).is_some() {
        OperationType::Network
    } else if member_count.or(suffix_count).is_some()
        || GROUP_THRESHOLDS.iter().any(|(name, _)| *name == base_op)
    {
        OperationType::Group
    } else {
        OperationType::Core
    }
}

/// Threshold in milliseconds for one operation, scaled for `region`.
///
/// `member_count` wins over a `-<count>` suffix embedded in the name;
/// when neither is given, group lookups assume a ten-member group.
#[must_use]
pub fn threshold_for(
    operation: &str,
    op_type: OperationType,
    member_count: Option<u32>,
    region: Region,
) -> u64 {
    let (base_op, suffix_count) = normalize_operation(operation);
    let base = match op_type {
        OperationType::Core => lookup_flat(CORE_THRESHOLDS, &base_op).unwrap_or_else(|| {
            warn!(operation = %base_op, "no core threshold, using default");
            DEFAULT_CORE_MS
        }),
        OperationType::Network => lookup_flat(NETWORK_THRESHOLDS, &base_op).unwrap_or_else(|| {
            warn!(operation = %base_op, "no network threshold, using default");
            DEFAULT_NETWORK_MS
        }),
        OperationType::Group => {
            let target = member_count
                .or(suffix_count)
                .unwrap_or(DEFAULT_GROUP_SIZE);
            lookup_group(&base_op, target).unwrap_or_else(|| {
                warn!(operation = %base_op, "no group threshold, using default");
                DEFAULT_GROUP_MS
            })
        }
    };
    scale(base, region)
}

/// Whether a measured duration is within the scaled threshold.
#[must_use]
pub fn within_threshold(
    measured_ms: f64,
    operation: &str,
    op_type: OperationType,
    member_count: Option<u32>,
    region: Region,
) -> bool {
    measured_ms <= threshold_for(operation, op_type, member_count, region) as f64
}

fn scale(base_ms: u64, region: Region) -> u64 {
    (base_ms as f64 * region.multiplier()).round() as u64
}

fn lookup_flat(table: &[(&str, u64)], operation: &str) -> Option<u64> {
    table
        .iter()
        .find(|(name, _)| *name == operation)
        .map(|(_, ms)| *ms)
}

fn lookup_group(operation: &str, target: u32) -> Option<u64> {
    let (_, by_size) = GROUP_THRESHOLDS
        .iter()
        .find(|(name, _)| *name == operation)?;
    let index = closest_bucket(target);
    Some(by_size[index])
}

/// Index of the bucket closest to `target`; ties resolve to the
/// smaller bucket so thresholds never loosen on ambiguity.
fn closest_bucket(target: u32) -> usize {
    let mut best = 0usize;
    for (index, size) in GROUP_SIZE_BUCKETS.iter().enumerate() {
        let best_size = GROUP_SIZE_BUCKETS[best];
        if size.abs_diff(target) < best_size.abs_diff(target) {
            best = index;
        }
    }
    best
}
