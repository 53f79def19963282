//! Proptest strategies for protocol values.

use proptest::prelude::*;
use sitesync_codec::Scalar;
use sitesync_protocol::{
    AnnouncePresence, Change, Changes, Message, RejectChanges, Seq, SiteId, StartStreaming,
};

/// Strategy for sequence positions, biased toward interesting
/// boundaries (zero, the safe-float edge, u64::MAX).
pub fn arb_seq() -> impl Strategy<Value = Seq> {
    let version = prop_oneof![
        Just(0u64),
        Just(9_007_199_254_740_991u64),
        Just(9_007_199_254_740_992u64),
        Just(u64::MAX),
        any::<u64>(),
    ];
    (version, any::<u32>()).prop_map(|(version, counter)| Seq { version, counter })
}

/// Strategy for site identifiers.
pub fn arb_site_id() -> impl Strategy<Value = SiteId> {
    any::<[u8; 16]>().prop_map(SiteId::from_bytes)
}

/// Strategy for scalar values.
///
/// Floats are restricted to finite values so that generated messages
/// compare equal after a round trip.
pub fn arb_scalar() -> impl Strategy<Value = Scalar> {
    prop_oneof![
        Just(Scalar::Null),
        any::<bool>().prop_map(Scalar::Bool),
        any::<i64>().prop_map(Scalar::Integer),
        prop_oneof![
            Just(9_007_199_254_740_991i64),
            Just(9_007_199_254_740_992i64),
            Just(i64::MAX),
            Just(i64::MIN),
        ]
        .prop_map(Scalar::Integer),
        (-1.0e300f64..1.0e300f64).prop_map(Scalar::Real),
        ".{0,24}".prop_map(Scalar::Text),
        proptest::collection::vec(any::<u8>(), 0..32).prop_map(Scalar::Blob),
    ]
}

/// Strategy for row changes.
pub fn arb_change() -> impl Strategy<Value = Change> {
    (
        "[a-z_]{1,12}",
        proptest::collection::vec(any::<u8>(), 1..16),
        "[a-z_]{1,12}",
        arb_scalar(),
        any::<u64>(),
        any::<u64>(),
        proptest::option::of(arb_site_id()),
        any::<u64>(),
    )
        .prop_map(
            |(table, pk, column, value, col_version, db_version, origin_site, causal_length)| {
                Change {
                    table,
                    pk,
                    column,
                    value,
                    col_version,
                    db_version,
                    origin_site,
                    causal_length,
                }
            },
        )
}

/// Strategy for whole protocol messages, covering every variant.
pub fn arb_message() -> impl Strategy<Value = Message> {
    let announce = (
        arb_site_id(),
        proptest::collection::vec((arb_site_id(), arb_seq()), 0..8),
        ".{0,16}",
        ".{0,8}",
    )
        .prop_map(|(sender, last_seens, schema_name, schema_version)| {
            Message::AnnouncePresence(AnnouncePresence {
                sender,
                last_seens,
                schema_name,
                schema_version,
            })
        });

    let changes = (
        arb_site_id(),
        arb_seq(),
        proptest::collection::vec(arb_change(), 0..8),
    )
        .prop_map(|(sender, since, changes)| {
            Message::Changes(Changes {
                sender,
                since,
                changes,
            })
        });

    let reject = (arb_site_id(), arb_seq()).prop_map(|(whose, since)| {
        Message::RejectChanges(RejectChanges { whose, since })
    });

    let start = (
        arb_seq(),
        proptest::collection::vec(arb_site_id(), 0..4),
        any::<bool>(),
    )
        .prop_map(|(since, exclude_sites, local_only)| {
            Message::StartStreaming(StartStreaming {
                since,
                exclude_sites,
                local_only,
            })
        });

    prop_oneof![announce, changes, reject, start]
}
