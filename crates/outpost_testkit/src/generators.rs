//! Property-based test generators using proptest.
//!
//! Also home to [`SyntheticIdSpace`], an in-memory [`ChunkSource`] for
//! planning over id sets too large to load into a store.

use outpost_core::{
    ChunkSource, CoreResult, IdStats, Payload, PrefixBucket, RecordId, RecordType, Tick, TickWindow, NEVER_SYNCED,
};
use outpost_sync_protocol::WireRecord;
use proptest::prelude::*;
use serde_json::Value;
use std::collections::BTreeSet;

/// Strategy for generating record ids (short, lower-case alphanumeric).
pub fn record_id_strategy() -> impl Strategy<Value = RecordId> {
    prop::string::string_regex("[a-z0-9]{1,12}")
        .expect("Invalid regex")
        .prop_map(RecordId::from)
}

/// Strategy for generating sets of distinct ids, sorted.
pub fn id_set_strategy(max_len: usize) -> impl Strategy<Value = Vec<RecordId>> {
    prop::collection::btree_set(record_id_strategy(), 0..max_len).prop_map(|ids| ids.into_iter().collect())
}

/// Strategy for generating ticks, including the never-synced sentinel.
pub fn tick_strategy() -> impl Strategy<Value = Tick> {
    prop_oneof![Just(NEVER_SYNCED), 0..10_000i64]
}

/// Strategy for generating `(since, until]` windows.
pub fn tick_window_strategy() -> impl Strategy<Value = TickWindow> {
    (tick_strategy(), 0..1_000i64).prop_map(|(since, span)| TickWindow::between(since, since + span))
}

/// Strategy for generating flat JSON payloads.
pub fn payload_strategy() -> impl Strategy<Value = Payload> {
    let value = prop_oneof![
        any::<bool>().prop_map(Value::from),
        any::<i32>().prop_map(Value::from),
        prop::string::string_regex("[a-zA-Z ]{0,16}")
            .expect("Invalid regex")
            .prop_map(Value::from),
    ];
    prop::collection::btree_map(
        prop::string::string_regex("[a-z_]{1,10}").expect("Invalid regex"),
        value,
        0..6,
    )
    .prop_map(|fields| fields.into_iter().collect())
}

/// Strategy for generating wire records of `record_type`.
pub fn wire_record_strategy(record_type: &'static str) -> impl Strategy<Value = WireRecord> {
    (record_id_strategy(), payload_strategy(), any::<bool>(), 0..10_000i64).prop_map(
        move |(record_id, data, is_deleted, tick)| WireRecord {
            record_type: RecordType::from(record_type),
            record_id,
            data,
            is_deleted,
            deleted_at: None,
            updated_at_sync_tick: tick,
        },
    )
}

/// Strategy for generating a push batch in arbitrary type order.
///
/// Every encounter names a patient from the same batch, so a receiver that
/// applies in dependency order accepts the whole batch.
pub fn patient_batch_strategy() -> impl Strategy<Value = Vec<WireRecord>> {
    prop::collection::btree_set(record_id_strategy(), 1..6)
        .prop_flat_map(|patients| {
            let patients: Vec<RecordId> = patients.into_iter().collect();
            let encounters = prop::collection::vec((0..patients.len(), payload_strategy()), 0..10);
            (Just(patients), encounters)
        })
        .prop_map(|(patients, encounters)| {
            let mut records: Vec<WireRecord> = patients
                .iter()
                .map(|id| WireRecord {
                    record_type: "patients".into(),
                    record_id: id.clone(),
                    data: Payload::new(),
                    is_deleted: false,
                    deleted_at: None,
                    updated_at_sync_tick: 1,
                })
                .collect();
            for (i, (owner, mut data)) in encounters.into_iter().enumerate() {
                data.insert("patient_id".into(), Value::from(patients[owner].as_str()));
                records.push(WireRecord {
                    record_type: "encounters".into(),
                    record_id: RecordId::from(format!("e{i}")),
                    data,
                    is_deleted: false,
                    deleted_at: None,
                    updated_at_sync_tick: 1,
                });
            }
            records
        })
        .prop_shuffle()
}

/// Sorted, distinct ids answering the planner's aggregate queries.
///
/// Every id counts as changed in every window.
#[derive(Debug, Clone, Default)]
pub struct SyntheticIdSpace {
    ids: Vec<RecordId>,
}

impl SyntheticIdSpace {
    /// Builds the space from arbitrary ids; duplicates collapse.
    pub fn from_ids<I>(ids: I) -> Self
    where
        I: IntoIterator<Item = RecordId>,
    {
        let ids: BTreeSet<RecordId> = ids.into_iter().collect();
        Self {
            ids: ids.into_iter().collect(),
        }
    }

    /// `count` zero-padded decimal ids (`"0000042"`), `width` digits wide.
    pub fn dense(count: usize, width: usize) -> Self {
        Self {
            ids: (0..count).map(|i| RecordId::from(format!("{i:0width$}"))).collect(),
        }
    }

    /// The ids, in order.
    pub fn ids(&self) -> &[RecordId] {
        &self.ids
    }

    /// Number of ids.
    pub fn len(&self) -> usize {
        self.ids.len()
    }

    /// Returns true if the space holds no ids.
    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }
}

impl ChunkSource for SyntheticIdSpace {
    fn id_stats(&self, _: &RecordType, _: TickWindow) -> CoreResult<IdStats> {
        Ok(IdStats {
            count: self.ids.len(),
            min_id: self.ids.first().cloned(),
            max_id: self.ids.last().cloned(),
        })
    }

    fn prefix_buckets(
        &self,
        _: &RecordType,
        _: TickWindow,
        prefix: &str,
        len: usize,
    ) -> CoreResult<Vec<PrefixBucket>> {
        let start = self.ids.partition_point(|id| id.as_str() < prefix);
        let mut buckets: Vec<PrefixBucket> = Vec::new();
        for id in self.ids[start..].iter().take_while(|id| id.as_str().starts_with(prefix)) {
            let key: String = id.as_str().chars().take(len).collect();
            match buckets.last_mut() {
                Some(bucket) if bucket.prefix == key => bucket.count += 1,
                _ => buckets.push(PrefixBucket {
                    prefix: key,
                    count: 1,
                    first_id: id.clone(),
                }),
            }
        }
        Ok(buckets)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dense_ids_sort_numerically() {
        let space = SyntheticIdSpace::dense(12, 3);
        assert_eq!(space.len(), 12);
        assert_eq!(space.ids()[0].as_str(), "000");
        assert_eq!(space.ids()[11].as_str(), "011");
        assert!(space.ids().windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn prefix_buckets_group_by_leading_characters() {
        let space = SyntheticIdSpace::from_ids(["a1", "a2", "b1", "ab"].map(RecordId::from));
        let buckets = space
            .prefix_buckets(&"t".into(), TickWindow::after(NEVER_SYNCED), "", 1)
            .unwrap();
        let summary: Vec<(&str, usize)> = buckets.iter().map(|b| (b.prefix.as_str(), b.count)).collect();
        assert_eq!(summary, [("a", 3), ("b", 1)]);

        let nested = space
            .prefix_buckets(&"t".into(), TickWindow::after(NEVER_SYNCED), "a", 2)
            .unwrap();
        assert_eq!(nested.len(), 3);
        assert_eq!(nested[0].first_id.as_str(), "a1");
    }

    proptest! {
        #[test]
        fn windows_are_well_formed(window in tick_window_strategy()) {
            prop_assert!(window.until.unwrap() >= window.since);
        }

        #[test]
        fn batches_reference_patients_they_carry(batch in patient_batch_strategy()) {
            let patients: BTreeSet<&str> = batch
                .iter()
                .filter(|r| r.record_type.as_str() == "patients")
                .map(|r| r.record_id.as_str())
                .collect();
            for record in batch.iter().filter(|r| r.record_type.as_str() == "encounters") {
                let owner = record.data["patient_id"].as_str().unwrap();
                prop_assert!(patients.contains(owner));
            }
        }
    }
}
