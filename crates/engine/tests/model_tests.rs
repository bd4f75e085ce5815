//! Model-based Tests
//!
//! Random write sequences checked against a plain map of versions.

use proptest::prelude::*;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tempo_engine::{BranchName, Database, ManualClock, QualifiedKey};

const KEYS: [&str; 3] = ["a", "b", "c"];

/// Versions per key, as committed: (timestamp, value)
#[derive(Default)]
struct Model {
    versions: BTreeMap<&'static str, Vec<(u64, Option<Vec<u8>>)>>,
}

impl Model {
    fn write(&mut self, key: &'static str, ts: u64, value: Option<Vec<u8>>) {
        self.versions.entry(key).or_default().push((ts, value));
    }

    fn get(&self, key: &str, ts: u64) -> Option<Vec<u8>> {
        self.versions
            .get(key)
            .and_then(|versions| versions.iter().rev().find(|(at, _)| *at <= ts))
            .and_then(|(_, value)| value.clone())
    }

    fn keys_at(&self, ts: u64) -> BTreeSet<String> {
        KEYS.iter()
            .filter(|key| self.get(key, ts).is_some())
            .map(|key| key.to_string())
            .collect()
    }
}

fn op_strategy() -> impl Strategy<Value = Vec<(usize, Option<u8>)>> {
    proptest::collection::vec((0..KEYS.len(), proptest::option::of(0u8..4)), 1..16)
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn prop_reads_match_model(ops in op_strategy()) {
        init_tracing();
        let clock = Arc::new(ManualClock::new(0));
        let db = Database::builder().clock(clock.clone()).open().unwrap();
        let master = BranchName::master();
        let mut model = Model::default();

        for (i, (key_index, value)) in ops.iter().enumerate() {
            let ts = 100 * (i as u64 + 1);
            clock.set(ts);
            let key = KEYS[*key_index];
            let value = value.map(|v| vec![v]);
            db.transaction(&master, |tx| match &value {
                Some(bytes) => tx.put("kv", key, bytes.clone()),
                None => tx.remove("kv", key),
            })
            .unwrap();
            model.write(key, ts, value);
        }

        let last = 100 * ops.len() as u64;
        for ts in (0..=last + 100).step_by(50) {
            for key in KEYS {
                let expected = model.get(key, ts);
                let qualified = QualifiedKey::new("kv", key);
                prop_assert_eq!(db.temporal().get(&master, &qualified, ts).unwrap(), expected.clone());
                // second read is served from the cache
                prop_assert_eq!(db.temporal().get(&master, &qualified, ts).unwrap(), expected);
            }
        }

        let tx = db.begin(&master).unwrap();
        prop_assert_eq!(tx.key_set("kv").unwrap(), model.keys_at(last));
    }

    #[test]
    fn prop_child_reads_parent_up_to_branching_timestamp(ops in op_strategy(), fraction in 0u64..=100) {
        let clock = Arc::new(ManualClock::new(0));
        let db = Database::builder().clock(clock.clone()).open().unwrap();
        let master = BranchName::master();
        let mut model = Model::default();

        for (i, (key_index, value)) in ops.iter().enumerate() {
            let ts = 100 * (i as u64 + 1);
            clock.set(ts);
            let key = KEYS[*key_index];
            let value = value.map(|v| vec![v]);
            db.transaction(&master, |tx| match &value {
                Some(bytes) => tx.put("kv", key, bytes.clone()),
                None => tx.remove("kv", key),
            })
            .unwrap();
            model.write(key, ts, value);
        }

        let now = db.branch(&master).unwrap().now;
        let branching = now * fraction / 100;
        let child = BranchName::new("child").unwrap();
        db.create_branch_at(&child, &master, branching).unwrap();

        for ts in (0..=now + 100).step_by(50) {
            for key in KEYS {
                let qualified = QualifiedKey::new("kv", key);
                prop_assert_eq!(
                    db.temporal().get(&child, &qualified, ts).unwrap(),
                    model.get(key, ts.min(branching))
                );
            }
        }
    }
}
