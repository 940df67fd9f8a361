// tests/property/resource_invariants_test.rs

//! Property-based tests for resource invariants under random acquire/release sequences

use flomd::core::resource::{
    Acquire, HolderId, LockMode, LockRequest, LockResource, NumericResource, SequenceResource,
    SimpleResource,
};
use proptest::prelude::*;
use std::collections::{HashMap, HashSet};

#[derive(Debug, Clone)]
enum Op {
    Acquire { holder: HolderId, mode: LockMode, quantity: u32, wait: bool },
    Release { holder: HolderId, rollback: bool },
}

fn mode_strategy() -> impl Strategy<Value = LockMode> {
    prop_oneof![
        Just(LockMode::NullLock),
        Just(LockMode::ConcurrentRead),
        Just(LockMode::ConcurrentWrite),
        Just(LockMode::ProtectedRead),
        Just(LockMode::ProtectedWrite),
        Just(LockMode::Exclusive),
    ]
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        (1u64..8, mode_strategy(), 1u32..5, any::<bool>()).prop_map(
            |(holder, mode, quantity, wait)| Op::Acquire { holder, mode, quantity, wait }
        ),
        (1u64..8, any::<bool>()).prop_map(|(holder, rollback)| Op::Release { holder, rollback }),
    ]
}

fn request(name: &str, mode: LockMode, quantity: u32, wait: bool) -> LockRequest {
    LockRequest {
        name: name.to_string(),
        mode,
        wait,
        quantity,
    }
}

/// Tracks what the resource reported as granted, held and queued.
#[derive(Default)]
struct Model<T> {
    held: HashMap<HolderId, T>,
    queued: HashMap<HolderId, T>,
}

impl<T: Clone> Model<T> {
    fn apply(&mut self, holder: HolderId, outcome: &Acquire, params: T) {
        match outcome {
            Acquire::Granted { .. } => {
                self.held.insert(holder, params);
            }
            Acquire::Enqueued => {
                self.queued.insert(holder, params);
            }
            Acquire::Busy | Acquire::Impossible => {}
        }
    }

    fn release(&mut self, holder: HolderId, woken: &[HolderId]) {
        self.held.remove(&holder);
        self.queued.remove(&holder);
        for w in woken {
            if let Some(params) = self.queued.remove(w) {
                self.held.insert(*w, params);
            }
        }
    }

    /// A holder that already holds or waits is refused before it can queue twice.
    fn is_known(&self, holder: HolderId) -> bool {
        self.held.contains_key(&holder) || self.queued.contains_key(&holder)
    }
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: 200,
        ..ProptestConfig::default()
    })]

    #[test]
    fn test_numeric_capacity_never_exceeded(ops in proptest::collection::vec(op_strategy(), 1..60)) {
        let mut res = NumericResource::new("pool[6]").unwrap();
        let mut model: Model<u32> = Model::default();
        for op in ops {
            match op {
                Op::Acquire { holder, quantity, wait, .. } => {
                    if model.is_known(holder) {
                        continue;
                    }
                    let outcome = res.acquire(holder, &request("pool[6]", LockMode::Exclusive, quantity, wait));
                    model.apply(holder, &outcome, quantity);
                }
                Op::Release { holder, rollback } => {
                    let woken: Vec<HolderId> =
                        res.release(holder, rollback).into_iter().map(|w| w.holder).collect();
                    model.release(holder, &woken);
                }
            }
            let used: u32 = model.held.values().sum();
            prop_assert!(used <= 6);
            prop_assert_eq!(res.available(), 6 - used);
            prop_assert_eq!(res.holder_count(), model.held.len());
            prop_assert_eq!(res.waiter_count(), model.queued.len());
        }
    }

    #[test]
    fn test_simple_holders_pairwise_compatible(ops in proptest::collection::vec(op_strategy(), 1..60)) {
        let mut res = SimpleResource::new("printer");
        let mut model: Model<LockMode> = Model::default();
        for op in ops {
            match op {
                Op::Acquire { holder, mode, wait, .. } => {
                    if model.is_known(holder) {
                        continue;
                    }
                    let outcome = res.acquire(holder, &request("printer", mode, 1, wait));
                    model.apply(holder, &outcome, mode);
                }
                Op::Release { holder, rollback } => {
                    let woken: Vec<HolderId> =
                        res.release(holder, rollback).into_iter().map(|w| w.holder).collect();
                    model.release(holder, &woken);
                }
            }
            let modes: Vec<LockMode> = model.held.values().copied().collect();
            for (i, a) in modes.iter().enumerate() {
                for b in &modes[i + 1..] {
                    prop_assert!(a.is_compatible_with(*b), "{} held with {}", a, b);
                }
            }
            prop_assert_eq!(res.holder_count(), model.held.len());
        }
    }

    #[test]
    fn test_sequence_values_distinct(
        ops in proptest::collection::vec(op_strategy(), 1..60),
        transactional in any::<bool>(),
    ) {
        let name = if transactional { "_S_ids[3]" } else { "_s_ids[3]" };
        let mut res = SequenceResource::new(name).unwrap();
        let mut values: HashMap<HolderId, String> = HashMap::new();
        let mut queued: HashSet<HolderId> = HashSet::new();
        for op in ops {
            match op {
                Op::Acquire { holder, wait, .. } => {
                    if values.contains_key(&holder) || queued.contains(&holder) {
                        continue;
                    }
                    match res.acquire(holder, &request(name, LockMode::Exclusive, 1, wait)) {
                        Acquire::Granted { element: Some(v) } => {
                            values.insert(holder, v);
                        }
                        Acquire::Granted { element: None } => prop_assert!(false, "grant without a value"),
                        Acquire::Enqueued => {
                            queued.insert(holder);
                        }
                        Acquire::Busy | Acquire::Impossible => {}
                    }
                }
                Op::Release { holder, rollback } => {
                    values.remove(&holder);
                    queued.remove(&holder);
                    for wakeup in res.release(holder, rollback) {
                        queued.remove(&wakeup.holder);
                        prop_assert!(wakeup.element.is_some());
                        values.insert(wakeup.holder, wakeup.element.unwrap_or_default());
                    }
                }
            }
            let distinct: HashSet<&String> = values.values().collect();
            prop_assert_eq!(distinct.len(), values.len());
            prop_assert!(values.len() <= 3);
        }
    }
}
