//! Per-batch signal compaction.

use fxhash::FxHashSet;

use crate::signal::ChangeSignal;

/// Reduces one received batch to the signals worth publishing.
///
/// - `FactInserted`: first occurrence per `(ns, type)` only
/// - `BlacklistChanged`: a single signal, at the position of the last one
/// - `RoundTrip`: dropped (health-check echoes are consumed by the listener)
/// - everything else: forwarded as received, repeats included
#[must_use]
pub fn compact(signals: Vec<ChangeSignal>) -> Vec<ChangeSignal> {
    let last_blacklist = signals
        .iter()
        .rposition(|s| matches!(s, ChangeSignal::BlacklistChanged));

    let mut inserted: FxHashSet<(Option<String>, Option<String>)> = FxHashSet::default();
    let mut out = Vec::with_capacity(signals.len());
    for (pos, signal) in signals.into_iter().enumerate() {
        match signal {
            ChangeSignal::RoundTrip => {}
            ChangeSignal::BlacklistChanged => {
                if Some(pos) == last_blacklist {
                    out.push(signal);
                }
            }
            ChangeSignal::FactInserted { ns, type_ } => {
                if inserted.insert((ns.clone(), type_.clone())) {
                    out.push(ChangeSignal::FactInserted { ns, type_ });
                }
            }
            other => out.push(other),
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use uuid::Uuid;

    fn inserted(ns: &str, type_: &str) -> ChangeSignal {
        ChangeSignal::FactInserted {
            ns: Some(ns.into()),
            type_: Some(type_.into()),
        }
    }

    #[test]
    fn test_fact_inserted_first_per_coordinate() {
        let out = compact(vec![
            inserted("a", "x"),
            inserted("b", "x"),
            inserted("a", "x"),
            inserted("a", "y"),
            inserted("b", "x"),
        ]);
        assert_eq!(out, vec![inserted("a", "x"), inserted("b", "x"), inserted("a", "y")]);
    }

    #[test]
    fn test_blacklist_keeps_last_only() {
        let id = Uuid::new_v4();
        let out = compact(vec![
            ChangeSignal::BlacklistChanged,
            ChangeSignal::Updated { fact_id: id },
            ChangeSignal::BlacklistChanged,
            ChangeSignal::Truncated,
        ]);
        assert_eq!(
            out,
            vec![
                ChangeSignal::Updated { fact_id: id },
                ChangeSignal::BlacklistChanged,
                ChangeSignal::Truncated,
            ]
        );
    }

    #[test]
    fn test_roundtrip_dropped() {
        let out = compact(vec![ChangeSignal::RoundTrip, ChangeSignal::catch_up()]);
        assert_eq!(out, vec![ChangeSignal::catch_up()]);
    }

    #[test]
    fn test_updates_pass_through_unchanged() {
        let a = ChangeSignal::Updated { fact_id: Uuid::new_v4() };
        let b = ChangeSignal::Updated { fact_id: Uuid::new_v4() };
        assert_eq!(
            compact(vec![a.clone(), b.clone(), a.clone()]),
            vec![a.clone(), b, a]
        );
    }

    #[test]
    fn test_repeated_truncations_not_merged() {
        let out = compact(vec![ChangeSignal::Truncated, ChangeSignal::Truncated]);
        assert_eq!(out, vec![ChangeSignal::Truncated, ChangeSignal::Truncated]);
    }

    proptest! {
        /// N inserts over K distinct coordinates publish exactly K signals,
        /// each the first occurrence of its coordinate.
        #[test]
        fn prop_insert_compaction(coords in prop::collection::vec((0u8..4, 0u8..3), 0..50)) {
            let signals: Vec<ChangeSignal> = coords
                .iter()
                .map(|(n, t)| inserted(&format!("ns{n}"), &format!("t{t}")))
                .collect();

            let mut expected = Vec::new();
            for s in &signals {
                if !expected.contains(s) {
                    expected.push(s.clone());
                }
            }
            prop_assert_eq!(compact(signals), expected);
        }
    }
}
