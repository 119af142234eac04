//! The per-subscription [`FactFilter`].

use std::sync::Arc;

use crate::blacklist::Blacklist;
use crate::fact::{Fact, FactSpec};
use crate::script::ScriptCache;

use super::matcher::{FactSpecMatcher, ParsedFact};
use super::FilterError;

/// Keep/drop predicate for one subscription.
///
/// Immutable after construction; scripts are compiled up front through the
/// shared [`ScriptCache`], so `test` may be called from any number of
/// threads.
pub struct FactFilter {
    blacklist: Arc<Blacklist>,
    matchers: Vec<FactSpecMatcher>,
    matches_anything: bool,
}

impl FactFilter {
    /// Builds a filter over the disjunction of `specs`.
    ///
    /// # Errors
    ///
    /// Returns `FilterError::Script` if a filter script fails to compile.
    pub fn new(
        specs: &[FactSpec],
        blacklist: Arc<Blacklist>,
        scripts: &ScriptCache,
    ) -> Result<Self, FilterError> {
        let matches_anything = specs.iter().any(FactSpec::is_unconstrained);
        let matchers = if matches_anything {
            Vec::new()
        } else {
            specs
                .iter()
                .map(|spec| FactSpecMatcher::new(spec, scripts))
                .collect::<Result<Vec<_>, _>>()?
        };

        Ok(Self {
            blacklist,
            matchers,
            matches_anything,
        })
    }

    /// Returns `true` if the fact should be delivered.
    ///
    /// # Errors
    ///
    /// Returns `FilterError` if a script fails or the payload needed by a
    /// clause cannot be parsed.
    pub fn test(&self, fact: &Fact) -> Result<bool, FilterError> {
        if self.blacklist.is_blocked(fact.id()) {
            tracing::trace!(id = %fact.id(), "fact rejected by blacklist");
            return Ok(false);
        }
        if self.matches_anything {
            return Ok(true);
        }

        let mut parsed = ParsedFact::new(fact);
        for matcher in &self.matchers {
            if matcher.matches(&mut parsed)? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    /// Returns `true` if the fast path accepts every non-blocked fact.
    #[must_use]
    pub fn matches_anything(&self) -> bool {
        self.matches_anything
    }
}

impl std::fmt::Debug for FactFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FactFilter")
            .field("specs", &self.matchers.len())
            .field("matches_anything", &self.matches_anything)
            .finish_non_exhaustive()
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blacklist::BlacklistSource;
    use crate::fact::FilterScript;
    use crate::script::{ScriptEngine, ScriptError};
    use crate::testing::{FnScriptEngine, StaticBlacklistSource};
    use proptest::prelude::*;
    use serde_json::json;
    use uuid::Uuid;

    // -- helpers --

    fn empty_blacklist() -> Arc<Blacklist> {
        Arc::new(Blacklist::new(Arc::new(StaticBlacklistSource::new(
            Vec::<Uuid>::new(),
        ))))
    }

    async fn blacklist_of(ids: &[Uuid]) -> Arc<Blacklist> {
        let source: Arc<dyn BlacklistSource> =
            Arc::new(StaticBlacklistSource::new(ids.iter().copied()));
        let blacklist = Arc::new(Blacklist::new(source));
        blacklist.refresh().await.unwrap();
        blacklist
    }

    fn scripts() -> ScriptCache {
        ScriptCache::new(Arc::new(FnScriptEngine::new()))
    }

    fn filter(specs: &[FactSpec]) -> FactFilter {
        FactFilter::new(specs, empty_blacklist(), &scripts()).unwrap()
    }

    fn user_created() -> Fact {
        Fact::builder()
            .ns("user")
            .type_("created")
            .version(1)
            .payload_json(&json!({"name": "x"}))
            .build()
    }

    // -- basic clauses --

    #[test]
    fn test_ns_and_wildcards() {
        let fact = user_created();
        assert!(filter(&[FactSpec::ns("user")]).test(&fact).unwrap());
        assert!(filter(&[FactSpec::ns("user").with_type("*")]).test(&fact).unwrap());
        assert!(!filter(&[FactSpec::ns("order")]).test(&fact).unwrap());
        assert!(!filter(&[FactSpec::ns("user").with_type("deleted")])
            .test(&fact)
            .unwrap());
    }

    #[test]
    fn test_version_zero_matches_any() {
        let fact = user_created();
        assert!(filter(&[FactSpec::ns("user").with_version(0)]).test(&fact).unwrap());
        assert!(filter(&[FactSpec::ns("user").with_version(1)]).test(&fact).unwrap());
        assert!(!filter(&[FactSpec::ns("user").with_version(2)]).test(&fact).unwrap());
    }

    #[test]
    fn test_aggregate_ids_contains_all() {
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();
        let fact = Fact::builder().ns("n").aggregate_id(a).aggregate_id(b).build();

        assert!(filter(&[FactSpec::ns("n").with_aggregate_id(a)]).test(&fact).unwrap());
        assert!(filter(&[FactSpec::ns("n").with_aggregate_id(a).with_aggregate_id(b)])
            .test(&fact)
            .unwrap());
        assert!(!filter(&[FactSpec::ns("n")
            .with_aggregate_id(a)
            .with_aggregate_id(Uuid::new_v4())])
        .test(&fact)
        .unwrap());
    }

    #[test]
    fn test_meta_contains_value() {
        let fact = Fact::builder()
            .ns("n")
            .meta("tag", "a")
            .meta("tag", "b")
            .build();
        assert!(filter(&[FactSpec::ns("n").with_meta("tag", "b")]).test(&fact).unwrap());
        assert!(!filter(&[FactSpec::ns("n").with_meta("tag", "c")]).test(&fact).unwrap());
        assert!(!filter(&[FactSpec::ns("n").with_meta("other", "a")]).test(&fact).unwrap());
    }

    #[test]
    fn test_meta_key_exists() {
        let fact = Fact::builder().ns("n").meta("present", "1").build();
        assert!(filter(&[FactSpec::ns("n").with_meta_exists("present")])
            .test(&fact)
            .unwrap());
        assert!(!filter(&[FactSpec::ns("n").with_meta_exists("absent")])
            .test(&fact)
            .unwrap());
        assert!(filter(&[FactSpec::ns("n").with_meta_does_not_exist("absent")])
            .test(&fact)
            .unwrap());
        assert!(!filter(&[FactSpec::ns("n").with_meta_does_not_exist("present")])
            .test(&fact)
            .unwrap());
    }

    // -- embedded id paths --

    #[test]
    fn test_aggregate_id_property_path() {
        let id = Uuid::new_v4();
        let spec = FactSpec::ns("n").with_aggregate_id_property("a.b", id);
        let f = filter(&[spec]);

        let matching = Fact::builder()
            .ns("n")
            .payload_json(&json!({"a": {"b": id.to_string()}}))
            .build();
        assert!(f.test(&matching).unwrap());

        let mut altered = id.to_string();
        let last = altered.pop().unwrap();
        altered.push(if last == '0' { '1' } else { '0' });
        let wrong = Fact::builder()
            .ns("n")
            .payload_json(&json!({"a": {"b": altered}}))
            .build();
        assert!(!f.test(&wrong).unwrap());

        let missing = Fact::builder()
            .ns("n")
            .payload_json(&json!({"a": {"c": id.to_string()}}))
            .build();
        assert!(!f.test(&missing).unwrap());
    }

    #[test]
    fn test_aggregate_id_property_unparseable_payload_is_error() {
        let spec = FactSpec::ns("n").with_aggregate_id_property("a", Uuid::new_v4());
        let fact = Fact::builder().ns("n").payload("{oops").build();
        assert!(matches!(filter(&[spec]).test(&fact), Err(FilterError::Fact(_))));
    }

    // -- disjunction and fast path --

    #[test]
    fn test_or_of_specs() {
        let fact = user_created();
        let f = filter(&[FactSpec::ns("order"), FactSpec::ns("user").with_type("created")]);
        assert!(f.test(&fact).unwrap());
        assert!(!f.matches_anything());
    }

    #[test]
    fn test_match_anything_fast_path() {
        let f = filter(&[FactSpec::ns("order"), FactSpec::ns("*")]);
        assert!(f.matches_anything());
        assert!(f.test(&user_created()).unwrap());
    }

    #[test]
    fn test_no_specs_matches_nothing() {
        assert!(!filter(&[]).test(&user_created()).unwrap());
    }

    #[tokio::test]
    async fn test_blacklist_checked_first() {
        let fact = user_created();
        let blacklist = blacklist_of(&[fact.id()]).await;
        let f = FactFilter::new(&[FactSpec::ns("*")], blacklist, &scripts()).unwrap();
        assert!(!f.test(&fact).unwrap());
        assert!(f.test(&user_created()).unwrap());
    }

    // -- scripts --

    #[test]
    fn test_script_receives_header_and_payload() {
        let engine = Arc::new(FnScriptEngine::new());
        engine.register("by-name", "test", |args| {
            Ok(json!(args[0]["ns"] == json!("user") && args[1]["name"] == json!("x")))
        });
        let cache = ScriptCache::new(Arc::clone(&engine) as Arc<dyn ScriptEngine>);
        let spec = FactSpec::ns("user").with_filter_script(FilterScript::js("by-name"));

        let f = FactFilter::new(&[spec.clone(), spec], empty_blacklist(), &cache).unwrap();
        assert!(f.test(&user_created()).unwrap());
        assert_eq!(engine.compile_count(), 1);

        let other = Fact::builder()
            .ns("user")
            .payload_json(&json!({"name": "y"}))
            .build();
        assert!(!f.test(&other).unwrap());
    }

    #[test]
    fn test_script_result_is_coerced() {
        let engine = Arc::new(FnScriptEngine::new());
        engine.register("one", "test", |_| Ok(json!(1)));
        let cache = ScriptCache::new(engine);
        let spec = FactSpec::ns("user").with_filter_script(FilterScript::js("one"));
        let f = FactFilter::new(&[spec], empty_blacklist(), &cache).unwrap();
        assert!(f.test(&user_created()).unwrap());
    }

    #[test]
    fn test_script_errors_surface() {
        let engine = Arc::new(FnScriptEngine::new());
        engine.register("bad", "test", |_| {
            Err(ScriptError::Invoke {
                function: "test".into(),
                message: "TypeError".into(),
            })
        });
        let cache = ScriptCache::new(engine);

        let missing = FactSpec::ns("user").with_filter_script(FilterScript::js("unknown"));
        assert!(matches!(
            FactFilter::new(&[missing], empty_blacklist(), &cache),
            Err(FilterError::Script(ScriptError::Compile(_)))
        ));

        let failing = FactSpec::ns("user").with_filter_script(FilterScript::js("bad"));
        let f = FactFilter::new(&[failing], empty_blacklist(), &cache).unwrap();
        assert!(matches!(
            f.test(&user_created()),
            Err(FilterError::Script(ScriptError::Invoke { .. }))
        ));
    }

    #[test]
    fn test_script_in_unsupported_language_rejected() {
        let engine = Arc::new(FnScriptEngine::new());
        engine.register("lua-source", "test", |_| Ok(json!(true)));
        let cache = ScriptCache::new(engine);

        let spec = FactSpec::ns("user").with_filter_script(FilterScript::new("lua", "lua-source"));
        assert!(matches!(
            FactFilter::new(&[spec], empty_blacklist(), &cache),
            Err(FilterError::Script(ScriptError::UnsupportedLanguage(lang))) if lang == "lua"
        ));
        assert!(cache.is_empty());
    }

    // -- monotonicity --

    proptest! {
        /// Removing a clause from a spec can only widen acceptance.
        #[test]
        fn prop_removing_clause_only_widens(
            fact_ns in prop::sample::select(vec!["a", "b"]),
            fact_version in 0u32..3,
            spec_version in 0u32..3,
            has_meta in any::<bool>(),
            require_meta in any::<bool>(),
            meta_exists in prop::option::of(any::<bool>()),
        ) {
            let mut builder = Fact::builder().ns(fact_ns).type_("t").version(fact_version);
            if has_meta {
                builder = builder.meta("k", "v");
            }
            let fact = builder.build();

            let mut full = FactSpec::ns("a").with_type("t").with_version(spec_version);
            if require_meta {
                full = full.with_meta("k", "v");
            }
            if let Some(flag) = meta_exists {
                full.meta_key_exists.insert("k".into(), flag);
            }

            let mut relaxed_variants = Vec::new();
            let mut r = full.clone(); r.version = 0; relaxed_variants.push(r);
            let mut r = full.clone(); r.meta.clear(); relaxed_variants.push(r);
            let mut r = full.clone(); r.meta_key_exists.clear(); relaxed_variants.push(r);
            let mut r = full.clone(); r.type_ = None; relaxed_variants.push(r);

            let accepted = filter(&[full]).test(&fact).unwrap();
            for relaxed in relaxed_variants {
                if accepted {
                    prop_assert!(filter(&[relaxed]).test(&fact).unwrap());
                }
            }
        }
    }
}
