//! Run-mode include merging — `spec.md` §4.1's `read_run_mode`.
//!
//! Pure JSON-object merge so it can be unit-tested without a database and
//! reused verbatim by `store::postgres`. Mirrors the shallow
//! `$mergeObjects`/`$concatArrays` aggregation pipeline in
//! `MongoConnect.get_run_mode`: merge every name in `includes`, left to
//! right, then overlay the base document itself last so the base's own
//! fields always win.

use serde_json::{Map, Value};

use crate::error::DispatcherError;
use crate::model::RunModeDoc;

/// Shallow top-level merge: `overlay`'s keys replace `base`'s keys of the
/// same name, everything else from `base` is kept. Not a deep merge — this
/// matches Mongo's `$mergeObjects` semantics, which the original dispatcher
/// relies on.
fn merge_shallow(base: &mut Map<String, Value>, overlay: &Map<String, Value>) {
    for (k, v) in overlay {
        base.insert(k.clone(), v.clone());
    }
}

/// Merge a base run-mode document with its `includes`, in the same order as
/// `MongoConnect.get_run_mode`: each include (already itself resolved to a
/// flat document — see `store::postgres::read_run_mode`) merged left to
/// right, then `base` merged on top so it always wins.
///
/// `base` and every entry of `includes` must be JSON objects; any existing
/// `includes` key is stripped from the result (it's merge metadata, not part
/// of the recipe).
pub fn merge_run_mode_docs(
    mode_name: &str,
    base: Value,
    includes: Vec<(String, Option<Value>)>,
) -> Result<Value, DispatcherError> {
    let mut merged = Map::new();
    for (include_name, doc) in includes {
        let Some(Value::Object(obj)) = doc else {
            return Err(DispatcherError::ModeIncludeMissing {
                mode: mode_name.to_string(),
                missing: include_name,
            });
        };
        merge_shallow(&mut merged, &obj);
    }
    let Value::Object(base_obj) = base else {
        return Err(DispatcherError::ModeNotFound(mode_name.to_string()));
    };
    merge_shallow(&mut merged, &base_obj);
    merged.remove("includes");
    Ok(Value::Object(merged))
}

/// Deserialize a merged JSON document into a `RunModeDoc`, filling `name`
/// from the lookup key (the stored doc's own `name` field, if present, is
/// authoritative; this is only a fallback).
pub fn parse_run_mode_doc(mode_name: &str, merged: Value) -> Result<RunModeDoc, DispatcherError> {
    let mut doc: RunModeDoc = serde_json::from_value(merged)
        .map_err(|_| DispatcherError::ModeNotFound(mode_name.to_string()))?;
    if doc.name.is_empty() {
        doc.name = mode_name.to_string();
    }
    Ok(doc)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn base_wins_over_includes() {
        let base = json!({"name": "m", "detectors": ["tpc"], "boards": [{"host":"a","type":"V17"}], "source": "base"});
        let include = json!({"source": "inherited", "extra_field": 1});
        let merged = merge_run_mode_docs(
            "m",
            base,
            vec![("base_mode".to_string(), Some(include))],
        )
        .unwrap();
        assert_eq!(merged["source"], "base");
        assert_eq!(merged["extra_field"], 1);
        assert_eq!(merged["detectors"], json!(["tpc"]));
    }

    #[test]
    fn later_include_overwrites_earlier() {
        let base = json!({"name": "m"});
        let merged = merge_run_mode_docs(
            "m",
            base,
            vec![
                ("first".to_string(), Some(json!({"k": "first"}))),
                ("second".to_string(), Some(json!({"k": "second"}))),
            ],
        )
        .unwrap();
        assert_eq!(merged["k"], "second");
    }

    #[test]
    fn missing_include_is_an_error() {
        let base = json!({"name": "m"});
        let err = merge_run_mode_docs("m", base, vec![("ghost".to_string(), None)]).unwrap_err();
        assert!(matches!(err, DispatcherError::ModeIncludeMissing { .. }));
    }

    #[test]
    fn includes_key_is_stripped_from_result() {
        let base = json!({"name": "m", "includes": ["base_mode"]});
        let merged = merge_run_mode_docs("m", base, vec![]).unwrap();
        assert!(merged.get("includes").is_none());
    }

    #[test]
    fn no_includes_is_just_the_base() {
        let base = json!({"name": "m", "detectors": ["tpc"], "boards": []});
        let merged = merge_run_mode_docs("m", base, vec![]).unwrap();
        let doc = parse_run_mode_doc("m", merged).unwrap();
        assert_eq!(doc.name, "m");
        assert_eq!(doc.detectors, vec!["tpc"]);
    }
}
