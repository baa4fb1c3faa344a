//! Property-based test generators using proptest.
//!
//! Provides strategies for generating names, ids and instances that conform
//! to [`crate::person_schema`].

use proptest::prelude::*;
use serde_json::{json, Value};

/// Strategy for generating valid collection names.
pub fn collection_name_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[a-zA-Z][a-zA-Z0-9_]{0,31}").expect("Invalid regex")
}

/// Strategy for generating valid instance ids.
pub fn instance_id_strategy() -> impl Strategy<Value = String> {
    prop::string::string_regex("[0-9A-Za-z_-]{1,26}").expect("Invalid regex")
}

/// Strategy for generating person instances, with or without an `_id`.
pub fn person_strategy() -> impl Strategy<Value = Value> {
    (
        prop::option::of(instance_id_strategy()),
        prop::string::string_regex("[A-Z][a-z]{0,11}").expect("Invalid regex"),
        0i64..150,
        prop::option::of(prop::string::string_regex("[a-z]{1,8}@[a-z]{1,8}\\.org").expect("Invalid regex")),
    )
        .prop_map(|(id, name, age, email)| {
            let mut value = json!({"name": name, "age": age});
            if let Some(id) = id {
                value["_id"] = json!(id);
            }
            if let Some(email) = email {
                value["email"] = json!(email);
            }
            value
        })
}

/// Strategy for generating a batch of people with distinct ids.
pub fn people_strategy(max: usize) -> impl Strategy<Value = Vec<Value>> {
    prop::collection::vec(person_strategy(), 1..max.max(2)).prop_map(|people| {
        let mut seen = std::collections::HashSet::new();
        people
            .into_iter()
            .filter(|p| match p.get("_id").and_then(Value::as_str) {
                Some(id) => seen.insert(id.to_owned()),
                None => true,
            })
            .collect()
    })
}

/// Configuration for property tests.
#[derive(Debug, Clone)]
pub struct PropTestConfig {
    /// Number of test cases to run.
    pub cases: u32,
    /// Maximum shrink iterations.
    pub max_shrink_iters: u32,
}

impl Default for PropTestConfig {
    fn default() -> Self {
        Self {
            cases: 256,
            max_shrink_iters: 1000,
        }
    }
}

impl PropTestConfig {
    /// Creates a configuration for quick tests.
    #[must_use]
    pub fn quick() -> Self {
        Self {
            cases: 32,
            max_shrink_iters: 100,
        }
    }

    /// Converts to proptest config.
    #[must_use]
    pub fn to_proptest_config(&self) -> ProptestConfig {
        ProptestConfig {
            cases: self.cases,
            max_shrink_iters: self.max_shrink_iters,
            ..ProptestConfig::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use threaddb_core::Schema;

    proptest! {
        #![proptest_config(PropTestConfig::quick().to_proptest_config())]

        #[test]
        fn people_conform_to_schema(person in person_strategy()) {
            let schema = Schema::compile(crate::person_schema()).unwrap();
            prop_assert!(schema.is_valid(&person));
        }

        #[test]
        fn collection_name_is_valid(name in collection_name_strategy()) {
            let first = name.chars().next();
            prop_assert!(first.map_or(false, |c| c.is_ascii_alphabetic()));
            prop_assert!(!name.contains(['/', '.']));
        }

        #[test]
        fn people_batches_have_unique_ids(people in people_strategy(8)) {
            let ids: Vec<_> = people.iter().filter_map(|p| p.get("_id")).collect();
            let unique: std::collections::HashSet<_> = ids.iter().map(|v| v.to_string()).collect();
            prop_assert_eq!(ids.len(), unique.len());
        }
    }
}
