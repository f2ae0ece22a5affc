// tests/property_vars.rs

//! Property tests for the variable scope and fingerprint keys.

use std::collections::BTreeMap;

use proptest::prelude::*;
use taskdag::fingerprint::fingerprint_key;
use taskdag::vars::{expand, Scope, Value};

proptest! {
    /// The innermost layer always shadows outer bindings, and popping the
    /// layer restores the outer value.
    #[test]
    fn innermost_binding_wins(
        name in "[A-Z][A-Z0-9_]{0,7}",
        outer in "[ -~]{0,16}",
        inner in "[ -~]{0,16}",
    ) {
        let mut scope = Scope::new();
        scope.set(name.clone(), Value::Str(outer.clone()));
        scope.push_layer();
        scope.set(name.clone(), Value::Str(inner.clone()));

        prop_assert_eq!(scope.get(&name), Some(&Value::Str(inner)));
        scope.pop_layer();
        prop_assert_eq!(scope.get(&name), Some(&Value::Str(outer)));
    }

    /// Fingerprint keys are deterministic in (name, vars), differ when the
    /// bound values differ, and never contain path separators.
    #[test]
    fn fingerprint_keys_are_stable_and_path_safe(
        name in "[a-z][a-z0-9:-]{0,12}",
        vars in prop::collection::btree_map("[A-Z]{1,6}", "[ -~]{0,12}", 0..4),
    ) {
        let key_a = fingerprint_key(&name, &vars);
        let key_b = fingerprint_key(&name, &vars);
        prop_assert_eq!(&key_a, &key_b);
        prop_assert!(!key_a.contains('/'));
        prop_assert!(!key_a.contains(':'));
        prop_assert!(!key_a.contains('\\'));

        let mut changed: BTreeMap<String, String> = vars.clone();
        changed.insert("EXTRA_PROP_VAR".to_string(), "x".to_string());
        prop_assert_ne!(key_a, fingerprint_key(&name, &changed));
    }

    /// Expansion of templates without expressions is the identity, whatever
    /// the scope contains.
    #[test]
    fn plain_strings_expand_to_themselves(
        input in "[a-zA-Z0-9 ,.:;/_-]{0,32}",
        name in "[A-Z]{1,6}",
        value in "[ -~]{0,12}",
    ) {
        let mut scope = Scope::new();
        scope.set(name, Value::Str(value));
        prop_assert_eq!(expand(&input, &scope), input);
    }
}
