// src/compile/forloop.rs

//! Expansion of `for:` loop specifications into concrete iterations.

use std::path::{Path, PathBuf};

use crate::taskfile::model::ForSpec;
use crate::vars::{Scope, Value};

/// Variable bindings for one loop iteration, applied in a nested scope layer
/// before the cmd or dep is expanded.
#[derive(Debug, Clone)]
pub struct LoopIteration {
    pub bindings: Vec<(String, Value)>,
}

/// Expand a `for:` spec into its iterations.
///
/// `source_files` backs `for: sources` and is listed relative to `dir` where
/// possible, matching what shell commands expect as arguments.
pub fn iterations(
    spec: &ForSpec,
    scope: &Scope,
    source_files: &[PathBuf],
    dir: &Path,
) -> Vec<LoopIteration> {
    match spec {
        ForSpec::List(items) => items
            .iter()
            .enumerate()
            .map(|(index, item)| item_iteration(Value::from_yaml(item.clone()), index, None))
            .collect(),

        ForSpec::Sources => source_files
            .iter()
            .enumerate()
            .map(|(index, path)| {
                let rendered = path
                    .strip_prefix(dir)
                    .unwrap_or(path)
                    .display()
                    .to_string();
                item_iteration(Value::Str(rendered), index, None)
            })
            .collect(),

        ForSpec::Var { var, split, alias } => {
            let rendered = scope.get(var).map(Value::render).unwrap_or_default();
            let pieces: Vec<String> = match split {
                Some(sep) if !sep.is_empty() => rendered
                    .split(sep.as_str())
                    .filter(|p| !p.is_empty())
                    .map(str::to_string)
                    .collect(),
                _ => rendered.split_whitespace().map(str::to_string).collect(),
            };
            pieces
                .into_iter()
                .enumerate()
                .map(|(index, piece)| {
                    item_iteration(Value::Str(piece), index, alias.as_deref())
                })
                .collect()
        }

        ForSpec::Matrix(dimensions) => {
            // Cross product in dimension name order; every dimension name is
            // bound directly in the iteration scope.
            let mut combos: Vec<Vec<(String, Value)>> = vec![Vec::new()];
            for (dim, values) in dimensions {
                let mut next = Vec::with_capacity(combos.len() * values.len());
                for combo in &combos {
                    for value in values {
                        let mut extended = combo.clone();
                        extended.push((dim.clone(), Value::from_yaml(value.clone())));
                        next.push(extended);
                    }
                }
                combos = next;
            }
            if dimensions.is_empty() {
                return Vec::new();
            }
            combos
                .into_iter()
                .enumerate()
                .map(|(index, mut bindings)| {
                    bindings.push(("ITEM_INDEX".to_string(), Value::Int(index as i64)));
                    LoopIteration { bindings }
                })
                .collect()
        }
    }
}

fn item_iteration(item: Value, index: usize, alias: Option<&str>) -> LoopIteration {
    let name = alias.unwrap_or("ITEM").to_string();
    LoopIteration {
        bindings: vec![
            (name, item),
            ("ITEM_INDEX".to_string(), Value::Int(index as i64)),
        ],
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn list_items_bind_item_and_index() {
        let spec = ForSpec::List(vec![
            serde_yaml::Value::String("a".into()),
            serde_yaml::Value::String("b".into()),
        ]);
        let iters = iterations(&spec, &Scope::new(), &[], Path::new("."));
        assert_eq!(iters.len(), 2);
        assert_eq!(iters[0].bindings[0], ("ITEM".to_string(), Value::from("a")));
        assert_eq!(
            iters[1].bindings[1],
            ("ITEM_INDEX".to_string(), Value::Int(1))
        );
    }

    #[test]
    fn var_split_defaults_to_whitespace() {
        let mut scope = Scope::new();
        scope.set("WORDS", Value::from("one two  three"));
        let spec = ForSpec::Var {
            var: "WORDS".into(),
            split: None,
            alias: None,
        };
        let iters = iterations(&spec, &scope, &[], Path::new("."));
        assert_eq!(iters.len(), 3);
    }

    #[test]
    fn var_split_honors_custom_separator_and_alias() {
        let mut scope = Scope::new();
        scope.set("CSV", Value::from("a,b,c"));
        let spec = ForSpec::Var {
            var: "CSV".into(),
            split: Some(",".into()),
            alias: Some("FIELD".into()),
        };
        let iters = iterations(&spec, &scope, &[], Path::new("."));
        assert_eq!(iters.len(), 3);
        assert_eq!(iters[2].bindings[0], ("FIELD".to_string(), Value::from("c")));
    }

    #[test]
    fn sources_render_relative_to_dir() {
        let dir = Path::new("/work");
        let files = vec![PathBuf::from("/work/src/a.c"), PathBuf::from("/work/b.c")];
        let iters = iterations(&ForSpec::Sources, &Scope::new(), &files, dir);
        assert_eq!(iters[0].bindings[0].1, Value::from("src/a.c"));
        assert_eq!(iters[1].bindings[0].1, Value::from("b.c"));
    }

    #[test]
    fn matrix_is_a_cross_product_binding_dimension_names() {
        let mut dims = std::collections::BTreeMap::new();
        dims.insert(
            "ARCH".to_string(),
            vec![
                serde_yaml::Value::String("amd64".into()),
                serde_yaml::Value::String("arm64".into()),
            ],
        );
        dims.insert(
            "OS".to_string(),
            vec![
                serde_yaml::Value::String("linux".into()),
                serde_yaml::Value::String("darwin".into()),
            ],
        );
        let iters = iterations(&ForSpec::Matrix(dims), &Scope::new(), &[], Path::new("."));
        assert_eq!(iters.len(), 4);

        // Each iteration binds both dimensions.
        for iter in &iters {
            let names: Vec<&str> = iter.bindings.iter().map(|(n, _)| n.as_str()).collect();
            assert!(names.contains(&"OS"));
            assert!(names.contains(&"ARCH"));
        }
    }

    #[test]
    fn empty_matrix_yields_nothing() {
        let iters = iterations(
            &ForSpec::Matrix(Default::default()),
            &Scope::new(),
            &[],
            Path::new("."),
        );
        assert!(iters.is_empty());
    }
}
