//! The task-graph model shipped between clients, coordinator, and workers.
//!
//! The coordinator treats [`Term`]s as opaque: it extracts key references to
//! learn the dependency structure and forwards the rest verbatim. Only
//! workers interpret `op` names.

use std::collections::BTreeMap;
use std::collections::BTreeSet;

use serde_derive::Deserialize;
use serde_derive::Serialize;

/// A graph maps each key to the computation (or inline value) producing it.
pub type Graph = BTreeMap<String, Term>;

/// One stored value.
///
/// Closed and self-describing so both codecs can carry it. The coordinator
/// never looks inside.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub enum Datum {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
    Bytes(Vec<u8>),
    List(Vec<Datum>),
}

impl Datum {
    pub fn type_name(&self) -> &'static str {
        match self {
            Datum::Null => "null",
            Datum::Bool(_) => "bool",
            Datum::Int(_) => "int",
            Datum::Float(_) => "float",
            Datum::Str(_) => "str",
            Datum::Bytes(_) => "bytes",
            Datum::List(_) => "list",
        }
    }
}

/// One computation description in a graph.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub enum Term {
    /// Inline data; extracted into the run cache and scattered to workers.
    Literal(Datum),

    /// Reference to another key's value.
    Key(String),

    /// Apply the named operation to the argument terms.
    Call { op: String, args: Vec<Term> },
}

impl Term {
    pub fn literal(value: Datum) -> Self {
        Term::Literal(value)
    }

    pub fn key(key: impl Into<String>) -> Self {
        Term::Key(key.into())
    }

    pub fn call(
        op: impl Into<String>,
        args: Vec<Term>,
    ) -> Self {
        Term::Call {
            op: op.into(),
            args,
        }
    }

    /// The set of keys this term reads, discovered by inspection.
    pub fn dependencies(&self) -> BTreeSet<String> {
        let mut deps = BTreeSet::new();
        self.collect_dependencies(&mut deps);
        deps
    }

    fn collect_dependencies(
        &self,
        deps: &mut BTreeSet<String>,
    ) {
        match self {
            Term::Literal(_) => {},
            Term::Key(key) => {
                deps.insert(key.clone());
            },
            Term::Call { args, .. } => {
                for arg in args {
                    arg.collect_dependencies(deps);
                }
            },
        }
    }
}

/// Shape of a client's requested keys: a single key or an arbitrary nesting.
///
/// Results come back in the isomorphic [`Datum::List`] nesting.
#[derive(Clone, Debug, PartialEq, Deserialize, Serialize)]
pub enum KeySpec {
    One(String),
    Many(Vec<KeySpec>),
}

impl KeySpec {
    pub fn one(key: impl Into<String>) -> Self {
        KeySpec::One(key.into())
    }

    pub fn many(specs: impl IntoIterator<Item = KeySpec>) -> Self {
        KeySpec::Many(specs.into_iter().collect())
    }

    /// All leaf keys, left to right, duplicates preserved.
    pub fn leaves(&self) -> Vec<String> {
        let mut keys = Vec::new();
        self.collect_leaves(&mut keys);
        keys
    }

    fn collect_leaves(
        &self,
        keys: &mut Vec<String>,
    ) {
        match self {
            KeySpec::One(key) => keys.push(key.clone()),
            KeySpec::Many(specs) => {
                for spec in specs {
                    spec.collect_leaves(keys);
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dependencies_walk_nested_calls() {
        let term = Term::call(
            "mul",
            vec![
                Term::call("add", vec![Term::key("a"), Term::key("b")]),
                Term::literal(Datum::Int(10)),
            ],
        );
        let deps: Vec<_> = term.dependencies().into_iter().collect();
        assert_eq!(deps, vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn literal_has_no_dependencies() {
        assert!(Term::literal(Datum::Int(1)).dependencies().is_empty());
    }

    #[test]
    fn leaves_preserve_order_and_duplicates() {
        let spec = KeySpec::many([
            KeySpec::many([KeySpec::one("x"), KeySpec::one("y")]),
            KeySpec::one("x"),
        ]);
        assert_eq!(
            spec.leaves(),
            vec!["x".to_string(), "y".to_string(), "x".to_string()]
        );
    }
}
