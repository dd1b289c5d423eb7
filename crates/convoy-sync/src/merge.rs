//! Per-field conflict resolution between a local and a remote snapshot of
//! one logical entity.
//!
//! The base is whichever snapshot carries the later `updated_at` (the
//! configured side wins exact ties); each field then applies its declared
//! policy. This is safe only because merged fields are monotonic counters,
//! append-only sets or coarse scalars — never independently edited free
//! text.

use std::collections::{BTreeSet, HashMap};

use chrono::Utc;
use serde_json::Value;
use tracing::warn;

use convoy_core::types::{EntityKind, EntitySnapshot, Origin};
use convoy_core::{ConvoyError, ConvoyResult};

// ── Policies ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldPolicy {
    /// The base snapshot's value wins.
    LastWriterWins,
    /// Numeric maximum of both sides.
    Max,
    /// Order-preserving deduplicated union of array fields.
    Union,
    /// The remote side wins unconditionally.
    PreferRemote,
    /// The local side wins unconditionally.
    PreferLocal,
}

/// Which side wins an exact `updated_at` tie.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TieBreak {
    /// The durable source of truth wins (default).
    #[default]
    Remote,
    Local,
}

impl TieBreak {
    pub fn parse(s: &str) -> ConvoyResult<Self> {
        match s {
            "remote" => Ok(TieBreak::Remote),
            "local" => Ok(TieBreak::Local),
            other => Err(ConvoyError::Config(format!(
                "invalid tie_break '{other}' (expected \"remote\" or \"local\")"
            ))),
        }
    }
}

// ── Policy table ──────────────────────────────────────────────────────────────

/// Per entity kind, per field merge rules. Built once at startup; duplicate
/// rules for the same field are a construction error. Fields without a rule
/// default to last-writer-wins.
#[derive(Debug)]
pub struct PolicyTable {
    rules: HashMap<EntityKind, HashMap<String, FieldPolicy>>,
    tie_break: TieBreak,
}

pub struct PolicyTableBuilder {
    rules: Vec<(EntityKind, String, FieldPolicy)>,
    tie_break: TieBreak,
}

impl PolicyTable {
    pub fn builder() -> PolicyTableBuilder {
        PolicyTableBuilder {
            rules: Vec::new(),
            tie_break: TieBreak::default(),
        }
    }

    /// The platform's stock rules: progression counters take the maximum,
    /// trait/achievement sets union, everything else last-writer-wins.
    pub fn product_defaults(tie_break: TieBreak) -> Self {
        Self::builder()
            .tie_break(tie_break)
            .rule(EntityKind::Being, "level", FieldPolicy::Max)
            .rule(EntityKind::Being, "xp", FieldPolicy::Max)
            .rule(EntityKind::Being, "traits", FieldPolicy::Union)
            .rule(EntityKind::Being, "achievements", FieldPolicy::Union)
            .rule(EntityKind::ReadingProgress, "progress_percent", FieldPolicy::Max)
            .rule(
                EntityKind::ReadingProgress,
                "completed_chapters",
                FieldPolicy::Union,
            )
            .build()
            .unwrap_or_else(|_| unreachable!("stock rules are duplicate-free"))
    }

    pub fn policy(&self, kind: EntityKind, field: &str) -> FieldPolicy {
        self.rules
            .get(&kind)
            .and_then(|fields| fields.get(field))
            .copied()
            .unwrap_or(FieldPolicy::LastWriterWins)
    }

    pub fn tie_break(&self) -> TieBreak {
        self.tie_break
    }

    /// Merge a local and a remote snapshot into a single winner.
    ///
    /// Output `updated_at` is now, `origin` is local (the result is applied
    /// to local state and re-synced from there).
    pub fn merge(&self, local: &EntitySnapshot, remote: &EntitySnapshot) -> EntitySnapshot {
        let remote_is_base = match remote.updated_at.cmp(&local.updated_at) {
            std::cmp::Ordering::Greater => true,
            std::cmp::Ordering::Less => false,
            std::cmp::Ordering::Equal => self.tie_break == TieBreak::Remote,
        };
        let (base, other) = if remote_is_base {
            (remote, local)
        } else {
            (local, remote)
        };

        let field_names: BTreeSet<&String> =
            base.fields.keys().chain(other.fields.keys()).collect();

        let mut fields = serde_json::Map::new();
        for name in field_names {
            let merged = merge_field(
                self.policy(base.kind, name),
                name,
                base.fields.get(name),
                other.fields.get(name),
                local.fields.get(name),
                remote.fields.get(name),
            );
            if let Some(value) = merged {
                fields.insert(name.clone(), value);
            }
        }

        EntitySnapshot {
            kind: base.kind,
            entity_id: base.entity_id.clone(),
            fields,
            updated_at: Utc::now(),
            origin: Origin::Local,
        }
    }
}

impl PolicyTableBuilder {
    pub fn rule(mut self, kind: EntityKind, field: impl Into<String>, policy: FieldPolicy) -> Self {
        self.rules.push((kind, field.into(), policy));
        self
    }

    pub fn tie_break(mut self, tie_break: TieBreak) -> Self {
        self.tie_break = tie_break;
        self
    }

    pub fn build(self) -> ConvoyResult<PolicyTable> {
        let mut rules: HashMap<EntityKind, HashMap<String, FieldPolicy>> = HashMap::new();
        for (kind, field, policy) in self.rules {
            let previous = rules.entry(kind).or_default().insert(field.clone(), policy);
            if previous.is_some() {
                return Err(ConvoyError::Policy(format!(
                    "duplicate merge rule for {}.{field}",
                    kind.table()
                )));
            }
        }
        Ok(PolicyTable {
            rules,
            tie_break: self.tie_break,
        })
    }
}

// ── Field merging ─────────────────────────────────────────────────────────────

fn merge_field(
    policy: FieldPolicy,
    name: &str,
    base: Option<&Value>,
    other: Option<&Value>,
    local: Option<&Value>,
    remote: Option<&Value>,
) -> Option<Value> {
    match policy {
        FieldPolicy::LastWriterWins => base.or(other).cloned(),
        FieldPolicy::PreferRemote => remote.or(local).cloned(),
        FieldPolicy::PreferLocal => local.or(remote).cloned(),
        FieldPolicy::Max => match (base, other) {
            (Some(a), Some(b)) => match numeric_max(a, b) {
                Some(value) => Some(value),
                None => {
                    warn!(field = name, "max policy on non-numeric field, falling back to last-writer-wins");
                    base.cloned()
                }
            },
            (one, two) => one.or(two).cloned(),
        },
        FieldPolicy::Union => match (base, other) {
            (Some(a), Some(b)) => match array_union(a, b) {
                Some(value) => Some(value),
                None => {
                    warn!(field = name, "union policy on non-array field, falling back to last-writer-wins");
                    base.cloned()
                }
            },
            (one, two) => one.or(two).cloned(),
        },
    }
}

/// Numeric maximum, preserving the winning side's original representation.
fn numeric_max(a: &Value, b: &Value) -> Option<Value> {
    let (x, y) = (a.as_f64()?, b.as_f64()?);
    if x >= y {
        Some(a.clone())
    } else {
        Some(b.clone())
    }
}

/// Deduplicated union: base's elements in order, then other's unseen ones.
fn array_union(a: &Value, b: &Value) -> Option<Value> {
    let (xs, ys) = (a.as_array()?, b.as_array()?);
    let mut union: Vec<Value> = Vec::with_capacity(xs.len() + ys.len());
    for item in xs.iter().chain(ys.iter()) {
        if !union.contains(item) {
            union.push(item.clone());
        }
    }
    Some(Value::Array(union))
}


#[cfg(test)]
mod proptest_suite {
    use super::*;
    use chrono::{Duration, Utc};
    use proptest::prelude::*;
    use serde_json::json;

    fn arb_traits() -> impl Strategy<Value = Vec<String>> {
        prop::collection::btree_set("[a-z]{1,6}", 0..6)
            .prop_map(|set| set.into_iter().collect())
    }

    fn being(xp: u32, traits: &[String], age_secs: i64, origin: Origin) -> EntitySnapshot {
        let fields = match json!({"xp": xp, "traits": traits}) {
            serde_json::Value::Object(map) => map,
            _ => unreachable!(),
        };
        EntitySnapshot {
            kind: EntityKind::Being,
            entity_id: "p".into(),
            fields,
            updated_at: Utc::now() - Duration::seconds(age_secs),
            origin,
        }
    }

    fn table() -> PolicyTable {
        PolicyTable::builder()
            .rule(EntityKind::Being, "xp", FieldPolicy::Max)
            .rule(EntityKind::Being, "traits", FieldPolicy::Union)
            .build()
            .unwrap()
    }

    proptest! {
        #[test]
        fn max_fields_commute(
            a in 0u32..10_000, b in 0u32..10_000,
            age_a in 0i64..100, age_b in 0i64..100,
        ) {
            let t = table();
            let local = being(a, &[], age_a, Origin::Local);
            let remote = being(b, &[], age_b, Origin::Remote);

            let ab = t.merge(&local, &remote);
            let ba = t.merge(&remote, &local);
            prop_assert_eq!(&ab.fields["xp"], &ba.fields["xp"]);
            prop_assert_eq!(&ab.fields["xp"], &json!(a.max(b)));
        }

        #[test]
        fn union_fields_commute_as_sets(
            xs in arb_traits(), ys in arb_traits(),
            age_a in 0i64..100, age_b in 0i64..100,
        ) {
            let t = table();
            let local = being(0, &xs, age_a, Origin::Local);
            let remote = being(0, &ys, age_b, Origin::Remote);

            let ab = t.merge(&local, &remote);
            let ba = t.merge(&remote, &local);

            let to_set = |v: &serde_json::Value| -> std::collections::BTreeSet<String> {
                v.as_array()
                    .unwrap()
                    .iter()
                    .map(|x| x.as_str().unwrap().to_string())
                    .collect()
            };
            // Order depends on which side is base; membership must not.
            prop_assert_eq!(to_set(&ab.fields["traits"]), to_set(&ba.fields["traits"]));
        }

        #[test]
        fn union_never_loses_elements(xs in arb_traits(), ys in arb_traits()) {
            let t = table();
            let local = being(0, &xs, 10, Origin::Local);
            let remote = being(0, &ys, 0, Origin::Remote);

            let merged = t.merge(&local, &remote);
            let arr = merged.fields["traits"].as_array().unwrap().clone();
            for item in xs.iter().chain(ys.iter()) {
                prop_assert!(arr.contains(&json!(item)));
            }
        }

        #[test]
        fn merge_is_idempotent(a in 0u32..10_000, xs in arb_traits()) {
            let t = table();
            let snap = being(a, &xs, 0, Origin::Local);
            let merged = t.merge(&snap, &snap);
            prop_assert_eq!(&merged.fields["xp"], &snap.fields["xp"]);
            prop_assert_eq!(&merged.fields["traits"], &snap.fields["traits"]);
        }
    }
}
