//! In-memory aggregation pipeline.
//!
//! A pipeline is an ordered list of [`Stage`]s applied to a snapshot of a
//! collection. Each stage reads only its own parameters and replaces the
//! running sequence of records.

use crate::document::{self, Record, ID_FIELD};
use crate::error::{Result, StoreError};
use rand::Rng;
use serde_json::{Map, Value};
use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

pub type KeyFn = Arc<dyn Fn(&Record) -> Value + Send + Sync>;
pub type AccumulatorFn = Arc<dyn Fn(&Record) -> f64 + Send + Sync>;

/// How `$group` partitions its input
#[derive(Clone)]
pub enum GroupKey {
    /// Records that are equal as a whole form a group.
    Record,
    /// The value at a (dotted) field path.
    Field(String),
    /// Every record lands in the same group.
    Constant(Value),
    Custom(KeyFn),
}

impl GroupKey {
    fn key_of(&self, record: &Record) -> Value {
        match self {
            GroupKey::Record => Value::Object(record.clone()),
            GroupKey::Field(path) => lookup(record, path).cloned().unwrap_or(Value::Null),
            GroupKey::Constant(value) => value.clone(),
            GroupKey::Custom(f) => f(record),
        }
    }
}

impl fmt::Debug for GroupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GroupKey::Record => write!(f, "Record"),
            GroupKey::Field(path) => write!(f, "Field({path:?})"),
            GroupKey::Constant(value) => write!(f, "Constant({value})"),
            GroupKey::Custom(_) => write!(f, "Custom(<fn>)"),
        }
    }
}

/// Per-member contribution to a group total
#[derive(Clone)]
pub enum Accumulator {
    /// Numeric value at a field path; anything non-numeric counts as 0.
    SumField(String),
    SumConstant(f64),
    Custom(AccumulatorFn),
}

impl Accumulator {
    fn contribution(&self, record: &Record) -> f64 {
        match self {
            Accumulator::SumField(path) => lookup(record, path)
                .and_then(Value::as_f64)
                .unwrap_or(0.0),
            Accumulator::SumConstant(n) => *n,
            Accumulator::Custom(f) => f(record),
        }
    }
}

impl fmt::Debug for Accumulator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Accumulator::SumField(path) => write!(f, "SumField({path:?})"),
            Accumulator::SumConstant(n) => write!(f, "SumConstant({n})"),
            Accumulator::Custom(_) => write!(f, "Custom(<fn>)"),
        }
    }
}

/// Parameters of a `$group` stage
#[derive(Debug, Clone)]
pub struct GroupSpec {
    pub key: GroupKey,
    pub accumulators: Vec<(String, Accumulator)>,
}

impl GroupSpec {
    pub fn new(key: GroupKey) -> Self {
        GroupSpec {
            key,
            accumulators: Vec::new(),
        }
    }

    pub fn by_field(path: impl Into<String>) -> Self {
        Self::new(GroupKey::Field(path.into()))
    }

    pub fn by(key: impl Fn(&Record) -> Value + Send + Sync + 'static) -> Self {
        Self::new(GroupKey::Custom(Arc::new(key)))
    }

    pub fn sum_field(mut self, name: impl Into<String>, path: impl Into<String>) -> Self {
        self.accumulators
            .push((name.into(), Accumulator::SumField(path.into())));
        self
    }

    /// Number of members, as `{"$sum": 1}` would compute it.
    pub fn count(mut self, name: impl Into<String>) -> Self {
        self.accumulators
            .push((name.into(), Accumulator::SumConstant(1.0)));
        self
    }

    pub fn accumulate(
        mut self,
        name: impl Into<String>,
        f: impl Fn(&Record) -> f64 + Send + Sync + 'static,
    ) -> Self {
        self.accumulators
            .push((name.into(), Accumulator::Custom(Arc::new(f))));
        self
    }
}

/// One pipeline stage
#[derive(Debug, Clone)]
pub enum Stage {
    Match(Record),
    Group(GroupSpec),
    /// `(output field, input field)` pairs.
    Project(Vec<(String, String)>),
    Sort { field: String, descending: bool },
    Skip(usize),
    Limit(usize),
    /// Draw this many records uniformly, with replacement.
    Sample(usize),
    /// Unrecognized stage name, skipped at run time.
    Unknown(String),
}

impl Stage {
    /// Parse a mongo-style stage descriptor such as `{"$limit": 2}`.
    pub fn from_json(descriptor: &Value) -> Result<Stage> {
        let object = descriptor
            .as_object()
            .filter(|o| o.len() == 1)
            .ok_or_else(|| {
                StoreError::InvalidStage(format!(
                    "stage must be an object with exactly one key, got {descriptor}"
                ))
            })?;
        let Some((name, params)) = object.iter().next() else {
            return Err(StoreError::InvalidStage("empty stage".into()));
        };

        let stage = match name.as_str() {
            "$match" => Stage::Match(expect_object(name, params)?.clone()),
            "$group" => Stage::Group(parse_group(expect_object(name, params)?)?),
            "$project" => Stage::Project(parse_project(expect_object(name, params)?)?),
            "$sort" => parse_sort(expect_object(name, params)?)?,
            "$skip" => Stage::Skip(expect_count(name, params)?),
            "$limit" => Stage::Limit(expect_count(name, params)?),
            "$sample" => Stage::Sample(expect_count(name, params)?),
            other => Stage::Unknown(other.to_string()),
        };
        Ok(stage)
    }
}

/// Parse a JSON array of stage descriptors.
pub fn parse_pipeline(value: &Value) -> Result<Vec<Stage>> {
    let stages = value.as_array().ok_or_else(|| {
        StoreError::InvalidStage("pipeline must be an array of stages".into())
    })?;
    stages.iter().map(Stage::from_json).collect()
}

/// Run a pipeline using the thread-local RNG for `$sample`.
pub fn run(stages: &[Stage], records: Vec<Record>) -> Vec<Record> {
    run_with_rng(stages, records, &mut rand::rng())
}

/// Run a pipeline with an explicit RNG, for reproducible sampling.
pub fn run_with_rng<R: Rng>(stages: &[Stage], records: Vec<Record>, rng: &mut R) -> Vec<Record> {
    let mut current = records;

    for stage in stages {
        current = match stage {
            Stage::Match(criteria) => current
                .into_iter()
                .filter(|r| document::matches(r, criteria))
                .collect(),
            Stage::Group(spec) => group(&current, spec),
            Stage::Project(fields) => current.iter().map(|r| project(r, fields)).collect(),
            Stage::Sort { field, descending } => {
                current.sort_by(|a, b| {
                    let ord = compare_values(lookup(a, field), lookup(b, field));
                    if *descending {
                        ord.reverse()
                    } else {
                        ord
                    }
                });
                current
            }
            Stage::Skip(n) => current.into_iter().skip(*n).collect(),
            Stage::Limit(n) => {
                current.truncate(*n);
                current
            }
            Stage::Sample(n) => {
                if current.is_empty() {
                    current
                } else {
                    (0..*n)
                        .map(|_| current[rng.random_range(0..current.len())].clone())
                        .collect()
                }
            }
            Stage::Unknown(name) => {
                log::warn!("Ignoring unknown pipeline stage '{name}'");
                current
            }
        };
    }

    current
}

fn group(records: &[Record], spec: &GroupSpec) -> Vec<Record> {
    let mut groups: Vec<(Value, Vec<f64>)> = Vec::new();

    for record in records {
        let key = spec.key.key_of(record);
        let index = match groups
            .iter()
            .position(|(k, _)| document::values_equal(k, &key))
        {
            Some(index) => index,
            None => {
                groups.push((key, vec![0.0; spec.accumulators.len()]));
                groups.len() - 1
            }
        };

        let totals = &mut groups[index].1;
        for (total, (_, accumulator)) in totals.iter_mut().zip(&spec.accumulators) {
            *total += accumulator.contribution(record);
        }
    }

    groups
        .into_iter()
        .map(|(key, totals)| {
            let mut out = Record::new();
            out.insert(ID_FIELD.to_string(), key);
            for ((name, _), total) in spec.accumulators.iter().zip(totals) {
                out.insert(name.clone(), number_value(total));
            }
            out
        })
        .collect()
}

fn project(record: &Record, fields: &[(String, String)]) -> Record {
    let mut out = Record::new();
    for (output, input) in fields {
        if let Some(value) = lookup(record, input) {
            out.insert(output.clone(), value.clone());
        }
    }
    out
}

/// Resolve a dotted path such as `address.city`.
fn lookup<'a>(record: &'a Record, path: &str) -> Option<&'a Value> {
    let mut parts = path.split('.');
    let mut current = record.get(parts.next()?)?;
    for part in parts {
        current = current.as_object()?.get(part)?;
    }
    Some(current)
}

fn type_rank(value: Option<&Value>) -> u8 {
    match value {
        None | Some(Value::Null) => 0,
        Some(Value::Number(_)) => 1,
        Some(Value::String(_)) => 2,
        Some(Value::Object(_)) => 3,
        Some(Value::Array(_)) => 4,
        Some(Value::Bool(_)) => 5,
    }
}

fn compare_values(a: Option<&Value>, b: Option<&Value>) -> Ordering {
    match (a, b) {
        (Some(Value::Number(x)), Some(Value::Number(y))) => {
            let x = x.as_f64().unwrap_or(0.0);
            let y = y.as_f64().unwrap_or(0.0);
            x.partial_cmp(&y).unwrap_or(Ordering::Equal)
        }
        (Some(Value::String(x)), Some(Value::String(y))) => x.cmp(y),
        (Some(Value::Bool(x)), Some(Value::Bool(y))) => x.cmp(y),
        _ => type_rank(a).cmp(&type_rank(b)),
    }
}

/// Integral totals are emitted as JSON integers.
fn number_value(n: f64) -> Value {
    const MAX_SAFE: f64 = 9_007_199_254_740_992.0;
    if n.fract() == 0.0 && n.abs() <= MAX_SAFE {
        Value::from(n as i64)
    } else {
        serde_json::Number::from_f64(n)
            .map(Value::Number)
            .unwrap_or(Value::Null)
    }
}

fn expect_object<'a>(name: &str, params: &'a Value) -> Result<&'a Map<String, Value>> {
    params
        .as_object()
        .ok_or_else(|| StoreError::InvalidStage(format!("{name} expects an object, got {params}")))
}

fn expect_count(name: &str, params: &Value) -> Result<usize> {
    params
        .as_u64()
        .and_then(|n| usize::try_from(n).ok())
        .ok_or_else(|| {
            StoreError::InvalidStage(format!(
                "{name} expects a non-negative integer, got {params}"
            ))
        })
}

fn parse_group(params: &Map<String, Value>) -> Result<GroupSpec> {
    let key = match params.get(ID_FIELD) {
        None | Some(Value::Null) => GroupKey::Record,
        Some(Value::String(s)) if s.starts_with('$') => GroupKey::Field(s[1..].to_string()),
        Some(other) => GroupKey::Constant(other.clone()),
    };

    let mut spec = GroupSpec::new(key);
    for (name, operator) in params.iter().filter(|(name, _)| *name != ID_FIELD) {
        let operand = operator
            .as_object()
            .filter(|o| o.len() == 1)
            .and_then(|o| o.get("$sum"))
            .ok_or_else(|| {
                StoreError::InvalidStage(format!(
                    "$group accumulator '{name}' must be {{\"$sum\": ...}}, got {operator}"
                ))
            })?;

        let accumulator = match operand {
            Value::String(s) if s.starts_with('$') => Accumulator::SumField(s[1..].to_string()),
            Value::Number(n) => Accumulator::SumConstant(n.as_f64().unwrap_or(0.0)),
            other => {
                return Err(StoreError::InvalidStage(format!(
                    "$sum operand for '{name}' must be a \"$field\" or a number, got {other}"
                )))
            }
        };
        spec.accumulators.push((name.clone(), accumulator));
    }
    Ok(spec)
}

fn parse_project(params: &Map<String, Value>) -> Result<Vec<(String, String)>> {
    let mut fields = Vec::new();
    for (output, source) in params {
        match source {
            Value::String(s) => {
                let input = s.strip_prefix('$').unwrap_or(s);
                fields.push((output.clone(), input.to_string()));
            }
            Value::Bool(true) => fields.push((output.clone(), output.clone())),
            Value::Number(n) if n.as_f64() == Some(1.0) => {
                fields.push((output.clone(), output.clone()))
            }
            Value::Bool(false) => {}
            Value::Number(n) if n.as_f64() == Some(0.0) => {}
            other => {
                return Err(StoreError::InvalidStage(format!(
                    "$project value for '{output}' must be a field name or 1, got {other}"
                )))
            }
        }
    }
    Ok(fields)
}

fn parse_sort(params: &Map<String, Value>) -> Result<Stage> {
    if params.len() != 1 {
        return Err(StoreError::InvalidStage(format!(
            "$sort expects exactly one field, got {}",
            params.len()
        )));
    }
    let Some((field, direction)) = params.iter().next() else {
        return Err(StoreError::InvalidStage("$sort expects one field".into()));
    };
    let descending = match direction.as_f64() {
        Some(d) if d == 1.0 => false,
        Some(d) if d == -1.0 => true,
        _ => {
            return Err(StoreError::InvalidStage(format!(
                "$sort direction for '{field}' must be 1 or -1, got {direction}"
            )))
        }
    };
    Ok(Stage::Sort {
        field: field.clone(),
        descending,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use serde_json::json;

    fn record(value: Value) -> Record {
        value.as_object().unwrap().clone()
    }

    fn fixture() -> Vec<Record> {
        vec![
            record(json!({ "_id": "1", "name": "a", "status": "active", "amount": 10 })),
            record(json!({ "_id": "2", "name": "b", "status": "inactive", "amount": 5 })),
            record(json!({ "_id": "3", "name": "c", "status": "active", "amount": 7.5 })),
            record(json!({ "_id": "4", "name": "d", "status": "pending", "amount": 1 })),
            record(json!({ "_id": "5", "name": "e", "status": "active" })),
        ]
    }

    fn ids(records: &[Record]) -> Vec<&str> {
        records
            .iter()
            .map(|r| document::record_id(r).unwrap())
            .collect()
    }

    fn pipeline(value: Value) -> Vec<Stage> {
        parse_pipeline(&value).unwrap()
    }

    #[test]
    fn test_match_keeps_order() {
        let out = run(&pipeline(json!([{ "$match": { "status": "active" } }])), fixture());
        assert_eq!(ids(&out), vec!["1", "3", "5"]);
    }

    #[test]
    fn test_skip_then_limit() {
        let out = run(&pipeline(json!([{ "$skip": 1 }, { "$limit": 2 }])), fixture());
        assert_eq!(ids(&out), vec!["2", "3"]);
    }

    #[test]
    fn test_stage_order_matters() {
        let limited_first = run(
            &pipeline(json!([{ "$limit": 2 }, { "$match": { "status": "active" } }])),
            fixture(),
        );
        assert_eq!(ids(&limited_first), vec!["1"]);
    }

    #[test]
    fn test_sample_with_replacement() {
        let three: Vec<Record> = fixture().into_iter().take(3).collect();
        let mut rng = StdRng::seed_from_u64(7);
        let out = run_with_rng(&[Stage::Sample(10)], three.clone(), &mut rng);

        assert_eq!(out.len(), 10);
        assert!(out.iter().all(|r| three.contains(r)));
    }

    #[test]
    fn test_sample_empty_input() {
        let out = run(&[Stage::Sample(4)], Vec::new());
        assert!(out.is_empty());
    }

    #[test]
    fn test_group_by_field_with_sum() {
        let stages = pipeline(json!([{
            "$group": {
                "_id": "$status",
                "total": { "$sum": "$amount" },
                "count": { "$sum": 1 }
            }
        }]));
        let out = run(&stages, fixture());

        assert_eq!(
            out,
            vec![
                record(json!({ "_id": "active", "total": 17.5, "count": 3 })),
                record(json!({ "_id": "inactive", "total": 5, "count": 1 })),
                record(json!({ "_id": "pending", "total": 1, "count": 1 })),
            ]
        );
    }

    #[test]
    fn test_group_by_whole_record() {
        let records = vec![
            record(json!({ "k": 1 })),
            record(json!({ "k": 2 })),
            record(json!({ "k": 1 })),
        ];
        let spec = GroupSpec::new(GroupKey::Record).count("n");
        let out = run(&[Stage::Group(spec)], records);

        assert_eq!(out.len(), 2);
        assert_eq!(out[0]["_id"], json!({ "k": 1 }));
        assert_eq!(out[0]["n"], json!(2));
    }

    #[test]
    fn test_group_with_closures() {
        let spec = GroupSpec::by(|r| json!(r.contains_key("amount")))
            .accumulate("doubled", |r| r.get("amount").and_then(Value::as_f64).unwrap_or(0.0) * 2.0);
        let out = run(&[Stage::Group(spec)], fixture());

        assert_eq!(out[0], record(json!({ "_id": true, "doubled": 47 })));
        assert_eq!(out[1], record(json!({ "_id": false, "doubled": 0 })));
    }

    #[test]
    fn test_group_constant_key_is_single_group() {
        let stages = pipeline(json!([{ "$group": { "_id": "all", "n": { "$sum": 1 } } }]));
        let out = run(&stages, fixture());
        assert_eq!(out, vec![record(json!({ "_id": "all", "n": 5 }))]);
    }

    #[test]
    fn test_project_renames_and_selects() {
        let stages = pipeline(json!([
            { "$limit": 1 },
            { "$project": { "label": "name", "state": "$status", "amount": 1, "missing": "nope" } }
        ]));
        let out = run(&stages, fixture());
        assert_eq!(
            out,
            vec![record(json!({ "label": "a", "state": "active", "amount": 10 }))]
        );
    }

    #[test]
    fn test_sort_ascending_and_descending() {
        let asc = run(&pipeline(json!([{ "$sort": { "amount": 1 } }])), fixture());
        assert_eq!(ids(&asc), vec!["5", "4", "2", "3", "1"]);

        let desc = run(&pipeline(json!([{ "$sort": { "amount": -1 } }])), fixture());
        assert_eq!(ids(&desc), vec!["1", "3", "2", "4", "5"]);
    }

    #[test]
    fn test_sort_accepts_float_directions() {
        let asc = run(&pipeline(json!([{ "$sort": { "amount": 1.0 } }])), fixture());
        assert_eq!(ids(&asc), vec!["5", "4", "2", "3", "1"]);

        let desc = run(&pipeline(json!([{ "$sort": { "amount": -1.0 } }])), fixture());
        assert_eq!(ids(&desc), vec!["1", "3", "2", "4", "5"]);

        assert!(Stage::from_json(&json!({ "$sort": { "amount": 0.5 } })).is_err());
    }

    #[test]
    fn test_sort_is_stable() {
        let out = run(&pipeline(json!([{ "$sort": { "status": 1 } }])), fixture());
        assert_eq!(ids(&out), vec!["1", "3", "5", "2", "4"]);
    }

    #[test]
    fn test_unknown_stage_is_ignored() {
        let stages = pipeline(json!([{ "$lookup": { "from": "x" } }, { "$limit": 1 }]));
        assert!(matches!(stages[0], Stage::Unknown(ref name) if name == "$lookup"));
        assert_eq!(ids(&run(&stages, fixture())), vec!["1"]);
    }

    #[test]
    fn test_malformed_stages() {
        let bad = [
            json!({ "$limit": "two" }),
            json!({ "$skip": -1 }),
            json!({ "$sort": { "a": 1, "b": 1 } }),
            json!({ "$sort": { "a": 2 } }),
            json!({ "$group": { "_id": "$a", "x": { "$avg": "$b" } } }),
            json!({ "$match": 3 }),
            json!({ "$limit": 1, "$skip": 1 }),
            json!("$limit"),
        ];
        for descriptor in bad {
            let err = Stage::from_json(&descriptor).unwrap_err();
            assert!(matches!(err, StoreError::InvalidStage(_)), "{descriptor}");
        }
        assert!(parse_pipeline(&json!({ "$limit": 1 })).is_err());
    }

    #[test]
    fn test_dotted_paths() {
        let records = vec![
            record(json!({ "_id": "x", "address": { "city": "Oslo" } })),
            record(json!({ "_id": "y", "address": { "city": "Bergen" } })),
        ];
        let stages = pipeline(json!([
            { "$sort": { "address.city": 1 } },
            { "$project": { "city": "address.city" } }
        ]));
        let out = run(&stages, records);
        assert_eq!(out, vec![record(json!({ "city": "Bergen" })), record(json!({ "city": "Oslo" }))]);
    }
}
