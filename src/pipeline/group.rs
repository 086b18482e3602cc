use std::collections::VecDeque;
use std::sync::Arc;

use async_trait::async_trait;
use indexmap::{IndexMap, IndexSet};
use serde_json::Value as JsonValue;
use tracing::debug;

use super::StageAt;
use crate::config::EngineConfig;
use crate::context::{EvalContext, Runtime};
use crate::cursor::{BoxCursor, Producer};
use crate::document::Document;
use crate::error::{Error, Result};
use crate::expression::{Expression, Parser};
use crate::operators::{std_dev, StdDev};
use crate::value::Value;

// ---------------------------------------------------------------------------
// Accumulators
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
enum Accumulator {
    Sum(Expression),
    Avg(Expression),
    Min(Expression),
    Max(Expression),
    Count,
    First(Expression),
    Last(Expression),
    Push(Expression),
    AddToSet(Expression),
    StdDev(Expression, StdDev),
}

impl Accumulator {
    fn parse(name: &str, spec: &JsonValue, parser: &Parser<'_>) -> Result<Self> {
        let obj = spec
            .as_object()
            .filter(|o| o.len() == 1)
            .ok_or_else(|| {
                Error::InvalidPipeline(format!("accumulator '{name}' must be an object with exactly one operator"))
            })?;
        let Some((op, arg)) = obj.iter().next() else {
            return Err(Error::InvalidPipeline(format!("accumulator '{name}' is empty")));
        };
        let expr = || parser.parse(arg);
        Ok(match op.as_str() {
            "$sum" => Accumulator::Sum(expr()?),
            "$avg" => Accumulator::Avg(expr()?),
            "$min" => Accumulator::Min(expr()?),
            "$max" => Accumulator::Max(expr()?),
            "$count" => Accumulator::Count,
            "$first" => Accumulator::First(expr()?),
            "$last" => Accumulator::Last(expr()?),
            "$push" => Accumulator::Push(expr()?),
            "$addToSet" => Accumulator::AddToSet(expr()?),
            "$stdDevSamp" => Accumulator::StdDev(expr()?, StdDev::Sample),
            "$stdDevPop" => Accumulator::StdDev(expr()?, StdDev::Population),
            _ => return Err(Error::InvalidPipeline(format!("unknown accumulator: {op}"))),
        })
    }

    fn init(&self) -> State {
        match self {
            Accumulator::Sum(_) => State::Sum(Sum::Int(0)),
            Accumulator::Avg(_) => State::Avg { sum: 0.0, count: 0 },
            Accumulator::Min(_) | Accumulator::Max(_) => State::Extremum(None),
            Accumulator::Count => State::Count(0),
            Accumulator::First(_) => State::First(None),
            Accumulator::Last(_) => State::Last(Value::Null),
            Accumulator::Push(_) => State::Push(Vec::new()),
            Accumulator::AddToSet(_) => State::AddToSet(IndexSet::new()),
            Accumulator::StdDev(..) => State::Samples(Vec::new()),
        }
    }

    fn fold(&self, state: &mut State, ctx: &EvalContext<'_>) -> Result<()> {
        match (self, state) {
            (Accumulator::Count, State::Count(c)) => *c += 1,
            (Accumulator::Sum(expr), State::Sum(sum)) => sum.add(&expr.evaluate(ctx)?),
            (Accumulator::Avg(expr), State::Avg { sum, count }) => {
                if let Some(n) = expr.evaluate(ctx)?.as_f64() {
                    *sum += n;
                    *count += 1;
                }
            }
            (Accumulator::Min(expr), State::Extremum(current)) => {
                let v = expr.evaluate(ctx)?;
                if !v.is_nullish() && current.as_ref().is_none_or(|c| v < *c) {
                    *current = Some(v);
                }
            }
            (Accumulator::Max(expr), State::Extremum(current)) => {
                let v = expr.evaluate(ctx)?;
                if !v.is_nullish() && current.as_ref().is_none_or(|c| v > *c) {
                    *current = Some(v);
                }
            }
            (Accumulator::First(expr), State::First(current)) => {
                if current.is_none() {
                    *current = Some(null_if_absent(expr.evaluate(ctx)?));
                }
            }
            (Accumulator::Last(expr), State::Last(current)) => *current = null_if_absent(expr.evaluate(ctx)?),
            (Accumulator::Push(expr), State::Push(items)) => {
                let v = expr.evaluate(ctx)?;
                if !v.is_absent() {
                    items.push(v);
                }
            }
            (Accumulator::AddToSet(expr), State::AddToSet(items)) => {
                let v = expr.evaluate(ctx)?;
                if !v.is_absent() {
                    items.insert(v);
                }
            }
            (Accumulator::StdDev(expr, _), State::Samples(samples)) => {
                if let Some(n) = expr.evaluate(ctx)?.as_f64() {
                    samples.push(n);
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn finish(&self, state: State) -> Value {
        match state {
            State::Sum(sum) => sum.into_value(),
            State::Avg { count: 0, .. } => Value::Null,
            State::Avg { sum, count } => Value::number(sum / count as f64),
            State::Extremum(v) => v.unwrap_or(Value::Null),
            State::Count(c) => Value::Int(c as i64),
            State::First(v) => v.unwrap_or(Value::Null),
            State::Last(v) => v,
            State::Push(items) => Value::Array(items),
            State::AddToSet(items) => Value::Array(items.into_iter().collect()),
            State::Samples(samples) => {
                let kind = match self {
                    Accumulator::StdDev(_, kind) => *kind,
                    _ => StdDev::Sample,
                };
                let dev = std_dev(&samples, kind);
                if dev.is_nan() { Value::Null } else { Value::Float(dev) }
            }
        }
    }
}

fn null_if_absent(v: Value) -> Value {
    if v.is_absent() { Value::Null } else { v }
}

/// Integer sums stay integral until a float arrives or `i64` overflows.
#[derive(Debug, Clone, Copy)]
enum Sum {
    Int(i64),
    Float(f64),
}

impl Sum {
    fn add(&mut self, v: &Value) {
        *self = match (*self, v) {
            (Sum::Int(a), Value::Int(b)) => a.checked_add(*b).map_or(Sum::Float(a as f64 + *b as f64), Sum::Int),
            (Sum::Int(a), Value::Float(b)) => Sum::Float(a as f64 + b),
            (Sum::Float(a), Value::Int(b)) => Sum::Float(a + *b as f64),
            (Sum::Float(a), Value::Float(b)) => Sum::Float(a + b),
            (current, _) => current,
        };
    }

    fn into_value(self) -> Value {
        match self {
            Sum::Int(i) => Value::Int(i),
            Sum::Float(f) => Value::Float(f),
        }
    }
}

#[derive(Debug, Clone)]
enum State {
    Sum(Sum),
    Avg { sum: f64, count: u64 },
    Extremum(Option<Value>),
    Count(u64),
    First(Option<Value>),
    Last(Value),
    Push(Vec<Value>),
    AddToSet(IndexSet<Value>),
    Samples(Vec<f64>),
}

// ---------------------------------------------------------------------------
// Group spec
// ---------------------------------------------------------------------------

/// A `$group` spec: an `_id` key expression plus named accumulators.
#[derive(Debug, Clone)]
pub(crate) struct GroupSpec {
    key: Expression,
    accumulators: Vec<(String, Accumulator)>,
    max_groups: usize,
}

impl GroupSpec {
    pub fn parse(body: &JsonValue, parser: &Parser<'_>, config: &EngineConfig) -> Result<Self> {
        let obj = body
            .as_object()
            .ok_or_else(|| Error::InvalidPipeline("$group must be an object".into()))?;
        let id = obj
            .get("_id")
            .ok_or_else(|| Error::InvalidPipeline("$group requires '_id' field".into()))?;
        let key = parser.parse(id)?;

        let mut accumulators = Vec::new();
        for (name, spec) in obj {
            if name == "_id" {
                continue;
            }
            if name.starts_with('$') || name.contains('.') {
                return Err(Error::InvalidPipeline(format!("invalid $group field name '{name}'")));
            }
            accumulators.push((name.clone(), Accumulator::parse(name, spec, parser)?));
        }

        Ok(Self {
            key,
            accumulators,
            max_groups: config.max_group_cardinality,
        })
    }

    fn fold(&self, groups: &mut IndexMap<Value, Vec<State>>, ctx: &EvalContext<'_>) -> Result<()> {
        let key = null_if_absent(self.key.evaluate(ctx)?);
        if !groups.contains_key(&key) {
            if groups.len() >= self.max_groups {
                return Err(Error::InvalidPipeline(format!(
                    "$group exceeded {} distinct groups",
                    self.max_groups
                )));
            }
            let init = self.accumulators.iter().map(|(_, acc)| acc.init()).collect();
            groups.insert(key.clone(), init);
        }
        if let Some(states) = groups.get_mut(&key) {
            for ((_, acc), state) in self.accumulators.iter().zip(states.iter_mut()) {
                acc.fold(state, ctx)?;
            }
        }
        Ok(())
    }

    fn finish(&self, groups: IndexMap<Value, Vec<State>>) -> VecDeque<Value> {
        groups
            .into_iter()
            .map(|(key, states)| {
                let mut doc = Document::new();
                doc.insert("_id", key);
                for ((name, acc), state) in self.accumulators.iter().zip(states) {
                    doc.insert(name.as_str(), acc.finish(state));
                }
                Value::Object(doc)
            })
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Executor
// ---------------------------------------------------------------------------

/// Drains its upstream on the first pull, then emits one document per group
/// in first-seen order.
pub(crate) struct GroupStage {
    upstream: BoxCursor,
    spec: Arc<GroupSpec>,
    runtime: Arc<Runtime>,
    at: StageAt,
    output: Option<VecDeque<Value>>,
}

impl GroupStage {
    pub fn new(upstream: BoxCursor, spec: Arc<GroupSpec>, runtime: Arc<Runtime>, at: StageAt) -> Self {
        Self {
            upstream,
            spec,
            runtime,
            at,
            output: None,
        }
    }

    async fn accumulate(&mut self) -> Result<VecDeque<Value>> {
        let mut groups: IndexMap<Value, Vec<State>> = IndexMap::new();
        let mut position = 0;
        while let Some(doc) = self.upstream.next().await? {
            let ctx = EvalContext::new(&self.runtime, &doc).at_position(position);
            self.spec.fold(&mut groups, &ctx).map_err(|e| self.at.wrap(e))?;
            position += 1;
        }
        debug!(groups = groups.len(), documents = position, "group stage emitting");
        Ok(self.spec.finish(groups))
    }
}

#[async_trait]
impl Producer for GroupStage {
    async fn produce(&mut self) -> Result<Option<Value>> {
        if self.output.is_none() {
            let output = self.accumulate().await?;
            self.output = Some(output);
        }
        Ok(self.output.as_mut().and_then(VecDeque::pop_front))
    }

    fn release(&mut self) {
        self.output = Some(VecDeque::new());
        self.upstream.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cursor::{ArrayCursor, CursorExt, Staged};
    use crate::operators::Registry;
    use serde_json::json;

    async fn group(spec: JsonValue, input: JsonValue) -> Result<Vec<Value>> {
        group_with(spec, input, &EngineConfig::default()).await
    }

    async fn group_with(spec: JsonValue, input: JsonValue, config: &EngineConfig) -> Result<Vec<Value>> {
        let registry = Registry::with_builtins();
        let spec = GroupSpec::parse(&spec, &Parser::new(&registry, 64), config)?;
        let docs = input.as_array().unwrap().iter().map(Value::from_json).collect();
        let at = StageAt { index: 0, name: "$group" };
        let stage = GroupStage::new(ArrayCursor::new(docs).boxed(), Arc::new(spec), Arc::new(Runtime::default()), at);
        Staged::new(stage).to_array().await
    }

    fn docs(v: JsonValue) -> Vec<Value> {
        v.as_array().unwrap().iter().map(Value::from_json).collect()
    }

    #[tokio::test]
    async fn sum_per_key_in_first_seen_order() {
        let out = group(
            json!({"_id": "$c_age", "total": {"$sum": 1}}),
            json!([{"c_age": 1}, {"c_age": 5}, {"c_age": 1}, {"c_age": 7}, {"c_age": 5}]),
        )
        .await
        .unwrap();
        assert_eq!(
            out,
            docs(json!([{"_id": 1, "total": 2}, {"_id": 5, "total": 2}, {"_id": 7, "total": 1}]))
        );
    }

    #[tokio::test]
    async fn null_key_is_a_single_group() {
        let out = group(
            json!({"_id": null, "n": {"$count": {}}, "avg": {"$avg": "$x"}, "min": {"$min": "$x"}, "max": {"$max": "$x"}}),
            json!([{"x": 4}, {"x": 1}, {"y": 1}, {"x": 7}]),
        )
        .await
        .unwrap();
        assert_eq!(out, docs(json!([{"_id": null, "n": 4, "avg": 4, "min": 1, "max": 7}])));
    }

    #[tokio::test]
    async fn missing_key_groups_with_null() {
        let out = group(json!({"_id": "$k", "n": {"$sum": 1}}), json!([{"k": null}, {}])).await.unwrap();
        assert_eq!(out, docs(json!([{"_id": null, "n": 2}])));
    }

    #[tokio::test]
    async fn large_integer_keys_stay_distinct() {
        let big = 1_i64 << 53;
        let input = serde_json::Value::Array(vec![
            json!({"k": big}),
            json!({"k": big + 1}),
            json!({"k": big as f64}),
        ]);
        let out = group(json!({"_id": "$k", "n": {"$sum": 1}}), input).await.unwrap();
        assert_eq!(
            out,
            vec![
                Value::from(json!({"_id": big, "n": 2})),
                Value::from(json!({"_id": big + 1, "n": 1})),
            ]
        );
    }

    #[tokio::test]
    async fn compound_keys() {
        let out = group(
            json!({"_id": {"a": "$a", "b": "$b"}, "n": {"$sum": 1}}),
            json!([{"a": 1, "b": 2}, {"a": 1, "b": 2}, {"a": 1, "b": 3}]),
        )
        .await
        .unwrap();
        assert_eq!(
            out,
            docs(json!([{"_id": {"a": 1, "b": 2}, "n": 2}, {"_id": {"a": 1, "b": 3}, "n": 1}]))
        );
    }

    #[tokio::test]
    async fn first_last_push_and_add_to_set() {
        let out = group(
            json!({
                "_id": null,
                "first": {"$first": "$v"},
                "last": {"$last": "$v"},
                "all": {"$push": "$v"},
                "set": {"$addToSet": "$v"}
            }),
            json!([{"v": "a"}, {"v": "b"}, {"v": "a"}]),
        )
        .await
        .unwrap();
        assert_eq!(
            out,
            docs(json!([{"_id": null, "first": "a", "last": "a", "all": ["a", "b", "a"], "set": ["a", "b"]}]))
        );
    }

    #[tokio::test]
    async fn sums_ignore_non_numbers_and_widen_to_float() {
        let out = group(
            json!({"_id": null, "s": {"$sum": "$v"}}),
            json!([{"v": 1}, {"v": "x"}, {"v": 1.5}]),
        )
        .await
        .unwrap();
        assert_eq!(out, docs(json!([{"_id": null, "s": 2.5}])));
    }

    #[tokio::test]
    async fn std_dev_accumulators() {
        let out = group(
            json!({"_id": null, "samp": {"$stdDevSamp": "$v"}, "pop": {"$stdDevPop": "$v"}}),
            json!([{"v": 1}, {"v": 2}, {"v": 3}, {"v": 4}, {"v": 5}]),
        )
        .await
        .unwrap();
        let doc = out[0].as_object().unwrap();
        assert_eq!(doc.get("samp"), Some(&Value::Float(1.5811388300841898)));
        assert_eq!(doc.get("pop"), Some(&Value::Float(std::f64::consts::SQRT_2)));

        let single = group(json!({"_id": null, "s": {"$stdDevSamp": "$v"}}), json!([{"v": 1}])).await.unwrap();
        assert_eq!(single, docs(json!([{"_id": null, "s": null}])));
    }

    #[tokio::test]
    async fn cardinality_limit() {
        let config = EngineConfig {
            max_group_cardinality: 2,
            ..EngineConfig::default()
        };
        let err = group_with(json!({"_id": "$k"}), json!([{"k": 1}, {"k": 2}, {"k": 3}]), &config)
            .await
            .unwrap_err();
        assert_eq!(err.stage_index(), Some(0));
    }

    #[tokio::test]
    async fn empty_input_emits_nothing() {
        assert!(group(json!({"_id": null, "n": {"$sum": 1}}), json!([])).await.unwrap().is_empty());
    }

    #[test]
    fn parse_errors() {
        let registry = Registry::with_builtins();
        let parser = Parser::new(&registry, 64);
        let config = EngineConfig::default();
        assert!(GroupSpec::parse(&json!({"n": {"$sum": 1}}), &parser, &config).is_err());
        assert!(GroupSpec::parse(&json!({"_id": null, "n": {"$median": 1}}), &parser, &config).is_err());
        assert!(GroupSpec::parse(&json!({"_id": null, "n": 1}), &parser, &config).is_err());
        assert!(GroupSpec::parse(&json!({"_id": null, "a.b": {"$sum": 1}}), &parser, &config).is_err());
    }
}
