use std::sync::Arc;

use chrono::Utc;
use serde_json::Value as JsonValue;
use tracing::debug;

use crate::config::EngineConfig;
use crate::context::{Environment, EvalContext, Runtime};
use crate::cursor::{ArrayCursor, BoxCursor, CursorExt};
use crate::error::Result;
use crate::expression::{Expression, Parser};
use crate::operators::Registry;
use crate::pipeline::{Pipeline, Services};
use crate::script::{to_script_json, to_script_result, ScriptError, ScriptHost, ScriptResult};
use crate::source::{DataSource, Expander};
use crate::value::Value;

/// The pipeline engine. Owns the operator registry and the collaborators
/// pipelines run against.
///
/// Thread-safe: every collaborator is shared behind an `Arc`, so one engine
/// can serve any number of concurrent runs. Each run gets its own
/// [`Runtime`], fixing `$$NOW` for its duration.
#[derive(Clone)]
pub struct Engine {
    config: Arc<EngineConfig>,
    registry: Arc<Registry>,
    source: Option<Arc<dyn DataSource>>,
    expander: Option<Arc<dyn Expander>>,
    environment: Option<Arc<dyn Environment>>,
    script_host: Option<Arc<dyn ScriptHost>>,
}

impl Default for Engine {
    fn default() -> Self {
        Self {
            config: Arc::new(EngineConfig::default()),
            registry: Arc::new(Registry::with_builtins()),
            source: None,
            expander: None,
            environment: None,
            script_host: None,
        }
    }
}

impl Engine {
    /// An engine with the default config and the builtin operators.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn builder() -> EngineBuilder {
        EngineBuilder::default()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    fn parser(&self) -> Parser<'_> {
        Parser::new(&self.registry, self.config.max_expression_depth)
    }

    pub fn parse_pipeline(&self, spec: &JsonValue) -> Result<Pipeline> {
        Pipeline::parse(spec, &self.parser(), &self.config)
    }

    pub fn parse_expression(&self, expr: &JsonValue) -> Result<Expression> {
        self.parser().parse(expr)
    }

    /// A fresh per-run runtime.
    pub fn runtime(&self) -> Result<Runtime> {
        Ok(Runtime {
            config: Arc::clone(&self.config),
            timezone: self.config.timezone()?,
            environment: self.environment.clone(),
            script_host: self.script_host.clone(),
            now: Utc::now(),
        })
    }

    pub fn services(&self) -> Result<Services> {
        Ok(Services {
            runtime: Arc::new(self.runtime()?),
            source: self.source.clone(),
            expander: self.expander.clone(),
        })
    }

    /// Run `pipeline` over `input`, or over its leading `$cursor` stage when
    /// `input` is `None`. Documents are produced lazily as the returned
    /// cursor is pulled.
    pub async fn aggregate(&self, pipeline: &JsonValue, input: Option<BoxCursor>) -> Result<BoxCursor> {
        let pipeline = self.parse_pipeline(pipeline)?;
        let services = self.services()?;
        pipeline.run(input, &services).await
    }

    /// Run `pipeline` over an in-memory array and collect the output.
    pub async fn aggregate_array(&self, pipeline: &JsonValue, docs: Vec<Value>) -> Result<Vec<Value>> {
        let mut cursor = self.aggregate(pipeline, Some(ArrayCursor::new(docs).boxed())).await?;
        cursor.to_array().await
    }

    /// Evaluate an expression natively. Failed math is NaN here.
    pub fn evaluate(&self, expr: &JsonValue, doc: &Value) -> Result<Value> {
        let expr = self.parse_expression(expr)?;
        let runtime = self.runtime()?;
        expr.evaluate(&EvalContext::new(&runtime, doc))
    }

    /// Evaluate an expression for script code: the value comes back in a
    /// `{result}` envelope with NaN normalized to `null`.
    pub fn evaluate_scripted(&self, expr: &JsonValue, doc: &Value) -> std::result::Result<ScriptResult, ScriptError> {
        to_script_result(self.evaluate(expr, doc))
    }

    /// Run a pipeline for script code, returning JSON documents with NaN
    /// normalized to `null`.
    pub async fn aggregate_scripted(
        &self,
        pipeline: &JsonValue,
        docs: Option<Vec<Value>>,
    ) -> std::result::Result<Vec<JsonValue>, ScriptError> {
        let input = docs.map(|d| ArrayCursor::new(d).boxed());
        let mut cursor = self.aggregate(pipeline, input).await?;
        let out = cursor.to_array().await?;
        debug!(documents = out.len(), "scripted aggregate finished");
        Ok(out.iter().map(to_script_json).collect())
    }
}

/// Builds an [`Engine`]. Unset collaborators stay absent: `$cursor` then
/// fails with a source error, `$function` with `ScriptUnavailable`.
#[derive(Default)]
pub struct EngineBuilder {
    config: Option<EngineConfig>,
    registry: Option<Registry>,
    source: Option<Arc<dyn DataSource>>,
    expander: Option<Arc<dyn Expander>>,
    environment: Option<Arc<dyn Environment>>,
    script_host: Option<Arc<dyn ScriptHost>>,
}

impl EngineBuilder {
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Replace the builtin registry, e.g. with one carrying extra operators.
    pub fn registry(mut self, registry: Registry) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn data_source(mut self, source: Arc<dyn DataSource>) -> Self {
        self.source = Some(source);
        self
    }

    pub fn expander(mut self, expander: Arc<dyn Expander>) -> Self {
        self.expander = Some(expander);
        self
    }

    pub fn environment(mut self, environment: Arc<dyn Environment>) -> Self {
        self.environment = Some(environment);
        self
    }

    pub fn script_host(mut self, host: Arc<dyn ScriptHost>) -> Self {
        self.script_host = Some(host);
        self
    }

    pub fn build(self) -> Result<Engine> {
        let config = self.config.unwrap_or_default();
        config.validate()?;
        Ok(Engine {
            config: Arc::new(config),
            registry: Arc::new(self.registry.unwrap_or_else(Registry::with_builtins)),
            source: self.source,
            expander: self.expander,
            environment: self.environment,
            script_host: self.script_host,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::MemoryEnvironment;
    use crate::error::Error;
    use crate::source::MemorySource;
    use serde_json::json;

    #[test]
    fn native_and_scripted_evaluation_differ_only_in_nan() {
        let engine = Engine::new();
        let doc = Value::Null;
        let native = engine.evaluate(&json!({"$acos": "x"}), &doc).unwrap();
        assert!(native.is_nan());
        let scripted = engine.evaluate_scripted(&json!({"$acos": "x"}), &doc).unwrap();
        assert_eq!(scripted.result, JsonValue::Null);

        let ok = engine.evaluate_scripted(&json!({"$add": [1, 2]}), &doc).unwrap();
        assert_eq!(ok.result, json!(3));
    }

    #[test]
    fn scripted_errors_carry_codes() {
        let err = Engine::new().evaluate_scripted(&json!({"$nope": 1}), &Value::Null).unwrap_err();
        assert_eq!(err.code, "cortex.invalidArgument.unknownOperator");
    }

    #[test]
    fn builder_validates_config() {
        let config = EngineConfig {
            default_timezone: "Mars/Olympus".into(),
            ..EngineConfig::default()
        };
        assert!(matches!(Engine::builder().config(config).build(), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn environment_bindings_reach_env() {
        let env = MemoryEnvironment::new().with("c_limit", 5);
        let engine = Engine::builder().environment(Arc::new(env)).build().unwrap();
        assert_eq!(engine.evaluate(&json!({"$env": "c_limit"}), &Value::Null).unwrap(), Value::from(5));
    }

    #[tokio::test]
    async fn aggregate_from_data_source() {
        let source = Arc::new(MemorySource::new().with_collection(
            "c_item",
            vec![Value::from(json!({"_id": 1, "n": 2})), Value::from(json!({"_id": 2, "n": 3}))],
        ));
        let engine = Engine::builder().data_source(source).build().unwrap();
        let mut cursor = engine
            .aggregate(
                &json!([{"$cursor": {"object": "c_item"}}, {"$group": {"_id": null, "n": {"$sum": "$n"}}}]),
                None,
            )
            .await
            .unwrap();
        assert_eq!(cursor.to_array().await.unwrap(), vec![Value::from(json!({"_id": null, "n": 5}))]);
    }

    #[tokio::test]
    async fn scripted_aggregate_normalizes_nan() {
        let out = Engine::new()
            .aggregate_scripted(&json!([{"$project": {"_id": 0, "v": {"$ln": "$x"}}}]), Some(vec![Value::from(json!({"x": "a"}))]))
            .await
            .unwrap();
        assert_eq!(out, vec![json!({"v": null})]);
    }
}
