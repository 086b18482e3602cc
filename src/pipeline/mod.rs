//! Aggregation pipelines.
//!
//! A pipeline is parsed once from its JSON stage list and can then be run
//! any number of times. Running chains one pull-based cursor per stage over
//! the source, so documents flow lazily and a consumer that stops early
//! never forces the upstream to drain.

mod add_fields;
mod group;
mod project;
mod stages;
mod transform;
mod unwind;

use std::fmt;
use std::sync::Arc;

use serde_json::Value as JsonValue;
use tracing::{debug, warn};

use crate::config::EngineConfig;
use crate::context::Runtime;
use crate::cursor::{ArrayCursor, BoxCursor, CursorExt, Staged};
use crate::document::FieldPath;
use crate::error::{Error, Result};
use crate::expression::Parser;
use crate::query::{self, Query, SortOrder};
use crate::source::{DataSource, Expander, QueryDescriptor};
use crate::value::Value;

use add_fields::AddFieldsSpec;
use group::GroupSpec;
use project::Projection;
use transform::TransformSpec;
use unwind::UnwindSpec;

/// Collaborators available to a running pipeline.
#[derive(Clone)]
pub struct Services {
    pub runtime: Arc<Runtime>,
    pub source: Option<Arc<dyn DataSource>>,
    pub expander: Option<Arc<dyn Expander>>,
}

impl Services {
    pub fn new(runtime: Runtime) -> Self {
        Self {
            runtime: Arc::new(runtime),
            source: None,
            expander: None,
        }
    }
}

/// Index and name of a stage, used to locate errors.
#[derive(Debug, Clone, Copy)]
pub(crate) struct StageAt {
    pub index: usize,
    pub name: &'static str,
}

impl StageAt {
    pub fn wrap(self, err: Error) -> Error {
        err.at_stage(self.index, self.name)
    }
}

// ---------------------------------------------------------------------------
// Stages
// ---------------------------------------------------------------------------

#[derive(Clone)]
enum Stage {
    Cursor(QueryDescriptor),
    Match(Arc<Query>),
    Project(Arc<Projection>),
    AddFields(Arc<AddFieldsSpec>),
    Unwind(Arc<UnwindSpec>),
    Group(Arc<GroupSpec>),
    Transform(Arc<TransformSpec>),
    Sort(Arc<Vec<(FieldPath, SortOrder)>>),
    Skip(usize),
    Limit(usize),
    Count(String),
}

impl Stage {
    fn name(&self) -> &'static str {
        match self {
            Stage::Cursor(_) => "$cursor",
            Stage::Match(_) => "$match",
            Stage::Project(_) => "$project",
            Stage::AddFields(_) => "$addFields",
            Stage::Unwind(_) => "$unwind",
            Stage::Group(_) => "$group",
            Stage::Transform(_) => "$transform",
            Stage::Sort(_) => "$sort",
            Stage::Skip(_) => "$skip",
            Stage::Limit(_) => "$limit",
            Stage::Count(_) => "$count",
        }
    }
}

#[derive(Clone)]
struct Step {
    index: usize,
    stage: Stage,
}

impl Step {
    fn at(&self) -> StageAt {
        StageAt {
            index: self.index,
            name: self.stage.name(),
        }
    }

    fn open(&self, upstream: BoxCursor, services: &Services) -> Result<BoxCursor> {
        let at = self.at();
        debug!(stage = at.name, index = at.index, "opening stage");
        let runtime = Arc::clone(&services.runtime);
        Ok(match &self.stage {
            Stage::Cursor(_) => {
                return Err(at.wrap(Error::InvalidPipeline(
                    "$cursor must be the first stage and cannot follow an input source".into(),
                )));
            }
            Stage::Match(q) => Staged::new(stages::MatchStage::new(upstream, Arc::clone(q))).boxed(),
            Stage::Project(spec) => {
                Staged::new(project::ProjectStage::new(upstream, Arc::clone(spec), runtime, at)).boxed()
            }
            Stage::AddFields(spec) => Staged::new(add_fields::AddFieldsStage::new(
                upstream,
                Arc::clone(spec),
                services.clone(),
                at,
            ))
            .boxed(),
            Stage::Unwind(spec) => Staged::new(unwind::UnwindStage::new(upstream, Arc::clone(spec))).boxed(),
            Stage::Group(spec) => {
                Staged::new(group::GroupStage::new(upstream, Arc::clone(spec), runtime, at)).boxed()
            }
            Stage::Transform(spec) => {
                Staged::new(transform::TransformStage::new(upstream, Arc::clone(spec), runtime, at)).boxed()
            }
            Stage::Sort(fields) => Staged::new(stages::SortStage::new(upstream, Arc::clone(fields))).boxed(),
            Stage::Skip(n) => Staged::new(stages::SkipStage::new(upstream, *n)).boxed(),
            Stage::Limit(n) => Staged::new(stages::LimitStage::new(upstream, *n)).boxed(),
            Stage::Count(field) => Staged::new(stages::CountStage::new(upstream, field.clone())).boxed(),
        })
    }
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

/// A parsed, reusable stage list.
#[derive(Clone, Default)]
pub struct Pipeline {
    steps: Vec<Step>,
}

impl fmt::Debug for Pipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.steps.iter().map(|s| s.stage.name()))
            .finish()
    }
}

impl Pipeline {
    pub fn parse(spec: &JsonValue, parser: &Parser<'_>, config: &EngineConfig) -> Result<Self> {
        let arr = spec
            .as_array()
            .ok_or_else(|| Error::InvalidPipeline("pipeline must be an array".into()))?;

        let mut steps = Vec::with_capacity(arr.len());
        for (index, stage_val) in arr.iter().enumerate() {
            let obj = stage_val.as_object().ok_or_else(|| {
                Error::InvalidPipeline("each pipeline stage must be an object".into()).at_stage(index, "")
            })?;
            let (name, body) = match obj.iter().next() {
                Some(entry) if obj.len() == 1 => entry,
                _ => {
                    return Err(Error::InvalidPipeline(
                        "each pipeline stage must have exactly one key".into(),
                    )
                    .at_stage(index, ""));
                }
            };
            match parse_stage(name, body, parser, config).map_err(|e| e.at_stage(index, name))? {
                Some(stage) => {
                    if matches!(stage, Stage::Cursor(_)) && index != 0 {
                        return Err(Error::InvalidPipeline("$cursor must be the first stage".into())
                            .at_stage(index, name));
                    }
                    steps.push(Step { index, stage });
                }
                None => warn!(stage = %name, index, "skipping unknown stage"),
            }
        }
        debug!(stages = steps.len(), "parsed pipeline");
        Ok(Pipeline { steps })
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// True when the first stage is `$cursor`, so no input is needed.
    pub fn has_source(&self) -> bool {
        matches!(
            self.steps.first(),
            Some(Step {
                stage: Stage::Cursor(_),
                ..
            })
        )
    }

    /// Chain the stages over `input` (or over the leading `$cursor` stage
    /// when `input` is `None`) and return the output cursor.
    pub async fn run(&self, input: Option<BoxCursor>, services: &Services) -> Result<BoxCursor> {
        let mut skip = 0;
        let mut cursor = match (input, self.steps.first()) {
            (Some(_), Some(first @ Step { stage: Stage::Cursor(_), .. })) => {
                return Err(first.at().wrap(Error::InvalidPipeline(
                    "a pipeline starting with $cursor cannot also take an input source".into(),
                )));
            }
            (Some(source), _) => source,
            (None, Some(first @ Step { stage: Stage::Cursor(query), .. })) => {
                skip = 1;
                open_source(query, services).await.map_err(|e| first.at().wrap(e))?
            }
            (None, _) => {
                return Err(Error::InvalidPipeline(
                    "no input source was given and the first stage is not $cursor".into(),
                ));
            }
        };
        for step in &self.steps[skip..] {
            cursor = step.open(cursor, services)?;
        }
        Ok(cursor)
    }

    /// Run over an in-memory array and collect the output.
    pub async fn run_array(&self, docs: Vec<Value>, services: &Services) -> Result<Vec<Value>> {
        let mut cursor = self.run(Some(ArrayCursor::new(docs).boxed()), services).await?;
        cursor.to_array().await
    }
}

async fn open_source(query: &QueryDescriptor, services: &Services) -> Result<BoxCursor> {
    let source = services
        .source
        .as_ref()
        .ok_or_else(|| Error::Source("no data source is configured for $cursor".into()))?;
    debug!(object = %query.object, "opening source cursor");
    source.query(query).await
}

/// Parse one stage. `Ok(None)` means an unknown stage that non-strict
/// configs skip.
fn parse_stage(name: &str, body: &JsonValue, parser: &Parser<'_>, config: &EngineConfig) -> Result<Option<Stage>> {
    let stage = match name {
        "$cursor" => Stage::Cursor(QueryDescriptor::from_json(body)?),
        "$match" => Stage::Match(Arc::new(query::parse_query(body)?)),
        "$project" => Stage::Project(Arc::new(Projection::parse(body, parser)?)),
        "$addFields" | "$set" => Stage::AddFields(Arc::new(AddFieldsSpec::parse(body, parser, config)?)),
        "$unwind" => Stage::Unwind(Arc::new(UnwindSpec::parse(body)?)),
        "$group" => Stage::Group(Arc::new(GroupSpec::parse(body, parser, config)?)),
        "$transform" => Stage::Transform(Arc::new(TransformSpec::parse(body, parser)?)),
        "$sort" => Stage::Sort(Arc::new(query::parse_sort(body)?)),
        "$skip" => Stage::Skip(count_arg(name, body)?),
        "$limit" => Stage::Limit(count_arg(name, body)?),
        "$count" => {
            let field = body
                .as_str()
                .filter(|f| !f.is_empty() && !f.starts_with('$') && !f.contains('.'))
                .ok_or_else(|| Error::InvalidPipeline("$count must be a non-empty field name".into()))?;
            Stage::Count(field.to_string())
        }
        _ if config.strict_stages => return Err(Error::UnknownStage(name.to_string())),
        _ => return Ok(None),
    };
    Ok(Some(stage))
}

fn count_arg(name: &str, body: &JsonValue) -> Result<usize> {
    body.as_u64()
        .map(|n| n as usize)
        .ok_or_else(|| Error::InvalidPipeline(format!("{name} must be a non-negative integer")))
}
