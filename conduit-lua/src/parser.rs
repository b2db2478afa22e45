//! Pipeline definition parser
//!
//! This module evaluates a `.conduit.lua` definition in the sandbox and
//! extracts the stages, variables and jobs of a pipeline. Nothing in a
//! definition is executed beyond building the returned table.

use anyhow::{Context, Result, anyhow, bail};
use conduit_core::domain::definition::{
    DEFAULT_STAGE, DEFAULT_STAGES, JobDefinition, PipelineDefinition,
};
use conduit_core::domain::job::{ArtifactsSpec, TriggerSpec, TriggerTarget, WhenPolicy};
use mlua::{Table, Value};
use std::collections::BTreeMap;

use crate::sandbox::create_sandbox;
use crate::validate::validate_definition;

/// Parse and validate a pipeline definition from Lua source code
///
/// # Errors
/// Returns an error if:
/// - The Lua source is invalid or does not return a table
/// - Required fields are missing (`jobs`, job `name`)
/// - Field types are incorrect
/// - The definition fails structural validation
///
/// # Example
/// ```no_run
/// use conduit_lua::parser::parse_pipeline_definition;
///
/// let source = r#"
///     return pipeline.define {
///         stages = { "build", "test" },
///         jobs = {
///             { name = "compile", stage = "build", script = "cargo build" },
///             { name = "unit", stage = "test", script = { "cargo test" }, needs = { "compile" } },
///         },
///     }
/// "#;
///
/// let definition = parse_pipeline_definition(source)?;
/// assert_eq!(definition.jobs.len(), 2);
/// # Ok::<(), anyhow::Error>(())
/// ```
pub fn parse_pipeline_definition(source: &str) -> Result<PipelineDefinition> {
    let lua = create_sandbox().context("Failed to create sandbox")?;

    let value: Value = lua
        .load(source)
        .set_name("pipeline definition")
        .eval()
        .context("Failed to evaluate pipeline definition")?;

    let Value::Table(table) = value else {
        bail!("Pipeline definition must return a table");
    };

    let definition = parse_definition_table(&table)?;
    validate_definition(&definition)?;

    Ok(definition)
}

fn parse_definition_table(table: &Table) -> Result<PipelineDefinition> {
    let stages = match table.get::<Value>("stages")? {
        Value::Nil => DEFAULT_STAGES.iter().map(|s| s.to_string()).collect(),
        Value::Table(stages) => string_list(&stages, "stages")?,
        _ => bail!("Field 'stages' must be an array of strings"),
    };

    let variables = parse_variables(table.get("variables")?, "variables")?;

    let jobs_table: Table = match table.get::<Value>("jobs")? {
        Value::Table(jobs) => jobs,
        Value::Nil => bail!("Pipeline must have a 'jobs' field"),
        _ => bail!("Field 'jobs' must be an array of job tables"),
    };

    let mut jobs = Vec::new();
    for (position, entry) in jobs_table.sequence_values::<Table>().enumerate() {
        let job_table = entry.with_context(|| format!("Job #{} must be a table", position + 1))?;
        jobs.push(parse_job(&job_table)?);
    }

    Ok(PipelineDefinition {
        stages,
        variables,
        jobs,
    })
}

fn parse_job(table: &Table) -> Result<JobDefinition> {
    let name: String = table
        .get::<Option<String>>("name")?
        .context("Job must have a 'name' field")?;

    let field = |key: &str| format!("job '{name}' field '{key}'");

    let stage = table
        .get::<Option<String>>("stage")
        .with_context(|| field("stage"))?
        .unwrap_or_else(|| DEFAULT_STAGE.to_string());

    let script = match table.get::<Value>("script")? {
        Value::Nil => Vec::new(),
        Value::String(line) => vec![line.to_str()?.to_string()],
        Value::Table(lines) => string_list(&lines, &field("script"))?,
        _ => bail!("{} must be a string or an array of strings", field("script")),
    };

    let when = match table.get::<Option<String>>("when").with_context(|| field("when"))? {
        None => WhenPolicy::OnSuccess,
        Some(when) => parse_when(&when).with_context(|| field("when"))?,
    };

    let needs = match table.get::<Value>("needs")? {
        Value::Nil => None,
        Value::Table(needs) => Some(string_list(&needs, &field("needs"))?),
        _ => bail!("{} must be an array of job names", field("needs")),
    };

    let tags = match table.get::<Value>("tags")? {
        Value::Nil => Vec::new(),
        Value::Table(tags) => string_list(&tags, &field("tags"))?,
        _ => bail!("{} must be an array of strings", field("tags")),
    };

    let allow_failure = table
        .get::<Option<bool>>("allow_failure")
        .with_context(|| field("allow_failure"))?
        .unwrap_or(when == WhenPolicy::Manual);

    let start_in_secs = parse_duration_field(table, "start_in").with_context(|| field("start_in"))?;
    let timeout_secs = parse_duration_field(table, "timeout").with_context(|| field("timeout"))?;

    let retry = table
        .get::<Option<u8>>("retry")
        .with_context(|| field("retry"))?
        .unwrap_or(0);

    let artifacts = match table.get::<Value>("artifacts")? {
        Value::Nil => None,
        Value::Table(artifacts) => Some(parse_artifacts(&artifacts).with_context(|| field("artifacts"))?),
        _ => bail!("{} must be a table", field("artifacts")),
    };

    let trigger = match table.get::<Value>("trigger")? {
        Value::Nil => None,
        Value::Table(trigger) => Some(parse_trigger(&trigger).with_context(|| field("trigger"))?),
        _ => bail!("{} must be a table", field("trigger")),
    };

    let environment: Option<String> = table
        .get("environment")
        .with_context(|| field("environment"))?;
    let image: Option<String> = table.get("image").with_context(|| field("image"))?;
    let variables = parse_variables(table.get("variables")?, &field("variables"))?;

    Ok(JobDefinition {
        name,
        stage,
        script,
        when,
        start_in_secs,
        needs,
        tags,
        allow_failure,
        environment,
        variables,
        image,
        timeout_secs,
        retry,
        artifacts,
        trigger,
    })
}

fn parse_when(when: &str) -> Result<WhenPolicy> {
    match when {
        "on_success" => Ok(WhenPolicy::OnSuccess),
        "on_failure" => Ok(WhenPolicy::OnFailure),
        "always" => Ok(WhenPolicy::Always),
        "manual" => Ok(WhenPolicy::Manual),
        "delayed" => Ok(WhenPolicy::Delayed),
        other => Err(anyhow!(
            "unknown policy '{other}', expected on_success, on_failure, always, manual or delayed"
        )),
    }
}

fn parse_artifacts(table: &Table) -> Result<ArtifactsSpec> {
    let paths = match table.get::<Value>("paths")? {
        Value::Table(paths) => string_list(&paths, "paths")?,
        Value::Nil => bail!("artifacts must list 'paths'"),
        _ => bail!("'paths' must be an array of strings"),
    };

    Ok(ArtifactsSpec {
        paths,
        expire_in_secs: parse_duration_field(table, "expire_in")?,
    })
}

fn parse_trigger(table: &Table) -> Result<TriggerSpec> {
    let depend = match table.get::<Option<String>>("strategy")? {
        None => false,
        Some(strategy) if strategy == "depend" => true,
        Some(strategy) => bail!("unknown strategy '{strategy}', expected 'depend'"),
    };

    let child: Option<Table> = table.get("child")?;
    let project: Option<String> = table.get("project")?;

    let target = match (child, project) {
        (Some(child), None) => TriggerTarget::Child {
            definition: Box::new(parse_definition_table(&child).context("child pipeline")?),
        },
        (None, Some(project)) => TriggerTarget::Project {
            project,
            branch: table.get("branch")?,
        },
        (Some(_), Some(_)) => bail!("trigger cannot set both 'child' and 'project'"),
        (None, None) => bail!("trigger must set 'child' or 'project'"),
    };

    Ok(TriggerSpec { target, depend })
}

fn parse_variables(value: Value, what: &str) -> Result<BTreeMap<String, String>> {
    match value {
        Value::Nil => Ok(BTreeMap::new()),
        Value::Table(table) => {
            let mut variables = BTreeMap::new();
            for pair in table.pairs::<String, Value>() {
                let (key, value) = pair.with_context(|| format!("Failed to read {what} entry"))?;
                let value = scalar_to_string(value)
                    .with_context(|| format!("{what} '{key}' must be a string, number or boolean"))?;
                variables.insert(key, value);
            }
            Ok(variables)
        }
        _ => bail!("{what} must be a table of name = value pairs"),
    }
}

fn scalar_to_string(value: Value) -> Result<String> {
    match value {
        Value::String(s) => Ok(s.to_str()?.to_string()),
        Value::Integer(i) => Ok(i.to_string()),
        Value::Number(n) => Ok(n.to_string()),
        Value::Boolean(b) => Ok(b.to_string()),
        other => Err(anyhow!("unsupported value of type {}", other.type_name())),
    }
}

fn string_list(table: &Table, what: &str) -> Result<Vec<String>> {
    let mut items = Vec::new();
    for item in table.sequence_values::<String>() {
        items.push(item.with_context(|| format!("{what} must contain only strings"))?);
    }
    Ok(items)
}

/// Read a duration given either as seconds or as a string such as `"30s"`,
/// `"5 minutes"` or `"1 week"`
fn parse_duration_field(table: &Table, key: &str) -> Result<Option<u64>> {
    match table.get::<Value>(key)? {
        Value::Nil => Ok(None),
        Value::Integer(secs) if secs >= 0 => Ok(Some(secs as u64)),
        Value::Number(secs) if secs >= 0.0 => Ok(Some(secs as u64)),
        Value::String(text) => parse_duration(&text.to_str()?).map(Some),
        _ => bail!("'{key}' must be a non-negative number of seconds or a duration string"),
    }
}

pub fn parse_duration(text: &str) -> Result<u64> {
    let text = text.trim();
    let split = text
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(text.len());
    let (amount, unit) = text.split_at(split);
    let amount: u64 = amount
        .parse()
        .with_context(|| format!("invalid duration '{text}'"))?;

    let multiplier = match unit.trim() {
        "" | "s" | "sec" | "secs" | "second" | "seconds" => 1,
        "m" | "min" | "mins" | "minute" | "minutes" => 60,
        "h" | "hr" | "hrs" | "hour" | "hours" => 3_600,
        "d" | "day" | "days" => 86_400,
        "w" | "week" | "weeks" => 604_800,
        other => bail!("unknown duration unit '{other}' in '{text}'"),
    };

    Ok(amount * multiplier)
}
