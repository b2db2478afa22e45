//! Structural validation of pipeline definitions
//!
//! Pure checks over a parsed [`PipelineDefinition`]; nothing here touches Lua.

use std::collections::HashSet;

use conduit_core::domain::dag::topological_order;
use conduit_core::domain::definition::PipelineDefinition;
use conduit_core::domain::job::{TriggerSpec, TriggerTarget, WhenPolicy};
use thiserror::Error;

/// Highest automatic retry count a job may request
pub const MAX_RETRY: u8 = 2;

#[derive(Debug, Error, PartialEq)]
pub enum ValidationError {
    #[error("pipeline must define at least one job")]
    NoJobs,

    #[error("pipeline must declare at least one stage")]
    EmptyStages,

    #[error("job name cannot be empty")]
    EmptyJobName,

    #[error("job '{0}' is defined more than once")]
    DuplicateJob(String),

    #[error("job '{job}' uses unknown stage '{stage}'")]
    UnknownStage { job: String, stage: String },

    #[error("job '{0}' needs a script or a trigger")]
    MissingScript(String),

    #[error("job '{job}' needs unknown job '{need}'")]
    UnknownNeed { job: String, need: String },

    #[error("job '{0}' cannot need itself")]
    SelfNeed(String),

    #[error("job '{job}' needs '{need}' from a later stage")]
    NeedsLaterStage { job: String, need: String },

    #[error("needs form a cycle between jobs: {}", .0.join(", "))]
    CyclicNeeds(Vec<String>),

    #[error("delayed job '{0}' must set start_in")]
    MissingStartIn(String),

    #[error("job '{job}' retry must be between 0 and {max}, got {retry}", max = MAX_RETRY)]
    RetryOutOfRange { job: String, retry: u8 },

    #[error("child pipeline of job '{job}': {source}")]
    Child {
        job: String,
        source: Box<ValidationError>,
    },
}

/// Validate a pipeline definition, returning the first problem found
pub fn validate_definition(definition: &PipelineDefinition) -> Result<(), ValidationError> {
    if definition.stages.is_empty() {
        return Err(ValidationError::EmptyStages);
    }
    if definition.jobs.is_empty() {
        return Err(ValidationError::NoJobs);
    }

    let mut seen = HashSet::new();
    for job in &definition.jobs {
        if job.name.trim().is_empty() {
            return Err(ValidationError::EmptyJobName);
        }
        if !seen.insert(job.name.as_str()) {
            return Err(ValidationError::DuplicateJob(job.name.clone()));
        }
        if definition.stage_index(&job.stage).is_none() {
            return Err(ValidationError::UnknownStage {
                job: job.name.clone(),
                stage: job.stage.clone(),
            });
        }
        if job.script.is_empty() && job.trigger.is_none() {
            return Err(ValidationError::MissingScript(job.name.clone()));
        }
        if job.when == WhenPolicy::Delayed && job.start_in_secs.is_none() {
            return Err(ValidationError::MissingStartIn(job.name.clone()));
        }
        if job.retry > MAX_RETRY {
            return Err(ValidationError::RetryOutOfRange {
                job: job.name.clone(),
                retry: job.retry,
            });
        }
    }

    validate_needs(definition)?;

    for job in &definition.jobs {
        if let Some(TriggerSpec {
            target: TriggerTarget::Child { definition: child },
            ..
        }) = &job.trigger
        {
            validate_definition(child).map_err(|source| ValidationError::Child {
                job: job.name.clone(),
                source: Box::new(source),
            })?;
        }
    }

    Ok(())
}

fn validate_needs(definition: &PipelineDefinition) -> Result<(), ValidationError> {
    for job in &definition.jobs {
        let Some(needs) = &job.needs else { continue };
        // Stage of the job was checked already
        let job_stage = definition.stage_index(&job.stage).unwrap_or_default();

        for need in needs {
            if need == &job.name {
                return Err(ValidationError::SelfNeed(job.name.clone()));
            }
            let Some(needed) = definition.job(need) else {
                return Err(ValidationError::UnknownNeed {
                    job: job.name.clone(),
                    need: need.clone(),
                });
            };
            let need_stage = definition.stage_index(&needed.stage).unwrap_or_default();
            if need_stage > job_stage {
                return Err(ValidationError::NeedsLaterStage {
                    job: job.name.clone(),
                    need: need.clone(),
                });
            }
        }
    }

    let graph: Vec<(&str, Vec<&str>)> = definition
        .jobs
        .iter()
        .map(|job| {
            let needs = job
                .needs
                .iter()
                .flatten()
                .map(String::as_str)
                .collect::<Vec<_>>();
            (job.name.as_str(), needs)
        })
        .collect();

    if topological_order(&graph).is_none() {
        let cyclic = cycle_members(&graph);
        return Err(ValidationError::CyclicNeeds(cyclic));
    }

    Ok(())
}

/// Jobs left over after repeatedly removing jobs with no remaining needs
fn cycle_members(graph: &[(&str, Vec<&str>)]) -> Vec<String> {
    let mut remaining: Vec<(&str, Vec<&str>)> = graph.to_vec();
    loop {
        let resolved: HashSet<&str> = remaining
            .iter()
            .filter(|(_, needs)| {
                needs
                    .iter()
                    .all(|need| !remaining.iter().any(|(name, _)| name == need))
            })
            .map(|(name, _)| *name)
            .collect();
        if resolved.is_empty() {
            break;
        }
        remaining.retain(|(name, _)| !resolved.contains(name));
    }
    remaining.into_iter().map(|(name, _)| name.to_string()).collect()
}
