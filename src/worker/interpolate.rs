//! `@variable@` substitution in job definitions.
//!
//! Supported variables: `project_path`, `job_name`, `ref`, `branch`, `tag`,
//! `commit_hash`, `build_number`, `pull_request`, `param:<name>` and
//! `secret:<name>`. `@@` produces a literal `@`.

use std::sync::LazyLock;

use regex::Regex;

use crate::auth::SecretResolver;
use crate::error::{MeshError, Result};
use crate::model::spec::ParamType;
use crate::model::{
    ref_to_branch, ref_to_tag, Action, ActionKind, Build, BuildSelector, CacheSpec, ParamMatrix,
    ParamSupply, ProjectDependency, Service, Step, StepKind,
};

/// `@name@`, with `@@` matching an empty name.
#[allow(clippy::expect_used)]
static VARIABLE_PATTERN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"@([^@]*)@").expect("constant regex pattern is valid"));

pub struct InterpolationContext<'a> {
    project_path: &'a str,
    build: &'a Build,
    secrets: &'a dyn SecretResolver,
    revealed: Vec<String>,
}

impl<'a> InterpolationContext<'a> {
    pub fn new(project_path: &'a str, build: &'a Build, secrets: &'a dyn SecretResolver) -> Self {
        Self {
            project_path,
            build,
            secrets,
            revealed: Vec::new(),
        }
    }

    /// Secret values substituted so far, to be masked in job logs.
    pub fn revealed_secrets(&self) -> &[String] {
        &self.revealed
    }

    pub fn interpolate(&mut self, text: &str) -> Result<String> {
        let mut output = String::with_capacity(text.len());
        let mut last = 0;
        for caps in VARIABLE_PATTERN.captures_iter(text) {
            let (Some(whole), Some(variable)) = (caps.get(0), caps.get(1)) else {
                continue;
            };
            output.push_str(&text[last..whole.start()]);
            match variable.as_str() {
                "" => output.push('@'),
                name => output.push_str(&self.resolve(name)?),
            }
            last = whole.end();
        }
        let rest = &text[last..];
        if rest.contains('@') {
            return Err(MeshError::Explicit(format!(
                "Unterminated variable in '{}'",
                text
            )));
        }
        output.push_str(rest);
        Ok(output)
    }

    fn resolve(&mut self, variable: &str) -> Result<String> {
        if let Some(name) = variable.strip_prefix("param:") {
            let param = self.build.params.get(name).ok_or_else(|| {
                MeshError::Explicit(format!("Param not found: {}", name))
            })?;
            let value = param.values.join(",");
            if param.param_type == ParamType::Secret {
                self.revealed.extend(param.values.iter().cloned());
            }
            return Ok(value);
        }
        if let Some(name) = variable.strip_prefix("secret:") {
            let value = self
                .secrets
                .secret(self.build.project_id, name)
                .ok_or_else(|| MeshError::Explicit(format!("Secret not found: {}", name)))?;
            self.revealed.push(value.clone());
            return Ok(value);
        }
        let value = match variable {
            "project_path" => self.project_path.to_string(),
            "job_name" => self.build.job_name.clone(),
            "ref" => self.build.ref_name.clone(),
            "branch" => ref_to_branch(&self.build.ref_name).unwrap_or_default().to_string(),
            "tag" => ref_to_tag(&self.build.ref_name).unwrap_or_default().to_string(),
            "commit_hash" => self.build.commit_hash.clone(),
            "build_number" => self.build.number.to_string(),
            "pull_request" => self
                .build
                .request
                .map(|r| r.to_string())
                .unwrap_or_default(),
            other => {
                return Err(MeshError::Explicit(format!(
                    "Unrecognized interpolation variable: {}",
                    other
                )))
            }
        };
        Ok(value)
    }

    pub fn interpolate_steps(&mut self, steps: &[Step]) -> Result<Vec<Action>> {
        steps.iter().map(|step| self.interpolate_step(step)).collect()
    }

    fn interpolate_step(&mut self, step: &Step) -> Result<Action> {
        let kind = match &step.kind {
            StepKind::Command { image, commands } => ActionKind::Command {
                image: image.as_deref().map(|i| self.interpolate(i)).transpose()?,
                commands: self.interpolate(commands)?,
            },
            StepKind::Server {
                step_type,
                properties,
            } => ActionKind::Server {
                step_type: step_type.clone(),
                properties: properties
                    .iter()
                    .map(|(k, v)| Ok((k.clone(), self.interpolate(v)?)))
                    .collect::<Result<_>>()?,
            },
            StepKind::Composite { steps } => ActionKind::Composite {
                actions: self.interpolate_steps(steps)?,
            },
        };
        Ok(Action {
            name: self.interpolate(&step.name)?,
            kind,
        })
    }

    pub fn interpolate_caches(&mut self, caches: &[CacheSpec]) -> Result<Vec<CacheSpec>> {
        caches
            .iter()
            .map(|cache| {
                Ok(CacheSpec {
                    key: self.interpolate(&cache.key)?,
                    path: self.interpolate(&cache.path)?,
                })
            })
            .collect()
    }

    pub fn interpolate_services(&mut self, services: &[Service]) -> Result<Vec<Service>> {
        services
            .iter()
            .map(|service| {
                Ok(Service {
                    name: service.name.clone(),
                    image: self.interpolate(&service.image)?,
                    env: service
                        .env
                        .iter()
                        .map(|(k, v)| Ok((k.clone(), self.interpolate(v)?)))
                        .collect::<Result<_>>()?,
                })
            })
            .collect()
    }

    pub fn interpolate_project_dependency(&mut self, dependency: &ProjectDependency) -> Result<ProjectDependency> {
        let build = match &dependency.build {
            BuildSelector::LastSuccessful { job_name, ref_name } => BuildSelector::LastSuccessful {
                job_name: self.interpolate(job_name)?,
                ref_name: ref_name.as_deref().map(|r| self.interpolate(r)).transpose()?,
            },
            BuildSelector::Number { number } => BuildSelector::Number { number: *number },
        };
        Ok(ProjectDependency {
            project_path: self.interpolate(&dependency.project_path)?,
            build,
            access_token_secret: dependency
                .access_token_secret
                .as_deref()
                .map(|s| self.interpolate(s))
                .transpose()?,
            artifacts: dependency.artifacts.as_deref().map(|a| self.interpolate(a)).transpose()?,
            destination_path: dependency
                .destination_path
                .as_deref()
                .map(|d| self.interpolate(d))
                .transpose()?,
        })
    }

    /// Parameter alternatives with every value interpolated.
    pub fn interpolate_supplies(&mut self, supplies: &[ParamSupply]) -> Result<ParamMatrix> {
        let mut matrix = ParamMatrix::new();
        for supply in supplies {
            let mut alternatives = Vec::with_capacity(supply.values.len());
            for values in &supply.values {
                alternatives.push(
                    values
                        .iter()
                        .map(|v| self.interpolate(v))
                        .collect::<Result<Vec<_>>>()?,
                );
            }
            matrix.insert(supply.name.clone(), alternatives);
        }
        Ok(matrix)
    }
}
