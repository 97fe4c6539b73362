use crate::{lock::LockStore, store::JobStore, DispatchEngine, DispatchError};

use super::{EmployerId, JobId, JobSpec, Location};

/// Builds the specification of an instant job before posting it to a [`DispatchEngine`].
#[derive(Debug, Clone)]
pub struct JobBuilder {
    title: String,
    location: Option<Location>,
    pay: u64,
    duration_hours: f64,
    skills: Vec<String>,
}

impl JobBuilder {
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            location: None,
            pay: 0,
            duration_hours: 1.0,
            skills: vec![],
        }
    }

    pub fn at(self, location: Location) -> Self {
        Self {
            location: Some(location),
            ..self
        }
    }

    /// Pay in minor currency units.
    pub fn paying(self, pay: u64) -> Self {
        Self { pay, ..self }
    }

    pub fn for_hours(self, duration_hours: f64) -> Self {
        Self {
            duration_hours,
            ..self
        }
    }

    pub fn add_skill(self, skill: impl Into<String>) -> Self {
        let mut skills = self.skills;
        skills.push(skill.into());
        Self { skills, ..self }
    }

    pub fn with_skills(self, skills: Vec<impl Into<String>>) -> Self {
        let skills = skills.into_iter().map(Into::into).collect();
        Self { skills, ..self }
    }

    /// The finished specification; jobs without a location are placed at the origin.
    pub fn build(self) -> JobSpec {
        JobSpec {
            title: self.title,
            location: self
                .location
                .unwrap_or_else(|| Location::new(0.0, 0.0, String::new())),
            pay: self.pay,
            duration_hours: self.duration_hours,
            skills: self.skills,
        }
    }

    /// Post the job for `employer_id` and start dispatching it.
    pub async fn post<S, L>(
        self,
        engine: &DispatchEngine<S, L>,
        employer_id: EmployerId,
    ) -> Result<JobId, DispatchError>
    where
        S: JobStore + Clone + Send + Sync + 'static,
        L: LockStore + Clone + Send + Sync + 'static,
    {
        engine.create_instant_job(employer_id, self.build()).await
    }
}
