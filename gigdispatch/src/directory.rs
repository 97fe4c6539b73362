//! Profile lookups backed by the user store, and an in memory stand-in for it.
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use fxhash::FxHashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    eligibility::{Candidate, CandidateQuery, EligibilityError, EligibilityQuery},
    job::{Actor, EmployerId, Location, WorkerId},
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContactCard {
    pub name: String,
    pub phone: String,
}

#[async_trait]
pub trait ContactDirectory {
    async fn contact_card(&self, user: &Actor) -> Result<Option<ContactCard>, DirectoryError>;
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DirectoryError {
    #[error("Directory in bad state")]
    BadState,
}

/// A directory with no entries, used until a real one is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct EmptyDirectory;

#[async_trait]
impl ContactDirectory for EmptyDirectory {
    async fn contact_card(&self, _user: &Actor) -> Result<Option<ContactCard>, DirectoryError> {
        Ok(None)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct WorkerProfile {
    pub id: WorkerId,
    pub contact: ContactCard,
    pub location: Location,
    pub online: bool,
    pub kyc_approved: bool,
    pub skills: Vec<String>,
}

impl WorkerProfile {
    pub fn new(id: impl Into<WorkerId>, name: impl Into<String>, location: Location) -> Self {
        Self {
            id: id.into(),
            contact: ContactCard {
                name: name.into(),
                phone: String::new(),
            },
            location,
            online: true,
            kyc_approved: true,
            skills: vec![],
        }
    }

    pub fn with_phone(mut self, phone: impl Into<String>) -> Self {
        self.contact.phone = phone.into();
        self
    }

    pub fn with_skills(mut self, skills: Vec<impl Into<String>>) -> Self {
        self.skills = skills.into_iter().map(Into::into).collect();
        self
    }

    pub fn offline(mut self) -> Self {
        self.online = false;
        self
    }

    pub fn kyc_pending(mut self) -> Self {
        self.kyc_approved = false;
        self
    }

    fn is_eligible_for(&self, query: &CandidateQuery) -> bool {
        self.online
            && self.kyc_approved
            && query
                .skills
                .iter()
                .all(|skill| self.skills.iter().any(|s| s == skill))
    }
}

/// An in memory directory of workers and employers.
///
/// Implements both [`EligibilityQuery`] and [`ContactDirectory`]; intended for tests and demos.
#[derive(Clone, Default)]
pub struct InMemoryDirectory {
    workers: Arc<RwLock<FxHashMap<WorkerId, WorkerProfile>>>,
    employers: Arc<RwLock<FxHashMap<EmployerId, ContactCard>>>,
}

impl InMemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert_worker(&self, profile: WorkerProfile) -> Result<(), DirectoryError> {
        self.workers
            .write()
            .map_err(|_| DirectoryError::BadState)?
            .insert(profile.id.clone(), profile);
        Ok(())
    }

    pub fn upsert_employer(
        &self,
        id: impl Into<EmployerId>,
        contact: ContactCard,
    ) -> Result<(), DirectoryError> {
        self.employers
            .write()
            .map_err(|_| DirectoryError::BadState)?
            .insert(id.into(), contact);
        Ok(())
    }

    pub fn set_online(&self, id: &WorkerId, online: bool) -> Result<(), DirectoryError> {
        if let Some(profile) = self
            .workers
            .write()
            .map_err(|_| DirectoryError::BadState)?
            .get_mut(id)
        {
            profile.online = online;
        }
        Ok(())
    }
}

#[async_trait]
impl EligibilityQuery for InMemoryDirectory {
    async fn nearby_workers(
        &self,
        query: &CandidateQuery,
    ) -> Result<Vec<Candidate>, EligibilityError> {
        let workers = self
            .workers
            .read()
            .map_err(|_| EligibilityError::Unavailable("worker directory poisoned".to_owned()))?;
        let mut candidates: Vec<_> = workers
            .values()
            .filter(|profile| profile.is_eligible_for(query))
            .map(|profile| Candidate {
                worker_id: profile.id.clone(),
                distance_km: profile.location.distance_km(&query.location),
            })
            .filter(|candidate| candidate.distance_km <= query.radius_km)
            .collect();
        candidates.sort_by(|a, b| {
            a.distance_km
                .total_cmp(&b.distance_km)
                .then_with(|| a.worker_id.cmp(&b.worker_id))
        });
        candidates.truncate(query.limit);
        Ok(candidates)
    }
}

#[async_trait]
impl ContactDirectory for InMemoryDirectory {
    async fn contact_card(&self, user: &Actor) -> Result<Option<ContactCard>, DirectoryError> {
        Ok(match user {
            Actor::Worker(id) => self
                .workers
                .read()
                .map_err(|_| DirectoryError::BadState)?
                .get(id)
                .map(|profile| profile.contact.clone()),
            Actor::Employer(id) => self
                .employers
                .read()
                .map_err(|_| DirectoryError::BadState)?
                .get(id)
                .cloned(),
        })
    }
}
