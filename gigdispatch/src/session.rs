//! A client connection to the engine.
//!
//! The transport (a socket server, a test harness) creates one [`Session`] per connected client
//! and feeds it the client's JSON messages. Each session is bound to a single actor, receives
//! that actor's events, and is only allowed to perform that actor's side of the protocol.
use std::pin::Pin;

use futures::Stream;
use serde::{Deserialize, Serialize};

use crate::{
    channel::{ChannelId, Event, Subscription},
    coordinator::Decision,
    job::{Actor, ArrivalStatus, JobId, JobSpec, JobStatus, JobView},
    lock::LockStore,
    store::JobStore,
    CancellationOutcome, ContactInfo, DispatchEngine, DispatchError,
};

/// An inbound client message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum Action {
    Post { job: JobSpec },
    Accept { job_id: JobId },
    Confirm { job_id: JobId, decision: Decision },
    Cancel { job_id: JobId },
    MarkArrived { job_id: JobId },
    Status { job_id: JobId },
    Contact { job_id: JobId },
    RequestCompletion { job_id: JobId },
    ApproveCompletion { job_id: JobId },
}

impl Action {
    fn name(&self) -> &'static str {
        match self {
            Action::Post { .. } => "post",
            Action::Accept { .. } => "accept",
            Action::Confirm { .. } => "confirm",
            Action::Cancel { .. } => "cancel",
            Action::MarkArrived { .. } => "mark-arrived",
            Action::Status { .. } => "status",
            Action::Contact { .. } => "contact",
            Action::RequestCompletion { .. } => "request-completion",
            Action::ApproveCompletion { .. } => "approve-completion",
        }
    }
}

/// The answer to an [`Action`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "reply", rename_all = "kebab-case", rename_all_fields = "camelCase")]
pub enum Reply {
    Job { job: JobView },
    Arrival {
        job_id: JobId,
        arrival_status: ArrivalStatus,
    },
    Cancelled {
        job_id: JobId,
        status: JobStatus,
        fee_applied: bool,
        fee: u64,
    },
    Contact { contact: ContactInfo },
    Error { code: String, message: String },
}

impl Reply {
    fn error(code: &str, message: impl Into<String>) -> Self {
        Reply::Error {
            code: code.to_owned(),
            message: message.into(),
        }
    }
}

impl From<DispatchError> for Reply {
    fn from(value: DispatchError) -> Self {
        Reply::error(value.code(), value.to_string())
    }
}

impl From<CancellationOutcome> for Reply {
    fn from(value: CancellationOutcome) -> Self {
        Reply::Cancelled {
            job_id: value.job_id,
            status: value.status,
            fee_applied: value.fee_applied,
            fee: value.fee,
        }
    }
}

pub struct Session<S, L> {
    engine: DispatchEngine<S, L>,
    actor: Actor,
    events: Subscription,
}

impl<S, L> Session<S, L>
where
    S: JobStore + Clone + Send + Sync + 'static,
    L: LockStore + Clone + Send + Sync + 'static,
{
    pub(crate) fn new(engine: DispatchEngine<S, L>, actor: Actor) -> Self {
        let events = engine.events().subscribe(ChannelId::from(&actor));
        Self {
            engine,
            actor,
            events,
        }
    }

    pub fn actor(&self) -> &Actor {
        &self.actor
    }

    /// The next event pushed to this session's actor.
    pub async fn next_event(&mut self) -> Option<Event> {
        self.events.recv().await
    }

    pub fn into_events(self) -> Pin<Box<dyn Stream<Item = Event> + Send>> {
        self.events.into_stream()
    }

    /// Handle a raw JSON message, returning the JSON reply.
    pub async fn handle_message(&self, message: &str) -> String {
        let reply = match serde_json::from_str::<Action>(message) {
            Ok(action) => self.handle(action).await,
            Err(err) => Reply::error("bad_request", err.to_string()),
        };
        serde_json::to_string(&reply).unwrap_or_else(|err| {
            tracing::error!(?err, "Failed to serialize reply: {err}");
            r#"{"reply":"error","code":"internal","message":"unserializable reply"}"#.to_owned()
        })
    }

    pub async fn handle(&self, action: Action) -> Reply {
        let name = action.name();
        tracing::debug!(actor = %self.actor, action = name, "Handling {name} from {}", self.actor);
        match (action, &self.actor) {
            (Action::Post { job }, Actor::Employer(employer_id)) => {
                match self
                    .engine
                    .create_instant_job(employer_id.clone(), job)
                    .await
                {
                    Ok(job_id) => self.engine.get_status(job_id).await.into_reply(),
                    Err(err) => err.into(),
                }
            }
            (Action::Accept { job_id }, Actor::Worker(worker_id)) => self
                .engine
                .accept_job(job_id, worker_id.clone())
                .await
                .into_reply(),
            (Action::Confirm { job_id, decision }, Actor::Employer(employer_id)) => self
                .engine
                .confirm_worker(job_id, employer_id.clone(), decision)
                .await
                .into_reply(),
            (Action::Cancel { job_id }, Actor::Employer(employer_id)) => {
                match self.engine.cancel_job(job_id, employer_id.clone()).await {
                    Ok(outcome) => outcome.into(),
                    Err(err) => err.into(),
                }
            }
            (Action::MarkArrived { job_id }, actor) => {
                match self.engine.mark_arrived(job_id, actor.clone()).await {
                    Ok(arrival_status) => Reply::Arrival {
                        job_id,
                        arrival_status,
                    },
                    Err(err) => err.into(),
                }
            }
            (Action::Status { job_id }, actor) => match self.engine.get_status(job_id).await {
                Ok(job) => match self.can_view(&job) {
                    Ok(true) => Reply::Job { job },
                    Ok(false) => forbidden(name, actor),
                    Err(err) => err.into(),
                },
                Err(err) => err.into(),
            },
            (Action::Contact { job_id }, actor) => {
                match self.engine.get_contact_info(job_id, actor.clone()).await {
                    Ok(contact) => Reply::Contact { contact },
                    Err(err) => err.into(),
                }
            }
            (Action::RequestCompletion { job_id }, Actor::Worker(worker_id)) => self
                .engine
                .request_completion(job_id, worker_id.clone())
                .await
                .into_reply(),
            (Action::ApproveCompletion { job_id }, Actor::Employer(employer_id)) => self
                .engine
                .approve_completion(job_id, employer_id.clone())
                .await
                .into_reply(),
            (_, actor) => forbidden(name, actor),
        }
    }

    /// Employers see their own jobs; workers see jobs they hold or were assigned, or that are
    /// offered to them in the open wave.
    fn can_view(&self, job: &JobView) -> Result<bool, DispatchError> {
        Ok(match &self.actor {
            Actor::Employer(employer_id) => &job.employer_id == employer_id,
            Actor::Worker(worker_id) => {
                job.locked_by.as_ref() == Some(worker_id)
                    || job.accepted_by.as_ref() == Some(worker_id)
                    || (job.status == JobStatus::Dispatching
                        && self.engine.is_offered(job.job_id, worker_id)?)
            }
        })
    }
}

fn forbidden(action: &str, actor: &Actor) -> Reply {
    Reply::error("forbidden", format!("{actor} may not {action} this job"))
}

trait IntoReply {
    fn into_reply(self) -> Reply;
}

impl IntoReply for Result<JobView, DispatchError> {
    fn into_reply(self) -> Reply {
        match self {
            Ok(job) => Reply::Job { job },
            Err(err) => err.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use serde_json::{json, Value};

    use super::*;
    use crate::{
        lock::memory::InMemoryLockStore,
        store::memory::InMemoryJobStore,
        test::{confirmed, engine_with, post, until_pinged},
    };

    async fn send(session: &Session<InMemoryJobStore, InMemoryLockStore>, message: Value) -> Value {
        let reply = session.handle_message(&message.to_string()).await;
        serde_json::from_str(&reply).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn worker_accepts_over_the_wire() {
        let engine = engine_with(&["w1"]);
        let session = engine.connect(Actor::Worker("w1".into()));
        let job_id = post(&engine).await;
        until_pinged(&engine, job_id, "w1").await;

        let reply = send(&session, json!({"action": "accept", "jobId": job_id})).await;

        assert_eq!(reply["reply"], "job");
        assert_eq!(reply["job"]["status"], "locked");
        assert_eq!(reply["job"]["lockedBy"], "w1");
    }

    #[tokio::test(start_paused = true)]
    async fn employer_posts_and_confirms() {
        let engine = engine_with(&["w1"]);
        let employer = engine.connect(Actor::Employer("e1".into()));
        let worker = engine.connect(Actor::Worker("w1".into()));

        let posted = send(
            &employer,
            json!({"action": "post", "job": serde_json::to_value(JobSpec::mock_spec()).unwrap()}),
        )
        .await;
        assert_eq!(posted["job"]["status"], "dispatching");
        let job_id: JobId = serde_json::from_value(posted["job"]["jobId"].clone()).unwrap();
        until_pinged(&engine, job_id, "w1").await;
        send(&worker, json!({"action": "accept", "jobId": job_id})).await;

        let reply = send(
            &employer,
            json!({"action": "confirm", "jobId": job_id, "decision": "confirm"}),
        )
        .await;

        assert_eq!(reply["job"]["status"], "confirmed");
        assert_eq!(reply["job"]["acceptedBy"], "w1");
    }

    #[tokio::test(start_paused = true)]
    async fn errors_carry_codes() {
        let engine = engine_with(&["w1", "w2"]);
        let w2 = engine.connect(Actor::Worker("w2".into()));
        let job_id = post(&engine).await;
        until_pinged(&engine, job_id, "w1").await;
        engine.accept_job(job_id, "w1".into()).await.unwrap();

        let taken = send(&w2, json!({"action": "accept", "jobId": job_id})).await;
        let missing = send(&w2, json!({"action": "status", "jobId": 999})).await;
        let garbage = send(&w2, json!({"action": "fly"})).await;

        assert_eq!(taken["reply"], "error");
        assert_eq!(taken["code"], "lock_unavailable");
        assert_eq!(missing["code"], "not_found");
        assert_eq!(garbage["code"], "bad_request");
    }

    #[tokio::test(start_paused = true)]
    async fn roles_are_enforced() {
        let engine = engine_with(&["w1"]);
        let worker = engine.connect(Actor::Worker("w1".into()));
        let employer = engine.connect(Actor::Employer("e1".into()));
        let job_id = post(&engine).await;

        let cancel = worker.handle(Action::Cancel { job_id }).await;
        let accept = employer.handle(Action::Accept { job_id }).await;

        assert_matches!(cancel, Reply::Error { code, .. } if code == "forbidden");
        assert_matches!(accept, Reply::Error { code, .. } if code == "forbidden");
    }

    #[tokio::test(start_paused = true)]
    async fn cancel_reply_reports_fee() {
        let engine = engine_with(&["w1"]);
        let employer = engine.connect(Actor::Employer("e1".into()));
        let job_id = confirmed(&engine).await;

        let reply = employer.handle(Action::Cancel { job_id }).await;

        assert_eq!(
            reply,
            Reply::Cancelled {
                job_id,
                status: JobStatus::Cancelled,
                fee_applied: true,
                fee: 2_000
            }
        );
    }

    #[tokio::test(start_paused = true)]
    async fn mark_arrived_reply() {
        let engine = engine_with(&["w1"]);
        let worker = engine.connect(Actor::Worker("w1".into()));
        let job_id = confirmed(&engine).await;

        let reply = send(&worker, json!({"action": "mark-arrived", "jobId": job_id})).await;

        assert_eq!(reply["reply"], "arrival");
        assert_eq!(reply["arrivalStatus"], "arrived");
    }

    #[tokio::test(start_paused = true)]
    async fn sessions_receive_their_events() {
        let engine = engine_with(&["w1"]);
        let mut worker = engine.connect(Actor::Worker("w1".into()));
        let job_id = post(&engine).await;

        let event = worker.next_event().await.unwrap();

        assert_eq!(event.name(), "ping");
        assert_eq!(event.job_id(), job_id);
    }

    #[tokio::test(start_paused = true)]
    async fn open_jobs_are_visible_only_to_pinged_workers() {
        let engine = engine_with(&["w1"]);
        let pinged = engine.connect(Actor::Worker("w1".into()));
        let stranger = engine.connect(Actor::Worker("w9".into()));
        let job_id = post(&engine).await;
        until_pinged(&engine, job_id, "w1").await;

        let seen = pinged.handle(Action::Status { job_id }).await;
        let hidden = stranger.handle(Action::Status { job_id }).await;

        assert_matches!(seen, Reply::Job { job } if job.status == JobStatus::Dispatching);
        assert_matches!(hidden, Reply::Error { code, .. } if code == "forbidden");
    }

    #[tokio::test(start_paused = true)]
    async fn status_is_private_once_assigned() {
        let engine = engine_with(&["w1", "w2"]);
        let outsider = engine.connect(Actor::Worker("w2".into()));
        let job_id = confirmed(&engine).await;

        let reply = outsider.handle(Action::Status { job_id }).await;

        assert_matches!(reply, Reply::Error { code, .. } if code == "forbidden");
    }
}
