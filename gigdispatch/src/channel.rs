//! Per user publish/subscribe channels carrying dispatch engine output.
//!
//! Delivery is best effort and at most once per subscription. Nothing in the engine depends on an
//! event arriving; clients can always fall back to polling the job status.
use std::{
    fmt::Display,
    pin::Pin,
    sync::{Arc, RwLock},
};

use async_stream::stream;
use futures::Stream;
use fxhash::FxHashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::job::{Actor, EmployerId, JobId, JobView, WorkerId};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ChannelId {
    Employer(EmployerId),
    Worker(WorkerId),
    /// Every event concerning a single job, regardless of recipient.
    Job(JobId),
}

impl From<&Actor> for ChannelId {
    fn from(value: &Actor) -> Self {
        match value {
            Actor::Employer(id) => ChannelId::Employer(id.clone()),
            Actor::Worker(id) => ChannelId::Worker(id.clone()),
        }
    }
}

impl Display for ChannelId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChannelId::Employer(id) => write!(f, "employer:{id}"),
            ChannelId::Worker(id) => write!(f, "worker:{id}"),
            ChannelId::Job(id) => write!(f, "job:{}", u64::from(*id)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    Employer,
    Timeout,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event")]
pub enum Event {
    #[serde(rename = "ping", rename_all = "camelCase")]
    Ping {
        job_id: JobId,
        title: String,
        distance_km: f64,
        pay: u64,
        duration_hours: f64,
        wave: u32,
    },
    /// Sent to the other pinged workers once someone locks the job.
    #[serde(rename = "job:taken", rename_all = "camelCase")]
    Taken { job_id: JobId },
    #[serde(rename = "job:locked")]
    Locked { job: JobView },
    #[serde(rename = "job:confirmed", alias = "instant-job-confirmed")]
    Confirmed { job: JobView },
    #[serde(rename = "job:rejected", rename_all = "camelCase")]
    Rejected {
        job: JobView,
        worker_id: WorkerId,
        reason: RejectReason,
    },
    #[serde(rename = "arrival-updated")]
    ArrivalUpdated { job: JobView },
    #[serde(rename = "arrival-confirmed")]
    ArrivalConfirmed { job: JobView },
    #[serde(rename = "job:in_progress")]
    InProgress { job: JobView },
    #[serde(rename = "job:completion-requested")]
    CompletionRequested { job: JobView },
    #[serde(rename = "job:completed")]
    Completed { job: JobView },
    #[serde(rename = "job:cancelled")]
    Cancelled { job: JobView },
    #[serde(rename = "job:failed")]
    Failed { job: JobView },
    #[serde(rename = "job:expired")]
    Expired { job: JobView },
}

impl Event {
    pub fn job_id(&self) -> JobId {
        match self {
            Event::Ping { job_id, .. } | Event::Taken { job_id } => *job_id,
            Event::Locked { job }
            | Event::Confirmed { job }
            | Event::Rejected { job, .. }
            | Event::ArrivalUpdated { job }
            | Event::ArrivalConfirmed { job }
            | Event::InProgress { job }
            | Event::CompletionRequested { job }
            | Event::Completed { job }
            | Event::Cancelled { job }
            | Event::Failed { job }
            | Event::Expired { job } => job.job_id,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Event::Ping { .. } => "ping",
            Event::Taken { .. } => "job:taken",
            Event::Locked { .. } => "job:locked",
            Event::Confirmed { .. } => "job:confirmed",
            Event::Rejected { .. } => "job:rejected",
            Event::ArrivalUpdated { .. } => "arrival-updated",
            Event::ArrivalConfirmed { .. } => "arrival-confirmed",
            Event::InProgress { .. } => "job:in_progress",
            Event::CompletionRequested { .. } => "job:completion-requested",
            Event::Completed { .. } => "job:completed",
            Event::Cancelled { .. } => "job:cancelled",
            Event::Failed { .. } => "job:failed",
            Event::Expired { .. } => "job:expired",
        }
    }
}

type Subscriber = mpsc::UnboundedSender<Event>;

/// Fan-out of events to live subscriptions, keyed by channel.
///
/// Cloning the hub is cheap and every clone shares the same subscriptions. Each engine owns its
/// hub; there is no process wide instance.
#[derive(Clone, Default)]
pub struct EventHub {
    subscribers: Arc<RwLock<FxHashMap<ChannelId, Vec<Subscriber>>>>,
}

impl EventHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn subscribe(&self, channel: ChannelId) -> Subscription {
        let (sender, receiver) = mpsc::unbounded_channel();
        match self.subscribers.write() {
            Ok(mut subscribers) => subscribers.entry(channel.clone()).or_default().push(sender),
            Err(err) => tracing::error!(%channel, ?err, "Failed to subscribe to {channel}"),
        }
        Subscription { channel, receiver }
    }

    /// Deliver `event` to every live subscription of `channel`, returning how many received it.
    ///
    /// Closed subscriptions are dropped along the way.
    pub fn publish(&self, channel: &ChannelId, event: &Event) -> usize {
        let mut subscribers = match self.subscribers.write() {
            Ok(subscribers) => subscribers,
            Err(err) => {
                tracing::error!(%channel, ?err, "Failed to publish {} to {channel}", event.name());
                return 0;
            }
        };
        let Some(senders) = subscribers.get_mut(channel) else {
            return 0;
        };
        senders.retain(|sender| sender.send(event.clone()).is_ok());
        let delivered = senders.len();
        if senders.is_empty() {
            subscribers.remove(channel);
        }
        tracing::trace!(%channel, delivered, "Published {} to {channel}", event.name());
        delivered
    }

    /// Publish `event` to each of `channels` and to the job's own channel.
    pub(crate) fn broadcast<'a>(
        &self,
        channels: impl IntoIterator<Item = &'a ChannelId>,
        event: Event,
    ) {
        channels.into_iter().for_each(|channel| {
            self.publish(channel, &event);
        });
        self.publish(&ChannelId::Job(event.job_id()), &event);
    }
}

/// A single live subscription to a channel.
pub struct Subscription {
    channel: ChannelId,
    receiver: mpsc::UnboundedReceiver<Event>,
}

impl Subscription {
    pub fn channel(&self) -> &ChannelId {
        &self.channel
    }

    pub async fn recv(&mut self) -> Option<Event> {
        self.receiver.recv().await
    }

    /// Take an already delivered event without waiting.
    pub fn try_recv(&mut self) -> Option<Event> {
        self.receiver.try_recv().ok()
    }

    pub fn into_stream(mut self) -> Pin<Box<dyn Stream<Item = Event> + Send>> {
        Box::pin(stream! {
            while let Some(event) = self.receiver.recv().await {
                yield event;
            }
        })
    }
}
