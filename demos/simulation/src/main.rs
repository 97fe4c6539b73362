use std::time::Duration;

use futures::StreamExt;
use gigdispatch::prelude::*;
use serde_json::json;

#[tokio::main]
pub async fn main() {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .init();

    let directory = InMemoryDirectory::new();
    directory
        .upsert_employer(
            "cafe",
            ContactCard {
                name: "Corner Cafe".to_owned(),
                phone: "020 7946 0000".to_owned(),
            },
        )
        .unwrap();
    for (id, name, latitude) in [("ana", "Ana", 51.5080), ("ben", "Ben", 51.5120)] {
        directory
            .upsert_worker(
                WorkerProfile::new(id, name, Location::new(latitude, -0.1278, ""))
                    .with_phone("07700 900000")
                    .with_skills(vec!["barista"]),
            )
            .unwrap();
    }

    let engine = DispatchEngine::new(
        InMemoryJobStore::new(),
        InMemoryLockStore::new(),
        directory.clone(),
    )
    .with_contacts(directory)
    .with_policy(DispatchPolicy::new().with_wave_window(Duration::from_secs(5)));

    let employer = engine.connect(Actor::Employer("cafe".into()));
    let mut ana = engine.connect(Actor::Worker("ana".into()));
    let ben = engine.connect(Actor::Worker("ben".into()));
    tokio::spawn(ben.into_events().for_each(|event| async move {
        println!("ben <- {}", serde_json::to_string(&event).unwrap());
    }));

    let spec = JobBuilder::new("Morning barista shift")
        .at(Location::new(51.5074, -0.1278, "1 Trafalgar Square"))
        .paying(9_600)
        .for_hours(4.0)
        .add_skill("barista")
        .build();
    let posted = employer
        .handle_message(&json!({"action": "post", "job": spec}).to_string())
        .await;
    println!("cafe -> post: {posted}");
    let posted: serde_json::Value = serde_json::from_str(&posted).unwrap();
    let job_id: JobId = serde_json::from_value(posted["job"]["jobId"].clone()).unwrap();

    let ping = ana.next_event().await.unwrap();
    println!("ana <- {}", serde_json::to_string(&ping).unwrap());

    for (session, message) in [
        (&ana, json!({"action": "accept", "jobId": job_id})),
        (&employer, json!({"action": "confirm", "jobId": job_id, "decision": "confirm"})),
        (&ana, json!({"action": "contact", "jobId": job_id})),
        (&ana, json!({"action": "mark-arrived", "jobId": job_id})),
        (&employer, json!({"action": "mark-arrived", "jobId": job_id})),
        (&ana, json!({"action": "request-completion", "jobId": job_id})),
        (&employer, json!({"action": "approve-completion", "jobId": job_id})),
    ] {
        let reply = session.handle_message(&message.to_string()).await;
        println!("{} -> {}: {reply}", session.actor(), message["action"]);
    }

    tokio::time::sleep(Duration::from_millis(100)).await;
    engine.graceful_shutdown().await.unwrap();
}
