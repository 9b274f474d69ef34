//! Shared setup for PostgreSQL integration tests.
//!
//! Tests run only when `DATABASE_URL` points at a disposable database; they
//! print a notice and return early otherwise.

use docflow_core::{Batch, Fingerprint, Job, JobSpec};
use docflow_db::Database;
use uuid::Uuid;

/// Connect and migrate, or `None` when no database is configured.
pub async fn test_db(test_name: &str) -> Option<Database> {
    let _ = dotenvy::dotenv();
    let Ok(url) = std::env::var("DATABASE_URL") else {
        println!("Skipping {test_name} - set DATABASE_URL to run PostgreSQL tests");
        return None;
    };
    let db = Database::connect(&url)
        .await
        .expect("Failed to connect to test database");
    db.migrate().await.expect("Failed to run migrations");
    Some(db)
}

/// A batch of pending jobs with unique fingerprints.
pub fn pending_batch(n: usize) -> (Batch, Vec<Job>) {
    let batch_id = docflow_core::new_v7();
    let jobs: Vec<Job> = (0..n)
        .map(|i| {
            Job::new(
                batch_id,
                JobSpec::file(format!("/data/doc-{i}.txt")),
                unique_fingerprint(),
            )
        })
        .collect();
    let batch = Batch::new(batch_id, Some("pg-test".into()), &jobs);
    (batch, jobs)
}

pub fn unique_fingerprint() -> Fingerprint {
    Fingerprint::strong(docflow_core::fingerprint_bytes(
        Uuid::new_v4().as_bytes(),
    ))
}
