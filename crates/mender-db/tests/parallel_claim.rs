//! Concurrency test for atomic job claiming.
//!
//! The claim is a single conditional UPDATE on the writer connection, so
//! even with many concurrent callers each queued job must be handed out
//! exactly once.

use mender_core::issue::{IssueUpsert, Source};
use mender_db::Store;
use std::collections::HashSet;
use std::sync::Arc;

#[test]
fn concurrent_claims_no_double_dispatch() {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(Store::open(&dir.path().join("parallel.db")).unwrap());

    for i in 0..10 {
        let mut upsert = IssueUpsert::new("myproject", Source::Github, &i.to_string());
        upsert.title = format!("issue {i}");
        let issue_id = store.upsert_issue(&upsert).unwrap();
        store.create_job(&issue_id, "myproject", 3).unwrap();
    }

    let mut handles = Vec::new();
    for _ in 0..10 {
        let store = Arc::clone(&store);
        handles.push(std::thread::spawn(move || {
            let mut claimed = Vec::new();
            loop {
                match store.claim_job() {
                    Ok(Some(id)) => claimed.push(id),
                    Ok(None) => break,
                    Err(_) => {
                        // The writer serializes under a busy timeout; retry.
                        std::thread::sleep(std::time::Duration::from_millis(1));
                    }
                }
            }
            claimed
        }));
    }

    let mut all_claimed: Vec<String> = Vec::new();
    for handle in handles {
        all_claimed.extend(handle.join().unwrap());
    }

    let unique: HashSet<&String> = all_claimed.iter().collect();
    assert_eq!(
        unique.len(),
        all_claimed.len(),
        "duplicate claims detected: {all_claimed:?}"
    );
    assert_eq!(unique.len(), 10, "not all jobs were claimed");
}
