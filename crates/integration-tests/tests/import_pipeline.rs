//! End-to-end import: job submission through orchestrator and processing workers
//! to rows in SQLite and error files in the object store.

mod common;

use bulkimport_core::domain::{decode, ImportJobStatus, ManifestEntry, ProcessingInput, TaskStatus};
use bulkimport_core::port::TaskManager;
use common::{patient_file, Harness};

#[tokio::test]
async fn test_two_files_with_one_malformed_record() {
    let h = Harness::new(10).await;
    let first = h.put_source("a.ndjson", &patient_file(100, &[50])).await;
    let second = h.put_source("b.ndjson", &patient_file(50, &[])).await;

    let job_id = h
        .submit(
            "job-1",
            vec![
                ManifestEntry::new("Patient", &first),
                ManifestEntry::new("Patient", &second),
            ],
        )
        .await;
    let workers = h.spawn_workers(1, 2);
    let job = h.wait_terminal(&h.job_task(&job_id).await.task_id).await;
    workers.stop().await;

    assert_eq!(job.status, TaskStatus::Succeeded);
    let response = h.jobs.get_status(&job_id).await.unwrap();
    let result = response.result.unwrap();
    assert_eq!(result.status, ImportJobStatus::Succeeded);

    let counts: Vec<(String, u64)> = result
        .output
        .iter()
        .map(|o| (o.input_url.clone(), o.count))
        .collect();
    assert_eq!(counts, vec![(first.clone(), 99), (second.clone(), 50)]);
    assert!(result.failed_tasks.is_empty());

    assert_eq!(result.error.len(), 1);
    let error = &result.error[0];
    assert_eq!(error.input_url, first);
    assert_eq!(error.count, 1);

    let errors = h.read_object(error.url.as_deref().unwrap()).await;
    let lines: Vec<serde_json::Value> = errors
        .lines()
        .map(|l| serde_json::from_str(l).unwrap())
        .collect();
    assert_eq!(lines.len(), 1);
    assert_eq!(lines[0]["index"], 50);

    assert_eq!(h.count("SELECT COUNT(*) FROM resource").await, 149);
    assert_eq!(
        h.count("SELECT COUNT(*) FROM resource WHERE resource_id = 'p50'").await,
        1,
        "p50 from the second file only"
    );
}

#[tokio::test]
async fn test_concurrent_jobs_get_disjoint_surrogate_ranges() {
    let h = Harness::new(7).await;
    let mut manifests = Vec::new();
    for job in 0..3 {
        let mut manifest = Vec::new();
        for file in 0..2 {
            let uri = h
                .put_source(&format!("{}-{}.ndjson", job, file), &patient_file(20 + file * 5, &[]))
                .await;
            manifest.push(ManifestEntry::new("Patient", uri));
        }
        manifests.push(manifest);
    }

    let workers = h.spawn_workers(3, 4);
    let submitted = futures::future::join_all(
        manifests
            .into_iter()
            .enumerate()
            .map(|(i, manifest)| {
                let h = &h;
                async move { h.submit(&format!("job-{}", i), manifest).await }
            }),
    )
    .await;
    for job_id in &submitted {
        let task_id = h.job_task(job_id).await.task_id;
        assert_eq!(h.wait_terminal(&task_id).await.status, TaskStatus::Succeeded);
    }
    workers.stop().await;

    let mut ranges = Vec::new();
    for job_id in &submitted {
        for index in 0..2 {
            let child = h
                .task_manager
                .find_by_idempotency_key(&format!("{}:{}", job_id, index))
                .await
                .unwrap()
                .unwrap();
            let input: ProcessingInput = decode(&child.input_data).unwrap();
            ranges.push((input.begin_sequence_id, input.end_sequence_id));
        }
    }
    ranges.sort();
    for pair in ranges.windows(2) {
        assert!(pair[0].1 <= pair[1].0, "overlapping ranges {:?}", pair);
    }

    // Every surrogate id lies in the range of the child that loaded it
    assert_eq!(h.count("SELECT COUNT(*) FROM resource").await, 3 * (20 + 25));
    let outside = h
        .count(&format!(
            "SELECT COUNT(*) FROM resource WHERE surrogate_id < {} OR surrogate_id >= {}",
            ranges[0].0,
            ranges[ranges.len() - 1].1
        ))
        .await;
    assert_eq!(outside, 0);
}

#[tokio::test]
async fn test_resubmitting_a_job_id_imports_once() {
    let h = Harness::new(10).await;
    let uri = h.put_source("a.ndjson", &patient_file(30, &[])).await;
    let manifest = vec![ManifestEntry::new("Patient", &uri)];

    let first = h.submit("job-dup", manifest.clone()).await;
    let second = h.submit("job-dup", manifest).await;
    assert_eq!(first, second);

    let workers = h.spawn_workers(1, 1);
    h.wait_terminal(&h.job_task(&first).await.task_id).await;
    workers.stop().await;

    // The resubmission after completion is still the same job
    assert_eq!(h.submit("job-dup", vec![ManifestEntry::new("Patient", &uri)]).await, first);
    assert_eq!(h.count("SELECT COUNT(*) FROM resource").await, 30);
    assert_eq!(
        h.count("SELECT COUNT(*) FROM task_info WHERE parent_task_id IS NOT NULL").await,
        1
    );
}

#[tokio::test]
async fn test_missing_source_is_reported_as_failed_task() {
    let h = Harness::new(10).await;
    let present = h.put_source("a.ndjson", &patient_file(5, &[])).await;
    let missing = "memory:///source/missing.ndjson".to_string();

    let job_id = h
        .submit(
            "job-missing",
            vec![
                ManifestEntry::new("Patient", &present),
                ManifestEntry::new("Patient", &missing),
            ],
        )
        .await;
    let workers = h.spawn_workers(1, 2);
    h.wait_terminal(&h.job_task(&job_id).await.task_id).await;
    workers.stop().await;

    let result = h.jobs.get_status(&job_id).await.unwrap().result.unwrap();
    assert_eq!(result.status, ImportJobStatus::Succeeded);
    assert_eq!(result.total_succeeded(), 5);
    assert_eq!(result.failed_tasks.len(), 1);
    assert_eq!(result.failed_tasks[0].input_url, missing);
    assert_eq!(h.count("SELECT COUNT(*) FROM resource").await, 5);
}
