use std::fs;

use grader::reporter::spool::Spool;
use grader_core::judge::{result::JobReport, Job};
use pretty_assertions::assert_eq;
use serde_json::json;

fn report(job_id: &str, explanation: &str) -> JobReport {
    let job: Job = serde_json::from_value(json!({"id": job_id, "language": "c"})).unwrap();
    JobReport::rejected(&job, explanation)
}

#[test]
fn test_store_replaces_record_of_same_job() {
    let dir = tempfile::tempdir().unwrap();
    let spool = Spool::open(dir.path().join("spool")).unwrap();
    assert_eq!(spool.depth(), 0);

    spool.store(&report("1", "first"), 1).unwrap();
    spool.store(&report("2", "other"), 1).unwrap();
    spool.store(&report("1", "second"), 2).unwrap();
    assert_eq!(spool.depth(), 2);

    let records = spool.load_all().unwrap();
    assert_eq!(records.len(), 2);
    let first = records.iter().find(|r| r.job_id == "1").unwrap();
    assert_eq!(first.attempts, 2);
    assert_eq!(first.report, report("1", "second"));
}

#[test]
fn test_records_load_oldest_first() {
    let dir = tempfile::tempdir().unwrap();
    let spool = Spool::open(dir.path().to_path_buf()).unwrap();
    spool.store(&report("b", "x"), 1).unwrap();
    std::thread::sleep(std::time::Duration::from_millis(5));
    spool.store(&report("a", "x"), 1).unwrap();

    let ids: Vec<String> = spool
        .load_all()
        .unwrap()
        .into_iter()
        .map(|r| r.job_id)
        .collect();
    assert_eq!(ids, vec!["b".to_string(), "a".to_string()]);
}

#[test]
fn test_remove_and_unreadable_records() {
    let dir = tempfile::tempdir().unwrap();
    let spool = Spool::open(dir.path().to_path_buf()).unwrap();
    spool.store(&report("../../etc/passwd", "x"), 1).unwrap();
    fs::write(dir.path().join("garbage.json"), "{not json").unwrap();
    fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

    // Ids never leave the spool directory.
    assert!(dir.path().join("Li4vLi4vZXRjL3Bhc3N3ZA.json").is_file());

    let records = spool.load_all().unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].job_id, "../../etc/passwd");

    spool.remove("../../etc/passwd").unwrap();
    spool.remove("never-stored").unwrap();
    assert_eq!(spool.depth(), 1);
    assert!(spool.load_all().unwrap().is_empty());
}

#[test]
fn test_similar_ids_keep_separate_records() {
    let dir = tempfile::tempdir().unwrap();
    let spool = Spool::open(dir.path().to_path_buf()).unwrap();
    for id in ["a/b", "a_b", "a b", "A/B"] {
        spool.store(&report(id, id), 1).unwrap();
    }
    assert_eq!(spool.depth(), 4);

    let mut ids: Vec<String> = spool
        .load_all()
        .unwrap()
        .into_iter()
        .map(|r| {
            assert_eq!(r.report, report(&r.job_id, &r.job_id));
            r.job_id
        })
        .collect();
    ids.sort();
    assert_eq!(ids, vec!["A/B", "a b", "a/b", "a_b"]);

    spool.remove("a_b").unwrap();
    assert_eq!(spool.depth(), 3);
}
