mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use anyhow::Result;
use common::{abc, object, perturb_one_pixel, Fixture};
use fingermatch::response::{self, MatchRequest, RecordAvailability};
use fingermatch::storage::{MemoryStore, Record, RecordStore, StoreError};
use fingermatch::{MatchError, RecordStatus};
use serde_json::json;

struct Counting {
    inner: MemoryStore,
    calls: AtomicUsize,
}

impl RecordStore for Counting {
    fn find(&self, identity_id: &str) -> Result<Option<Record>, StoreError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.inner.find(identity_id)
    }
}

fn counting() -> Arc<Counting> {
    let mut inner = MemoryStore::new();
    inner.insert("B", object(json!({"PatientID": "B", "Name": "Bea"})));
    Arc::new(Counting {
        inner,
        calls: AtomicUsize::new(0),
    })
}

fn patients() -> Vec<(&'static str, serde_json::Value)> {
    vec![
        ("A", json!({"_id": "64a1", "PatientID": "A", "Name": "Ada"})),
        ("B", json!({"_id": "64b2", "PatientID": "B", "Name": "Bea", "Age": 41})),
        ("C", json!({"_id": "64c3", "PatientID": "C", "Name": "Cy"})),
    ]
}

#[test]
fn enrolled_scan_matches_itself() -> Result<()> {
    common::init_logger();
    let prints = abc();
    let fx = Fixture::build(&prints, &patients())?;
    let matcher = fx.matcher()?;

    // A fresh copy of the enrolled scan, not the enrolled file itself.
    let probe = fx.write("probe.png", &prints[1].1)?;
    let result = matcher.match_path(&probe)?;

    assert!(result.confirmed);
    assert_eq!(result.similarity, 1.0);
    assert_eq!(result.identity_id(), Some("B"));
    let record = result.record().expect("record for B");
    assert_eq!(record["Name"], "Bea");
    assert_eq!(record["Age"], 41);
    assert!(!record.contains_key("_id"));
    Ok(())
}

#[test]
fn every_enrolled_scan_is_its_own_best_match() -> Result<()> {
    let fx = Fixture::build(&abc(), &patients())?;
    let matcher = fx.matcher()?;
    for (scan, id) in fx.scans.iter().zip(["A", "B", "C"]) {
        let result = matcher.match_path(scan)?;
        assert_eq!(result.identity_id(), Some(id));
        assert_eq!(result.similarity, 1.0);
    }
    Ok(())
}

#[test]
fn one_pixel_change_is_not_confirmed() -> Result<()> {
    let prints = abc();
    let fx = Fixture::build(&prints, &[])?;
    let store = counting();
    let matcher = fx.matcher_with_store(store.clone())?;

    let probe = fx.write("probe.png", &perturb_one_pixel(&prints[1].1))?;
    let result = matcher.match_path(&probe)?;

    assert!(result.similarity < 1.0, "similarity {}", result.similarity);
    assert!(!result.confirmed);
    assert!(result.candidate_id.is_some());
    assert_eq!(result.identity_id(), None);
    assert_eq!(result.record, RecordStatus::NotRequested);
    assert_eq!(store.calls.load(Ordering::SeqCst), 0);
    Ok(())
}

#[test]
fn missing_input_fails_before_search() -> Result<()> {
    let fx = Fixture::build(&abc(), &[])?;
    let store = counting();
    let matcher = fx.matcher_with_store(store.clone())?;

    let err = matcher.match_path(&fx.path("nope.png")).unwrap_err();
    assert!(matches!(err, MatchError::InputNotFound));
    assert!(err.is_input_error());
    assert_eq!(store.calls.load(Ordering::SeqCst), 0);

    let res = response::handle(
        &matcher,
        MatchRequest {
            image_path: fx.path("nope.png"),
            requester_tag: Some("doc-1".into()),
        },
    );
    assert!(!res.success);
    assert_eq!(res.message, "File not found");
    assert_eq!(res.status, 400);
    assert!(res.data.is_none());
    Ok(())
}

#[test]
fn unreadable_input_is_reported() -> Result<()> {
    let fx = Fixture::build(&abc(), &[])?;
    let matcher = fx.matcher()?;
    let probe = fx.path("probe.png");
    std::fs::write(&probe, b"this is not a png")?;

    let err = matcher.match_path(&probe).unwrap_err();
    assert!(matches!(err, MatchError::InputUnreadable(_)));
    assert!(!err.to_string().contains("probe.png"));

    let res = response::handle(
        &matcher,
        MatchRequest {
            image_path: probe,
            requester_tag: None,
        },
    );
    assert_eq!((res.message.as_str(), res.status), ("Unreadable image", 400));
    Ok(())
}

#[test]
fn three_identity_scenario() -> Result<()> {
    let prints = abc();
    let fx = Fixture::build(&prints, &patients())?;
    let matcher = fx.matcher()?;

    let exact = fx.write("exact.png", &prints[1].1)?;
    let res = response::handle(
        &matcher,
        MatchRequest {
            image_path: exact,
            requester_tag: Some("doc-7".into()),
        },
    );
    assert_eq!(
        serde_json::to_value(&res)?,
        json!({
            "success": true,
            "message": "Match found",
            "data": {
                "requesterTag": "doc-7",
                "identityId": "B",
                "similarity": 1.0,
                "recordStatus": "found",
                "details": {"PatientID": "B", "Name": "Bea", "Age": 41}
            }
        })
    );

    let noisy = fx.write("noisy.png", &perturb_one_pixel(&prints[1].1))?;
    let res = response::handle(
        &matcher,
        MatchRequest {
            image_path: noisy,
            requester_tag: Some("doc-7".into()),
        },
    );
    assert_eq!(
        serde_json::to_value(&res)?,
        json!({"success": false, "message": "No match found"})
    );
    Ok(())
}

#[test]
fn confirmed_without_record_is_no_match() -> Result<()> {
    let prints = abc();
    let fx = Fixture::build(&prints, &[("A", json!({"PatientID": "A"}))])?;
    let matcher = fx.matcher()?;

    let result = matcher.match_path(&fx.scans[2])?;
    assert!(result.confirmed);
    assert_eq!(result.record, RecordStatus::Missing);

    let res = response::MatchResponse::from_outcome(Ok(result), None);
    assert!(!res.success);
    assert_eq!(res.message, "No match found");
    Ok(())
}

#[test]
fn store_outage_degrades_the_response() -> Result<()> {
    let mut fx = Fixture::build(&abc(), &patients())?;
    fx.config.store.dir = fx.path("no-such-records");
    let matcher = fx.matcher()?;

    let result = matcher.match_path(&fx.scans[0])?;
    assert!(result.confirmed);
    assert!(matches!(result.record, RecordStatus::Unavailable(_)));

    let res = response::MatchResponse::from_outcome(Ok(result), None);
    assert!(res.success);
    assert_eq!(res.message, "Match found; record details unavailable");
    let data = res.data.expect("payload");
    assert_eq!(data.identity_id, "A");
    assert_eq!(data.record_status, RecordAvailability::Unavailable);
    assert!(data.details.is_none());
    Ok(())
}

#[test]
fn duplicate_enrollment_resolves_to_first_position() -> Result<()> {
    let prints = abc();
    let dup = vec![
        ("C", prints[2].1.clone()),
        ("B-first", prints[1].1.clone()),
        ("B-second", prints[1].1.clone()),
    ];
    let fx = Fixture::build(&dup, &[])?;
    let matcher = fx.matcher()?;

    for scan in &fx.scans[1..] {
        let result = matcher.match_path(scan)?;
        assert_eq!(result.identity_id(), Some("B-first"));
    }
    Ok(())
}

#[test]
fn top_k_larger_than_gallery() -> Result<()> {
    let mut fx = Fixture::build(&abc(), &patients())?;
    fx.config.search.top_k = 50;
    let matcher = fx.matcher()?;

    let probe = matcher.extractor().extract_path(&fx.scans[0])?;
    assert_eq!(matcher.index().top_k(probe.as_slice(), 50).len(), 3);
    assert_eq!(matcher.match_path(&fx.scans[0])?.identity_id(), Some("A"));
    Ok(())
}

#[test]
fn repeated_requests_agree() -> Result<()> {
    let prints = abc();
    let fx = Fixture::build(&prints, &patients())?;
    let matcher = fx.matcher()?;
    let noisy = fx.write("noisy.png", &perturb_one_pixel(&prints[0].1))?;

    for probe in [&fx.scans[1], &noisy] {
        let first = matcher.match_path(probe)?;
        for _ in 0..3 {
            assert_eq!(matcher.match_path(probe)?, first);
        }
    }
    Ok(())
}

#[test]
fn concurrent_requests_share_one_matcher() -> Result<()> {
    let fx = Fixture::build(&abc(), &patients())?;
    let matcher = fx.matcher()?;

    let expected = fx
        .scans
        .iter()
        .map(|p| matcher.match_path(p))
        .collect::<Result<Vec<_>, _>>()?;

    std::thread::scope(|s| {
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let matcher = &matcher;
                let scan = &fx.scans[i % fx.scans.len()];
                s.spawn(move || (i, matcher.match_path(scan)))
            })
            .collect();
        for h in handles {
            let (i, result) = h.join().expect("worker panicked");
            assert_eq!(result.unwrap(), expected[i % expected.len()]);
        }
    });
    Ok(())
}
