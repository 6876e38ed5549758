#![allow(missing_docs)]

mod common;

use common::{nested_mapping, truncated_mapping, write_fixture, PickleBuilder};
use pickler::{PickleInspector, Protocol, ScanStatus, StructureHint};

const VOCABULARY: [&str; 3] = ["dict", "list", "tuple"];

fn labels(outcome: &pickler::ScanOutcome) -> Vec<&'static str> {
    outcome
        .report
        .structure_hints
        .iter()
        .map(|h| h.label())
        .collect()
}

#[test]
fn nested_mapping_reports_dict_and_list() -> pickler::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = write_fixture(dir.path(), "scenario_a.pkl", &nested_mapping())?;

    let outcome = PickleInspector::safe_view(&path)?;
    assert_eq!(outcome.status, ScanStatus::Complete);
    assert_eq!(outcome.report.file_name, "scenario_a.pkl");
    assert_eq!(outcome.report.protocol, Protocol::Known(2));
    assert_eq!(labels(&outcome), vec!["dict", "list"]);
    Ok(())
}

#[test]
fn truncated_stream_yields_partial_report() -> pickler::Result<()> {
    let dir = tempfile::tempdir()?;
    let bytes = truncated_mapping();
    let path = write_fixture(dir.path(), "scenario_d.pkl", &bytes)?;

    let outcome = PickleInspector::safe_view(&path)?;
    match &outcome.status {
        ScanStatus::Stopped { position, .. } => assert!(*position < bytes.len()),
        ScanStatus::Complete => panic!("a truncated stream cannot complete"),
    }
    assert_eq!(outcome.report.size_bytes, bytes.len() as u64);
    assert!(outcome.report.structure_hints.contains(&StructureHint::Dict));
    Ok(())
}

#[test]
fn scanning_is_idempotent() -> pickler::Result<()> {
    let dir = tempfile::tempdir()?;
    let path = write_fixture(dir.path(), "twice.pkl", &truncated_mapping())?;

    let first = PickleInspector::safe_view(&path)?;
    let second = PickleInspector::safe_view(&path)?;
    assert_eq!(first, second);
    Ok(())
}

#[test]
fn hints_are_sorted_and_drawn_from_the_closed_vocabulary() {
    let streams = [
        nested_mapping(),
        truncated_mapping(),
        PickleBuilder::new()
            .empty_tuple()
            .empty_list()
            .empty_dict()
            .tuple2()
            .tuple2()
            .stop(),
        PickleBuilder::unversioned().none().stop(),
        b"not a pickle at all".to_vec(),
        Vec::new(),
    ];
    for bytes in &streams {
        let outcome = pickler::scan_hints("any.pkl", bytes);
        let found = labels(&outcome);
        assert!(found.iter().all(|l| VOCABULARY.contains(l)), "{found:?}");
        let mut sorted = found.clone();
        sorted.sort_unstable();
        assert_eq!(found, sorted);
    }
}

#[test]
fn repeated_evidence_does_not_duplicate_hints() {
    let outcome = pickler::scan_hints("lists.pkl", &common::int_list(50));
    assert_eq!(labels(&outcome), vec!["list"]);
}

#[test]
fn unversioned_stream_reports_unknown_protocol() {
    let bytes = PickleBuilder::unversioned().empty_list().stop();
    let outcome = pickler::scan_hints("p1.pkl", &bytes);
    assert_eq!(outcome.report.protocol, Protocol::Unknown);
    assert_eq!(outcome.report.note, pickler::constants::SAFE_MODE_NOTE);
}

#[test]
fn missing_file_is_an_io_error() {
    let err = PickleInspector::safe_view("/nonexistent/dir/file.pkl").unwrap_err();
    assert!(matches!(err, pickler::InspectError::Io(_)));
}
