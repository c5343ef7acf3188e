mod common;

use common::{registry, CollectingSink, DenyUserGate};
use serde_json::json;
use std::sync::Arc;
use weft_core::db::open_db_in_memory;
use weft_core::repo::changeset_repo::ChangesetRepo;
use weft_core::service::graph_service::GraphService;
use weft_core::{
    AllowAllGate, Changeset, ChangesetEngine, ChangesetState, NoopSink, OpOutcome,
    OperationTarget, PatchOp, UpdateError, UpdateOperation,
};

fn service(conn: &rusqlite::Connection) -> GraphService<'_> {
    GraphService::new(
        conn,
        registry(),
        Arc::new(AllowAllGate),
        Arc::new(NoopSink),
    )
}

fn engine(conn: &rusqlite::Connection) -> ChangesetEngine<'_> {
    ChangesetEngine::new(
        conn,
        registry(),
        Arc::new(AllowAllGate),
        Arc::new(NoopSink),
    )
}

fn pair(href: &str, source_type: &str) -> OperationTarget {
    OperationTarget::Pair {
        resource_href: href.to_string(),
        source_type: source_type.to_string(),
    }
}

fn put(href: &str, source_type: &str, data: serde_json::Value) -> UpdateOperation {
    UpdateOperation::Put {
        target: pair(href, source_type),
        data: Some(data),
    }
}

#[test]
fn independent_source_types_merge_into_one_document() {
    // Scenario: two changesets put different source types onto the same
    // resource; both contributions survive in the regenerated document.
    let conn = open_db_in_memory().unwrap();
    let service = service(&conn);

    service
        .create_resource("alice", "snake", Some("python"))
        .unwrap();
    service
        .perform_changeset(
            "/snake/python",
            "alice",
            None,
            vec![put("/snake/python", "science", json!({"label": "Python"}))],
        )
        .unwrap();
    service
        .perform_changeset(
            "/snake/python",
            "bob",
            None,
            vec![put(
                "/snake/python",
                "mythology",
                json!({"eats": "/hero/unwary"}),
            )],
        )
        .unwrap();

    let resource = service.get_resource("/snake/python").unwrap();
    assert_eq!(resource.data["label"], json!("Python"));
    assert_eq!(resource.data["eats"], json!([{"href": "/hero/unwary"}]));
    assert_eq!(resource.version, 2);
}

#[test]
fn patch_into_filtered_territory_is_unacceptable_and_changes_nothing() {
    // Scenario: the committer's filter hides `restricted`; a patch reaching
    // into it must be rejected and the data left untouched.
    let conn = open_db_in_memory().unwrap();
    let service = service(&conn);

    service
        .create_resource("alice", "snake", Some("python"))
        .unwrap();
    service
        .perform_changeset(
            "/snake/python",
            "curator",
            None,
            vec![put(
                "/snake/python",
                "science",
                json!({"label": "Python", "restricted": {"note": "classified"}}),
            )],
        )
        .unwrap();
    let before = service.get_resource("/snake/python").unwrap();

    let err = service
        .perform_changeset(
            "/snake/python",
            "mallory",
            None,
            vec![UpdateOperation::Patch {
                target: pair("/snake/python", "science"),
                patch: vec![PatchOp::Replace {
                    path: "/restricted/note".to_string(),
                    value: json!("overwritten"),
                }],
                create_empty_if_missing: false,
            }],
        )
        .unwrap_err();

    match err {
        weft_core::ServiceError::Update(UpdateError::Multiple(errors)) => {
            assert!(matches!(
                errors.as_slice(),
                [UpdateError::PatchUnacceptable { .. }]
            ));
        }
        other => panic!("unexpected error: {other}"),
    }
    let after = service.get_resource("/snake/python").unwrap();
    assert_eq!(after.version, before.version);
    assert_eq!(after.data, before.data);
}

#[test]
fn replacing_filtered_data_wholesale_is_also_unacceptable() {
    let conn = open_db_in_memory().unwrap();
    let service = service(&conn);

    service
        .create_resource("alice", "snake", Some("python"))
        .unwrap();
    service
        .perform_changeset(
            "/snake/python",
            "curator",
            None,
            vec![put(
                "/snake/python",
                "science",
                json!({"label": "Python", "restricted": {"note": "classified"}}),
            )],
        )
        .unwrap();

    let err = service
        .perform_changeset(
            "/snake/python",
            "mallory",
            None,
            vec![UpdateOperation::Patch {
                target: pair("/snake/python", "science"),
                patch: vec![PatchOp::Add {
                    path: "/restricted".to_string(),
                    value: json!({"note": "mine now"}),
                }],
                create_empty_if_missing: false,
            }],
        )
        .unwrap_err();
    assert!(matches!(
        err,
        weft_core::ServiceError::Update(UpdateError::Multiple(_))
    ));
}

#[test]
fn put_of_null_tombstones_and_delete_is_idempotent() {
    let conn = open_db_in_memory().unwrap();
    let service = service(&conn);

    service
        .create_resource("alice", "snake", Some("python"))
        .unwrap();
    service
        .perform_changeset(
            "/snake/python",
            "alice",
            None,
            vec![put("/snake/python", "science", json!({"label": "Python"}))],
        )
        .unwrap();

    let (_, report) = service
        .perform_changeset(
            "/snake/python",
            "alice",
            None,
            vec![UpdateOperation::Put {
                target: pair("/snake/python", "science"),
                data: None,
            }],
        )
        .unwrap();
    assert_eq!(report.outcomes, vec![Some(OpOutcome::Deleted)]);

    // Deleting again is a no-op with no result.
    let (_, report) = service
        .perform_changeset(
            "/snake/python",
            "alice",
            None,
            vec![UpdateOperation::Delete {
                target: pair("/snake/python", "science"),
            }],
        )
        .unwrap();
    assert_eq!(report.outcomes, vec![None]);
}

#[test]
fn resurrecting_a_deleted_source_counts_as_creation() {
    let conn = open_db_in_memory().unwrap();
    let service = service(&conn);

    service
        .create_resource("alice", "snake", Some("python"))
        .unwrap();
    service
        .perform_changeset(
            "/snake/python",
            "alice",
            None,
            vec![put("/snake/python", "science", json!({"label": "Python"}))],
        )
        .unwrap();
    service
        .perform_changeset(
            "/snake/python",
            "alice",
            None,
            vec![UpdateOperation::Delete {
                target: pair("/snake/python", "science"),
            }],
        )
        .unwrap();

    let (_, report) = service
        .perform_changeset(
            "/snake/python",
            "alice",
            None,
            vec![put("/snake/python", "science", json!({"label": "Python II"}))],
        )
        .unwrap();
    assert_eq!(report.outcomes, vec![Some(OpOutcome::Created)]);

    let resource = service.get_resource("/snake/python").unwrap();
    assert_eq!(resource.data["label"], json!("Python II"));
    assert!(!resource.deleted);
}

#[test]
fn plain_patch_cannot_touch_a_deleted_source() {
    let conn = open_db_in_memory().unwrap();
    let service = service(&conn);

    service
        .create_resource("alice", "snake", Some("python"))
        .unwrap();
    service
        .perform_changeset(
            "/snake/python",
            "alice",
            None,
            vec![
                put("/snake/python", "science", json!({"label": "Python"})),
                UpdateOperation::Delete {
                    target: pair("/snake/python", "science"),
                },
            ],
        )
        .unwrap();

    let err = service
        .perform_changeset(
            "/snake/python",
            "alice",
            None,
            vec![UpdateOperation::Patch {
                target: pair("/snake/python", "science"),
                patch: vec![PatchOp::Add {
                    path: "/label".to_string(),
                    value: json!("Zombie"),
                }],
                create_empty_if_missing: false,
            }],
        )
        .unwrap_err();
    match err {
        weft_core::ServiceError::Update(UpdateError::Multiple(errors)) => {
            assert!(matches!(
                errors.as_slice(),
                [UpdateError::CantPatchDeletedSource { .. }]
            ));
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn batch_errors_aggregate_and_roll_back_everything() {
    let conn = open_db_in_memory().unwrap();
    let service = service(&conn);

    service
        .create_resource("alice", "snake", Some("python"))
        .unwrap();
    let before = service.get_resource("/snake/python").unwrap();

    let err = service
        .perform_changeset(
            "/snake/python",
            "alice",
            None,
            vec![
                // Valid on its own, must still roll back.
                put("/snake/python", "mythology", json!({"label": "Serpent"})),
                // Schema violation: label must be a string.
                put("/snake/python", "science", json!({"label": 7})),
                // Unknown source type.
                put("/snake/python", "astrology", json!({})),
            ],
        )
        .unwrap_err();

    match err {
        weft_core::ServiceError::Update(UpdateError::Multiple(errors)) => {
            assert_eq!(errors.len(), 2);
            assert!(errors
                .iter()
                .any(|e| matches!(e, UpdateError::NoSuchSourceType { name } if name == "astrology")));
            assert!(errors
                .iter()
                .any(|e| matches!(e, UpdateError::SchemaValidation { .. })));
        }
        other => panic!("unexpected error: {other}"),
    }

    let after = service.get_resource("/snake/python").unwrap();
    assert_eq!(after.version, before.version);
    assert_eq!(after.data, before.data);
}

#[test]
fn operations_against_missing_resources_or_sources_are_rejected() {
    let conn = open_db_in_memory().unwrap();
    let service = service(&conn);

    let err = service
        .perform_changeset(
            "/",
            "alice",
            None,
            vec![put("/snake/ghost", "science", json!({}))],
        )
        .unwrap_err();
    match err {
        weft_core::ServiceError::Update(UpdateError::Multiple(errors)) => {
            assert!(matches!(
                errors.as_slice(),
                [UpdateError::SourceDataWithoutResource { href }] if href == "/snake/ghost"
            ));
        }
        other => panic!("unexpected error: {other}"),
    }

    service
        .create_resource("alice", "snake", Some("python"))
        .unwrap();
    let err = service
        .perform_changeset(
            "/snake/python",
            "alice",
            None,
            vec![UpdateOperation::Patch {
                target: pair("/snake/python", "science"),
                patch: vec![PatchOp::Add {
                    path: "/label".to_string(),
                    value: json!("Python"),
                }],
                create_empty_if_missing: false,
            }],
        )
        .unwrap_err();
    match err {
        weft_core::ServiceError::Update(UpdateError::Multiple(errors)) => {
            assert!(matches!(
                errors.as_slice(),
                [UpdateError::NoSuchSource { .. }]
            ));
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn incompatible_source_type_is_rejected() {
    let conn = open_db_in_memory().unwrap();
    let service = service(&conn);

    service.create_resource("alice", "rodent", None).unwrap();
    let rodent = service.lookup_scheme("rodent").unwrap();
    let href = rodent.values().next().unwrap().href.clone();

    let err = service
        .perform_changeset(
            "/",
            "alice",
            None,
            vec![put(&href, "mythology", json!({}))],
        )
        .unwrap_err();
    match err {
        weft_core::ServiceError::Update(UpdateError::Multiple(errors)) => {
            assert!(matches!(
                errors.as_slice(),
                [UpdateError::IncompatibleSourceType { resource_type, source_type }]
                    if resource_type == "rodent" && source_type == "mythology"
            ));
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn move_is_explicitly_rejected() {
    let conn = open_db_in_memory().unwrap();
    let service = service(&conn);

    service
        .create_resource("alice", "snake", Some("python"))
        .unwrap();
    service.create_resource("alice", "snake", Some("boa")).unwrap();
    let err = service
        .perform_changeset(
            "/snake/python",
            "alice",
            None,
            vec![UpdateOperation::Move {
                target: pair("/snake/python", "science"),
                to_resource_href: "/snake/boa".to_string(),
            }],
        )
        .unwrap_err();
    match err {
        weft_core::ServiceError::Update(UpdateError::Multiple(errors)) => {
            assert!(matches!(
                errors.as_slice(),
                [UpdateError::MoveNotSupported { .. }]
            ));
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn forbidden_committer_fails_the_batch() {
    let conn = open_db_in_memory().unwrap();
    let gate = Arc::new(DenyUserGate {
        denied_user: "mallory",
    });
    let service = GraphService::new(&conn, registry(), Arc::new(AllowAllGate), Arc::new(NoopSink));
    let engine = ChangesetEngine::new(&conn, registry(), gate, Arc::new(NoopSink));

    service
        .create_resource("alice", "snake", Some("python"))
        .unwrap();

    let mut changeset = Changeset::new(
        "/snake/python",
        "mallory",
        None,
        vec![put("/snake/python", "science", json!({"label": "Python"}))],
    );
    let err = engine.perform(&mut changeset).unwrap_err();
    match err {
        UpdateError::Multiple(errors) => {
            assert!(matches!(
                errors.as_slice(),
                [UpdateError::Forbidden { user, .. }] if user == "mallory"
            ));
        }
        other => panic!("unexpected error: {other}"),
    }
    assert_eq!(changeset.state, ChangesetState::Failed);
}

#[test]
fn stale_changesets_conflict_and_performed_ones_cannot_rerun() {
    let conn = open_db_in_memory().unwrap();
    let service = service(&conn);
    let engine = engine(&conn);

    service
        .create_resource("alice", "snake", Some("python"))
        .unwrap();

    let mut changeset = Changeset::new(
        "/snake/python",
        "alice",
        None,
        vec![put("/snake/python", "science", json!({"label": "Python"}))],
    );
    // Persist as pending, as an approval workflow would.
    changeset.version = 1;
    ChangesetRepo::new(&conn).upsert(&changeset).unwrap();
    let mut stale = changeset.clone();

    engine.perform(&mut changeset).unwrap();
    assert_eq!(changeset.state, ChangesetState::Performed);
    assert_eq!(changeset.version, 2);

    let err = engine.perform(&mut stale).unwrap_err();
    assert!(matches!(
        err,
        UpdateError::ChangesetConflict { expected: 1, actual: 2, .. }
    ));

    let err = engine.perform(&mut changeset).unwrap_err();
    assert!(matches!(err, UpdateError::AlreadyPerformed { .. }));
}

#[test]
fn empty_patch_is_a_noop_unless_creation_is_required() {
    let conn = open_db_in_memory().unwrap();
    let service = service(&conn);

    service
        .create_resource("alice", "snake", Some("python"))
        .unwrap();
    let (_, report) = service
        .perform_changeset(
            "/snake/python",
            "alice",
            None,
            vec![UpdateOperation::Patch {
                target: pair("/snake/python", "science"),
                patch: Vec::new(),
                create_empty_if_missing: true,
            }],
        )
        .unwrap();
    assert_eq!(report.outcomes, vec![Some(OpOutcome::Created)]);

    let (_, report) = service
        .perform_changeset(
            "/snake/python",
            "alice",
            None,
            vec![UpdateOperation::Patch {
                target: pair("/snake/python", "science"),
                patch: Vec::new(),
                create_empty_if_missing: false,
            }],
        )
        .unwrap();
    assert_eq!(report.outcomes, vec![None]);
}

#[test]
fn committed_changesets_notify_the_sink() {
    let conn = open_db_in_memory().unwrap();
    let sink = Arc::new(CollectingSink::default());
    let service = GraphService::new(
        &conn,
        registry(),
        Arc::new(AllowAllGate),
        Arc::clone(&sink) as Arc<dyn weft_core::ChangeSink>,
    );

    service
        .create_resource("alice", "snake", Some("python"))
        .unwrap();
    service
        .perform_changeset(
            "/snake/python",
            "alice",
            None,
            vec![put("/snake/python", "science", json!({"label": "Python"}))],
        )
        .unwrap();

    let events = sink.events();
    assert!(events.iter().any(|event| matches!(
        event,
        weft_core::ChangeEvent::SourceSaved { href, created: true, .. }
            if href == "/snake/python/source/science"
    )));
    assert!(events.iter().any(|event| matches!(
        event,
        weft_core::ChangeEvent::ResourceSaved { href, version: 1 }
            if href == "/snake/python"
    )));
}
