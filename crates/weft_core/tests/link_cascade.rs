mod common;

use common::registry;
use serde_json::json;
use std::sync::Arc;
use weft_core::db::open_db_in_memory;
use weft_core::pipeline::normalize::outbound_links;
use weft_core::repo::link_repo::LinkRepo;
use weft_core::service::graph_service::GraphService;
use weft_core::{AllowAllGate, NoopSink, OperationTarget, RegenEngine, UpdateOperation};

fn service(conn: &rusqlite::Connection) -> GraphService<'_> {
    GraphService::new(
        conn,
        registry(),
        Arc::new(AllowAllGate),
        Arc::new(NoopSink),
    )
}

fn put_science(href: &str, data: serde_json::Value) -> UpdateOperation {
    UpdateOperation::Put {
        target: OperationTarget::Pair {
            resource_href: href.to_string(),
            source_type: "science".to_string(),
        },
        data: Some(data),
    }
}

#[test]
fn outbound_link_surfaces_inbound_on_the_target() {
    // Scenario: A eats B; regenerating A materializes the edge and B's
    // document gains an inbound eatenBy entry referencing A.
    let conn = open_db_in_memory().unwrap();
    let service = service(&conn);

    service.create_resource("alice", "snake", Some("a")).unwrap();
    service.create_resource("alice", "snake", Some("b")).unwrap();
    service
        .perform_changeset(
            "/snake/a",
            "alice",
            None,
            vec![put_science("/snake/a", json!({"eats": "/snake/b"}))],
        )
        .unwrap();

    let link_repo = LinkRepo::new(&conn);
    let stored = link_repo.outbound("/snake/a").unwrap();
    assert!(stored.contains(&("/snake/b".to_string(), "eats".to_string())));

    let target = service.get_resource("/snake/b").unwrap();
    assert_eq!(
        target.data["eatenBy"],
        json!([{"href": "/snake/a", "inbound": true}])
    );
    // The cascade bumped B, not just A.
    assert_eq!(target.version, 1);
}

#[test]
fn cyclic_link_graph_saves_terminate_visiting_each_node_once() {
    let conn = open_db_in_memory().unwrap();
    let service = service(&conn);

    service.create_resource("alice", "snake", Some("a")).unwrap();
    service.create_resource("alice", "snake", Some("b")).unwrap();
    service
        .perform_changeset(
            "/snake/a",
            "alice",
            None,
            vec![put_science("/snake/a", json!({"eats": "/snake/b"}))],
        )
        .unwrap();
    service
        .perform_changeset(
            "/snake/b",
            "alice",
            None,
            vec![put_science("/snake/b", json!({"eats": "/snake/a"}))],
        )
        .unwrap();

    // Force one more save anywhere in the cycle; it must terminate and
    // visit each href at most once.
    let engine = RegenEngine::new(&conn, registry());
    let report = engine.save("/snake/a").unwrap();
    let mut visited = report.visited.clone();
    visited.sort();
    visited.dedup();
    assert_eq!(visited.len(), report.visited.len());

    let a = service.get_resource("/snake/a").unwrap();
    let b = service.get_resource("/snake/b").unwrap();
    assert_eq!(a.data["eats"], json!([{"href": "/snake/b"}]));
    assert_eq!(
        a.data["eatenBy"],
        json!([{"href": "/snake/b", "inbound": true}])
    );
    assert_eq!(b.data["eats"], json!([{"href": "/snake/a"}]));
    assert_eq!(
        b.data["eatenBy"],
        json!([{"href": "/snake/a", "inbound": true}])
    );
}

#[test]
fn stored_links_always_equal_the_documents_outbound_set() {
    let conn = open_db_in_memory().unwrap();
    let service = service(&conn);
    let registry = registry();

    service.create_resource("alice", "snake", Some("a")).unwrap();
    service.create_resource("alice", "snake", Some("b")).unwrap();
    service.create_resource("alice", "snake", Some("c")).unwrap();

    let link_repo = LinkRepo::new(&conn);
    for eats in [
        json!(["/snake/b", "/snake/c"]),
        json!(["/snake/c"]),
        json!([]),
    ] {
        service
            .perform_changeset(
                "/snake/a",
                "alice",
                None,
                vec![put_science("/snake/a", json!({"eats": eats}))],
            )
            .unwrap();
        let resource = service.get_resource("/snake/a").unwrap();
        assert_eq!(
            link_repo.outbound("/snake/a").unwrap(),
            outbound_links(&resource.data, &registry)
        );
    }
}

#[test]
fn links_to_nonexistent_resources_cascade_harmlessly() {
    let conn = open_db_in_memory().unwrap();
    let service = service(&conn);

    service.create_resource("alice", "snake", Some("a")).unwrap();
    service
        .perform_changeset(
            "/snake/a",
            "alice",
            None,
            vec![put_science("/snake/a", json!({"eats": "/snake/ghost"}))],
        )
        .unwrap();

    let resource = service.get_resource("/snake/a").unwrap();
    assert_eq!(resource.data["eats"], json!([{"href": "/snake/ghost"}]));
    assert!(LinkRepo::new(&conn)
        .outbound("/snake/a")
        .unwrap()
        .contains(&("/snake/ghost".to_string(), "eats".to_string())));
}

#[test]
fn relative_link_targets_resolve_against_the_resource_href() {
    let conn = open_db_in_memory().unwrap();
    let service = service(&conn);

    service.create_resource("alice", "snake", Some("a")).unwrap();
    service.create_resource("alice", "snake", Some("b")).unwrap();
    service
        .perform_changeset(
            "/snake/a",
            "alice",
            None,
            vec![put_science("/snake/a", json!({"eats": "b"}))],
        )
        .unwrap();

    let resource = service.get_resource("/snake/a").unwrap();
    assert_eq!(resource.data["eats"], json!([{"href": "/snake/b"}]));
}
