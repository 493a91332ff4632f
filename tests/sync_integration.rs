//! End-to-end sync sessions through the `Bridge` facade against an
//! in-memory upstream and a temporary SQLite cache.

mod common;

use common::*;
use elevation_bridge::{CachedEntity, ParseStatus, SyncScope, SyncStatus, UpstreamError};
use tempfile::TempDir;

#[tokio::test]
async fn test_full_sync_materializes_and_parses_hierarchy() {
    let tmp = TempDir::new().unwrap();
    let upstream = FakeUpstream::new();
    single_project(
        &upstream,
        vec![("e1", complete_blob("E-1").await), ("e2", minimal_blob("E-2").await)],
    );
    let bridge = open_bridge(&tmp, &upstream).await;

    let summary = bridge.trigger_sync(SyncScope::All, true, false).await;
    assert!(summary.aborted.is_none(), "aborted: {:?}", summary.aborted);
    assert!(summary.failures.is_empty(), "failures: {:?}", summary.failures);
    assert_eq!(summary.directories.seen, 1);
    assert_eq!(summary.directories.created, 1);
    assert_eq!(summary.projects.created, 1);
    assert_eq!(summary.phases.created, 1);
    assert_eq!(summary.elevations.created, 2);
    assert_eq!(summary.parses.queued, 2);
    assert_eq!(summary.parses.succeeded, 2);

    let project = project_by_ref(&bridge, "p1").await;
    assert_eq!(project.sync_status, SyncStatus::Synced);
    assert_eq!(project.source_ref.as_deref(), Some("REF-p1"));

    let elevations = bridge.list_elevations(&project.id).await.unwrap();
    assert_eq!(elevations.len(), 2);
    for elevation in &elevations {
        assert_eq!(elevation.parse_status, ParseStatus::Success);
        assert_eq!(elevation.sync_status, SyncStatus::Synced);
        assert!(elevation.content_hash.is_some());
        assert!(elevation.parsed_at.is_some());
    }

    let complete = elevations.iter().find(|e| e.external_id == "e1").unwrap();
    assert_eq!(complete.data_quality_score, Some(100));
    assert_eq!(complete.glass_specifications.len(), 2);
    let parsed = complete.parsed.as_ref().unwrap();
    assert_eq!(parsed.name.as_deref(), Some("E-1"));
    assert_eq!(parsed.width, Some(2400.0));
    assert_eq!(parsed.unit, "mm");

    let minimal = elevations.iter().find(|e| e.external_id == "e2").unwrap();
    assert!(minimal.data_quality_score.unwrap() < 100);
    assert!(!minimal.parse_warnings.is_empty());

    match bridge.get_entity(&complete.id).await.unwrap() {
        CachedEntity::Elevation(record) => assert_eq!(record.glass_specifications.len(), 2),
        other => panic!("expected an elevation, got {:?}", other),
    }

    let stats = bridge.stats().await.unwrap();
    assert_eq!(stats.elevations, 2);
    assert_eq!(stats.parses.success, 2);
    assert_eq!(stats.last_session.unwrap().status, "completed");

    bridge.shutdown().await;
}

#[tokio::test]
async fn test_unchanged_upstream_skips_blob_fetch() {
    let tmp = TempDir::new().unwrap();
    let upstream = FakeUpstream::new();
    single_project(&upstream, vec![("e1", complete_blob("E-1").await)]);
    let bridge = open_bridge(&tmp, &upstream).await;

    bridge.trigger_sync(SyncScope::All, true, false).await;
    let id = elevation_id(&bridge, "p1", "e1").await;
    let before = match bridge.get_entity(&id).await.unwrap() {
        CachedEntity::Elevation(record) => record,
        other => panic!("expected an elevation, got {:?}", other),
    };
    assert_eq!(upstream.calls("blob:e1"), 1);

    let summary = bridge.trigger_sync(SyncScope::All, true, false).await;
    assert!(summary.failures.is_empty(), "failures: {:?}", summary.failures);
    assert_eq!(summary.projects.unchanged, 1);
    assert_eq!(summary.phases.unchanged, 1);
    assert_eq!(summary.elevations.seen, 1);
    assert_eq!(summary.elevations.unchanged, 1);
    assert_eq!(summary.parses.queued, 0);
    assert_eq!(upstream.calls("blob:e1"), 1);

    let after = match bridge.get_entity(&id).await.unwrap() {
        CachedEntity::Elevation(record) => record,
        other => panic!("expected an elevation, got {:?}", other),
    };
    assert_eq!(after.parsed_at, before.parsed_at);
    assert_eq!(after.content_hash, before.content_hash);
    assert_eq!(after.last_sync_date, before.last_sync_date);

    bridge.shutdown().await;
}

#[tokio::test]
async fn test_updated_elevation_is_reparsed() {
    let tmp = TempDir::new().unwrap();
    let upstream = FakeUpstream::new();
    single_project(&upstream, vec![("e1", minimal_blob("E-1").await)]);
    let bridge = open_bridge(&tmp, &upstream).await;

    bridge.trigger_sync(SyncScope::All, true, false).await;
    let id = elevation_id(&bridge, "p1", "e1").await;

    upstream.replace_blob("e1", complete_blob("E-1").await);
    let summary = bridge.trigger_sync(SyncScope::All, true, false).await;
    assert_eq!(summary.elevations.updated, 1);
    assert_eq!(summary.parses.succeeded, 1);
    assert_eq!(upstream.calls("blob:e1"), 2);

    match bridge.get_entity(&id).await.unwrap() {
        CachedEntity::Elevation(record) => {
            assert_eq!(record.data_quality_score, Some(100));
            assert_eq!(record.glass_specifications.len(), 2);
        }
        other => panic!("expected an elevation, got {:?}", other),
    }

    bridge.shutdown().await;
}

#[tokio::test]
async fn test_forced_sync_refetches_everything() {
    let tmp = TempDir::new().unwrap();
    let upstream = FakeUpstream::new();
    single_project(&upstream, vec![("e1", complete_blob("E-1").await)]);
    let bridge = open_bridge(&tmp, &upstream).await;

    bridge.trigger_sync(SyncScope::All, true, false).await;
    let summary = bridge.trigger_sync(SyncScope::All, true, true).await;
    assert_eq!(summary.projects.updated, 1);
    assert_eq!(summary.elevations.updated, 1);
    assert_eq!(summary.parses.succeeded, 1);
    assert_eq!(upstream.calls("blob:e1"), 2);

    bridge.shutdown().await;
}

#[tokio::test]
async fn test_excluded_directory_hides_previously_cached_projects() {
    let tmp = TempDir::new().unwrap();
    let upstream = FakeUpstream::new();
    upstream.add_directory("d1", None, false);
    upstream.add_directory("d1-sub", Some("d1"), false);
    upstream.add_directory("d2", None, false);
    upstream.add_project("d1", "p1");
    upstream.add_project("d1-sub", "p2");
    upstream.add_project("d2", "p3");
    upstream.add_phase("p1", "ph1");
    upstream.add_elevation("ph1", "e1", minimal_blob("E-1").await);
    let bridge = open_bridge(&tmp, &upstream).await;

    bridge.trigger_sync(SyncScope::All, true, false).await;
    assert_eq!(bridge.list_projects().await.unwrap().len(), 3);
    let p1 = project_by_ref(&bridge, "p1").await;
    assert_eq!(bridge.list_elevations(&p1.id).await.unwrap().len(), 1);

    assert!(bridge.set_directory_exclusion("d1", Some(true)).await.unwrap());
    assert!(!bridge.set_directory_exclusion("nope", Some(true)).await.unwrap());

    let listed: Vec<String> = bridge
        .list_projects()
        .await
        .unwrap()
        .into_iter()
        .map(|p| p.external_id)
        .collect();
    assert_eq!(listed, vec!["p3".to_string()]);
    assert!(bridge.list_elevations(&p1.id).await.unwrap().is_empty());

    match bridge.get_entity("d1-sub").await.unwrap() {
        CachedEntity::Directory(dir) => {
            assert!(!dir.excluded);
            assert!(!dir.syncable);
        }
        other => panic!("expected a directory, got {:?}", other),
    }

    let summary = bridge.trigger_sync(SyncScope::All, true, false).await;
    assert_eq!(summary.directories.excluded, 2);
    assert_eq!(upstream.calls("projects:d1"), 1);
    assert_eq!(upstream.calls("projects:d1-sub"), 1);
    assert_eq!(upstream.calls("projects:d2"), 2);

    let direct = bridge.trigger_sync(SyncScope::Project(p1.id.clone()), true, false).await;
    assert_eq!(direct.failures.len(), 1);
    assert!(direct.failures[0].reason.contains("excluded"));
    assert_eq!(upstream.calls("phases:p1"), 1);

    assert!(bridge.set_directory_exclusion("d1", None).await.unwrap());
    assert_eq!(bridge.list_projects().await.unwrap().len(), 3);

    bridge.shutdown().await;
}

#[tokio::test]
async fn test_upstream_exclusion_flag_scenario() {
    let tmp = TempDir::new().unwrap();
    let upstream = FakeUpstream::new();

    // 20 syncable directories holding 77 projects.
    for i in 0..20 {
        let dir = format!("d{:02}", i);
        upstream.add_directory(&dir, None, false);
        let count = if i < 17 { 4 } else { 3 };
        for j in 0..count {
            upstream.add_project(&dir, &format!("{}-p{}", dir, j));
        }
    }
    // 5 excluded directories holding 20: one flagged, four beneath it.
    upstream.add_directory("x0", None, true);
    for i in 1..5 {
        upstream.add_directory(&format!("x{}", i), Some("x0"), false);
    }
    for i in 0..5 {
        for j in 0..4 {
            upstream.add_project(&format!("x{}", i), &format!("x{}-p{}", i, j));
        }
    }
    let bridge = open_bridge(&tmp, &upstream).await;

    let summary = bridge.trigger_sync(SyncScope::All, false, false).await;
    assert!(summary.failures.is_empty(), "failures: {:?}", summary.failures);
    assert_eq!(summary.directories.seen, 25);
    assert_eq!(summary.directories.excluded, 5);
    assert_eq!(summary.projects.seen, 77);
    assert_eq!(summary.projects.created, 77);
    assert_eq!(upstream.calls_with_prefix("projects:x"), 0);
    assert_eq!(upstream.calls_with_prefix("phases:"), 0);

    let projects = bridge.list_projects().await.unwrap();
    assert_eq!(projects.len(), 77);
    assert!(projects.iter().all(|p| !p.external_id.starts_with('x')));

    let stats = bridge.stats().await.unwrap();
    assert_eq!(stats.directories, 25);
    assert_eq!(stats.excluded_directories, 5);

    bridge.shutdown().await;
}

#[tokio::test]
async fn test_project_missing_upstream_is_flagged_not_deleted() {
    let tmp = TempDir::new().unwrap();
    let upstream = FakeUpstream::new();
    upstream.add_directory("d1", None, false);
    upstream.add_project("d1", "p1");
    upstream.add_project("d1", "p2");
    let bridge = open_bridge(&tmp, &upstream).await;

    bridge.trigger_sync(SyncScope::All, false, false).await;
    upstream.remove_project("d1", "p2");

    let summary = bridge.trigger_sync(SyncScope::All, false, false).await;
    assert_eq!(summary.projects.seen, 1);
    assert_eq!(summary.projects.missing, 1);

    let p2 = project_by_ref(&bridge, "p2").await;
    assert_eq!(p2.sync_status, SyncStatus::Error);
    assert_eq!(p2.sync_error.as_deref(), Some("missing from upstream listing"));
    assert_eq!(bridge.list_projects().await.unwrap().len(), 2);

    bridge.shutdown().await;
}

#[tokio::test]
async fn test_configuration_error_aborts_session() {
    let tmp = TempDir::new().unwrap();
    let upstream = FakeUpstream::new();
    single_project(&upstream, vec![("e1", minimal_blob("E-1").await)]);
    upstream.fail("directories", UpstreamError::Configuration("401 unauthorized".into()));
    let bridge = open_bridge(&tmp, &upstream).await;

    let summary = bridge.trigger_sync(SyncScope::All, true, false).await;
    assert!(summary.aborted.as_deref().unwrap().contains("401"));
    assert_eq!(summary.projects.seen, 0);
    assert_eq!(upstream.calls("directories"), 1);
    assert_eq!(upstream.calls_with_prefix("projects:"), 0);

    let stats = bridge.stats().await.unwrap();
    assert_eq!(stats.last_session.unwrap().status, "aborted");

    bridge.shutdown().await;
}

#[tokio::test]
async fn test_configuration_error_mid_walk_stops_submission() {
    let tmp = TempDir::new().unwrap();
    let upstream = FakeUpstream::new();
    single_project(&upstream, vec![("e1", minimal_blob("E-1").await)]);
    upstream.fail("phases:p1", UpstreamError::Configuration("403 forbidden".into()));
    let bridge = open_bridge(&tmp, &upstream).await;

    let summary = bridge.trigger_sync(SyncScope::All, true, false).await;
    assert!(summary.aborted.is_some());
    assert_eq!(summary.projects.created, 1);
    assert_eq!(summary.parses.queued, 0);
    assert_eq!(upstream.calls("phases:p1"), 1);

    bridge.shutdown().await;
}

#[tokio::test]
async fn test_transient_exhaustion_fails_only_that_entity() {
    let tmp = TempDir::new().unwrap();
    let upstream = FakeUpstream::new();
    single_project(
        &upstream,
        vec![("e1", minimal_blob("E-1").await), ("e2", minimal_blob("E-2").await)],
    );
    upstream.fail("blob:e1", UpstreamError::Transient("503 service unavailable".into()));
    let bridge = open_bridge(&tmp, &upstream).await;

    let summary = bridge.trigger_sync(SyncScope::All, true, false).await;
    assert!(summary.aborted.is_none());
    assert_eq!(summary.parses.succeeded, 1);
    assert_eq!(summary.parses.failed, 1);
    assert_eq!(summary.failures.len(), 1);
    // One attempt plus `max_retries` retries.
    assert_eq!(upstream.calls("blob:e1"), 3);

    let e1 = elevation_id(&bridge, "p1", "e1").await;
    match bridge.get_entity(&e1).await.unwrap() {
        CachedEntity::Elevation(record) => {
            assert_eq!(record.sync_status, SyncStatus::Error);
            assert_eq!(record.parse_status, ParseStatus::Pending);
            assert!(record.sync_error.unwrap().contains("503"));
        }
        other => panic!("expected an elevation, got {:?}", other),
    }
    assert_eq!(bridge.stats().await.unwrap().last_session.unwrap().status, "completed_with_errors");

    // The error row is retried by the next session even though upstream
    // reports no change.
    upstream.heal("blob:e1");
    let summary = bridge.trigger_sync(SyncScope::All, true, false).await;
    assert!(summary.failures.is_empty(), "failures: {:?}", summary.failures);
    assert_eq!(summary.parses.succeeded, 1);
    assert_eq!(upstream.calls("blob:e2"), 1);

    bridge.shutdown().await;
}

#[tokio::test]
async fn test_sync_single_project_and_elevation() {
    let tmp = TempDir::new().unwrap();
    let upstream = FakeUpstream::new();
    single_project(&upstream, vec![("e1", minimal_blob("E-1").await)]);
    let bridge = open_bridge(&tmp, &upstream).await;

    bridge.trigger_sync(SyncScope::All, false, false).await;
    let project = project_by_ref(&bridge, "p1").await;
    assert!(bridge.list_elevations(&project.id).await.unwrap().is_empty());

    let summary = bridge
        .trigger_sync(SyncScope::Project(project.id.clone()), true, false)
        .await;
    assert!(summary.failures.is_empty(), "failures: {:?}", summary.failures);
    assert_eq!(summary.projects.unchanged, 1);
    assert_eq!(summary.elevations.created, 1);
    assert_eq!(summary.parses.succeeded, 1);

    let id = elevation_id(&bridge, "p1", "e1").await;
    upstream.replace_blob("e1", complete_blob("E-1").await);
    let summary = bridge.trigger_sync(SyncScope::Elevation(id.clone()), false, false).await;
    assert_eq!(summary.elevations.updated, 1);
    assert_eq!(summary.parses.succeeded, 1);

    match bridge.get_entity(&id).await.unwrap() {
        CachedEntity::Elevation(record) => assert_eq!(record.data_quality_score, Some(100)),
        other => panic!("expected an elevation, got {:?}", other),
    }

    let unknown = bridge
        .trigger_sync(SyncScope::Project("no-such-project".into()), true, false)
        .await;
    assert_eq!(unknown.failures.len(), 1);
    assert!(unknown.failures[0].reason.contains("not found"));

    bridge.shutdown().await;
}

#[tokio::test]
async fn test_cancelled_sync_submits_nothing() {
    let tmp = TempDir::new().unwrap();
    let upstream = FakeUpstream::new();
    single_project(&upstream, vec![("e1", minimal_blob("E-1").await)]);
    let bridge = open_bridge(&tmp, &upstream).await;

    let cancel = tokio_util::sync::CancellationToken::new();
    cancel.cancel();
    let summary = bridge.trigger_sync_with(SyncScope::All, true, false, &cancel).await;
    assert!(summary.cancelled);
    assert_eq!(summary.parses.queued, 0);
    assert_eq!(upstream.calls_with_prefix("blob:"), 0);

    // The bridge itself is unaffected.
    let summary = bridge.trigger_sync(SyncScope::All, true, false).await;
    assert!(!summary.cancelled);
    assert_eq!(summary.parses.succeeded, 1);

    bridge.shutdown().await;
}

#[tokio::test]
async fn test_cancelled_project_and_elevation_scopes_skip_parsing() {
    let tmp = TempDir::new().unwrap();
    let upstream = FakeUpstream::new();
    single_project(&upstream, vec![("e1", minimal_blob("E-1").await)]);
    let bridge = open_bridge(&tmp, &upstream).await;

    bridge.trigger_sync(SyncScope::All, true, false).await;
    let project = project_by_ref(&bridge, "p1").await;
    let id = elevation_id(&bridge, "p1", "e1").await;
    upstream.replace_blob("e1", complete_blob("E-1").await);
    let listed_before = upstream.calls("elevations:ph1");

    let cancel = tokio_util::sync::CancellationToken::new();
    cancel.cancel();

    let summary = bridge
        .trigger_sync_with(SyncScope::Project(project.id.clone()), true, false, &cancel)
        .await;
    assert!(summary.cancelled);
    assert_eq!(summary.parses.queued, 0);
    assert_eq!(upstream.calls("elevations:ph1"), listed_before);
    assert_eq!(upstream.calls("blob:e1"), 1);

    let summary = bridge
        .trigger_sync_with(SyncScope::Elevation(id.clone()), false, false, &cancel)
        .await;
    assert!(summary.cancelled);
    assert_eq!(summary.elevations.updated, 1);
    assert_eq!(summary.parses.queued, 0);
    assert_eq!(upstream.calls("blob:e1"), 1);

    // Without cancellation the same scope parses the new blob.
    let summary = bridge.trigger_sync(SyncScope::Elevation(id), false, false).await;
    assert!(!summary.cancelled);
    assert_eq!(summary.parses.succeeded, 1);
    assert_eq!(upstream.calls("blob:e1"), 2);

    bridge.shutdown().await;
}
