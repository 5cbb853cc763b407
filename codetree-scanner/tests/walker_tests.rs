use codetree_scanner::scripted::{leaf_keys, Operation};
use codetree_scanner::{
    ArtifactStore, CategoryPath, MenuEntry, RecoveryPolicy, ScanError, ScriptedPortal,
    SessionManager, TreeWalker, VisitRecord, VisitStatus, WalkerSettings,
};
use futures::StreamExt;
use std::collections::HashSet;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

// ============================================================================
// Helpers
// ============================================================================

fn leaf(label: &str) -> MenuEntry {
    MenuEntry::leaf(label)
}

fn branch(label: &str, children: Vec<MenuEntry>) -> MenuEntry {
    MenuEntry::branch(label, children)
}

fn walker_for(portal: &ScriptedPortal, dir: &TempDir, max_recoveries: u32) -> TreeWalker {
    let session = SessionManager::new(Box::new(portal.clone())).with_policy(RecoveryPolicy {
        max_recoveries,
        reopen_attempts: 2,
        recovery_timeout: Duration::from_secs(5),
        backoff: Duration::from_millis(1),
        stable_timeout: Duration::from_millis(50),
    });
    TreeWalker::new(session, ArtifactStore::new(dir.path().join("artifacts"))).with_settings(
        WalkerSettings {
            stable_timeout: Duration::from_millis(50),
            download_timeout: Duration::from_millis(100),
            element_retries: 2,
            extended_wait_factor: 2.0,
        },
    )
}

async fn run(walker: &mut TreeWalker, start: Option<&CategoryPath>) -> Vec<VisitRecord> {
    walker.start(start).await.unwrap();
    let mut records = Vec::new();
    while let Some(record) = walker.next_visit().await {
        records.push(record);
    }
    records
}

fn keys_with(records: &[VisitRecord], status: VisitStatus) -> Vec<String> {
    records
        .iter()
        .filter(|r| r.status == status)
        .map(|r| r.key())
        .collect()
}

fn sample_menu() -> Vec<MenuEntry> {
    vec![
        branch(
            "A",
            vec![
                branch("B", vec![leaf("C"), leaf("D"), leaf("E")]),
                branch("Empty", vec![]),
                branch("F", vec![leaf("G")]),
            ],
        ),
        branch("H", vec![]),
        branch("I", vec![branch("J", vec![leaf("K"), leaf("L")])]),
    ]
}

// ============================================================================
// Coverage and ordering
// ============================================================================

#[tokio::test]
async fn test_two_leaf_scenario() {
    let dir = TempDir::new().unwrap();
    let portal = ScriptedPortal::new(
        vec![branch("M1", vec![branch("S1", vec![leaf("L1"), leaf("L2")])])],
        dir.path().join("downloads"),
    );
    let mut walker = walker_for(&portal, &dir, 2);

    let records = run(&mut walker, None).await;

    assert_eq!(records.len(), 2);
    assert_eq!(records[0].key(), "M1 > S1 > L1");
    assert_eq!(records[1].key(), "M1 > S1 > L2");
    assert!(records.iter().all(|r| r.status == VisitStatus::Success));

    let first = records[0].artifact.as_ref().unwrap();
    let second = records[1].artifact.as_ref().unwrap();
    assert_ne!(first.path, second.path);
    assert!(first.path.exists() && second.path.exists());
    assert!(walker.is_finished());
    assert!(!walker.is_cancelled());
}

#[tokio::test]
async fn test_visits_follow_pre_order_without_duplicates() {
    let dir = TempDir::new().unwrap();
    let menu = sample_menu();
    let portal = ScriptedPortal::new(menu.clone(), dir.path().join("downloads"));
    let mut walker = walker_for(&portal, &dir, 2);

    let records = run(&mut walker, None).await;
    let visited = keys_with(&records, VisitStatus::Success);

    assert_eq!(visited, leaf_keys(&menu));
    assert_eq!(records.len(), visited.len());
    let unique: HashSet<&String> = visited.iter().collect();
    assert_eq!(unique.len(), visited.len());

    let discovered: Vec<String> = walker.discovered_paths().iter().map(|p| p.key()).collect();
    assert_eq!(discovered, leaf_keys(&menu));
}

#[tokio::test]
async fn test_empty_mid_contributes_nothing() {
    let dir = TempDir::new().unwrap();
    let portal = ScriptedPortal::new(
        vec![branch("M", vec![branch("Empty", vec![]), branch("S", vec![leaf("L")])])],
        dir.path().join("downloads"),
    );
    let mut walker = walker_for(&portal, &dir, 2);

    let records = run(&mut walker, None).await;

    assert_eq!(records.len(), 1);
    assert_eq!(records[0].key(), "M > S > L");
    assert!(records.iter().all(|r| !r.key().contains("Empty")));
}

#[tokio::test]
async fn test_duplicate_labels_are_visited_separately() {
    let dir = TempDir::new().unwrap();
    let portal = ScriptedPortal::new(
        vec![branch(
            "M",
            vec![branch("S", vec![leaf("Dup"), leaf("Other"), leaf("Dup")])],
        )],
        dir.path().join("downloads"),
    );
    let mut walker = walker_for(&portal, &dir, 2);

    let records = run(&mut walker, None).await;

    assert_eq!(
        keys_with(&records, VisitStatus::Success),
        vec!["M > S > Dup", "M > S > Other", "M > S > Dup#2"]
    );
    assert_eq!(portal.downloads().len(), 3);
}

#[tokio::test]
async fn test_artifact_name_matches_record_timestamp() {
    let dir = TempDir::new().unwrap();
    let portal = ScriptedPortal::new(sample_menu(), dir.path().join("downloads"));
    let mut walker = walker_for(&portal, &dir, 2);

    let records = run(&mut walker, None).await;

    assert!(!records.is_empty());
    for record in records.iter().filter(|r| r.status == VisitStatus::Success) {
        let artifact = record.artifact.as_ref().unwrap();
        let name = artifact.path.file_name().unwrap().to_string_lossy();
        let stamp = record.timestamp.format("%Y%m%d_%H%M%S").to_string();
        assert!(
            name.contains(&stamp),
            "'{}' is not named after {}",
            name,
            stamp
        );
    }
}

#[tokio::test]
async fn test_traverse_stream() {
    let dir = TempDir::new().unwrap();
    let menu = sample_menu();
    let portal = ScriptedPortal::new(menu.clone(), dir.path().join("downloads"));
    let mut walker = walker_for(&portal, &dir, 2);

    let records: Vec<VisitRecord> = walker.traverse(None).await.unwrap().collect().await;
    assert_eq!(records.len(), leaf_keys(&menu).len());
}

// ============================================================================
// Resume
// ============================================================================

#[tokio::test]
async fn test_completed_leaf_is_skipped_without_download() {
    let dir = TempDir::new().unwrap();
    let portal = ScriptedPortal::new(sample_menu(), dir.path().join("downloads"));
    let done: HashSet<String> = ["A > B > C".to_string()].into_iter().collect();
    let mut walker = walker_for(&portal, &dir, 2)
        .with_completed_check(Arc::new(move |path: &CategoryPath| done.contains(&path.key())));

    let records = run(&mut walker, None).await;

    assert_eq!(records[0].key(), "A > B > C");
    assert_eq!(records[0].status, VisitStatus::Skipped);
    assert!(records[0].artifact.is_none());
    assert_eq!(portal.download_attempts("A > B > C"), 0);
    assert!(!portal.downloads().contains(&"A > B > C".to_string()));
    assert_eq!(keys_with(&records, VisitStatus::Skipped).len(), 1);
}

// ============================================================================
// Session loss and recovery
// ============================================================================

#[tokio::test]
async fn test_single_loss_between_leaves_keeps_coverage() {
    let dir = TempDir::new().unwrap();
    let menu = sample_menu();
    let portal = ScriptedPortal::new(menu.clone(), dir.path().join("downloads"));
    portal.kill_after(Operation::AwaitDownload, 1);
    let mut walker = walker_for(&portal, &dir, 2);

    let records = run(&mut walker, None).await;

    assert_eq!(keys_with(&records, VisitStatus::Success), leaf_keys(&menu));
    assert!(keys_with(&records, VisitStatus::Failed).is_empty());
    assert_eq!(walker.recoveries().len(), 1);
    assert_eq!(walker.recoveries()[0].scope, "A > B > D");
    assert_eq!(portal.call_count(Operation::Reopen), 1);
}

#[tokio::test]
async fn test_loss_inside_a_leaf_retries_that_leaf() {
    let dir = TempDir::new().unwrap();
    let menu = sample_menu();
    let portal = ScriptedPortal::new(menu.clone(), dir.path().join("downloads"));
    portal.lose_session_on(Operation::TriggerDownload, 3);
    let mut walker = walker_for(&portal, &dir, 2);

    let records = run(&mut walker, None).await;

    let succeeded: HashSet<String> = keys_with(&records, VisitStatus::Success).into_iter().collect();
    let expected: HashSet<String> = leaf_keys(&menu).into_iter().collect();
    assert_eq!(succeeded, expected);
    assert_eq!(portal.download_attempts("A > B > E"), 1);
}

#[tokio::test]
async fn test_loss_while_entering_a_branch() {
    let dir = TempDir::new().unwrap();
    let menu = sample_menu();
    let portal = ScriptedPortal::new(menu.clone(), dir.path().join("downloads"));
    // the second enumeration lists the mids of "A"
    portal.lose_session_on(Operation::Enumerate, 2);
    let mut walker = walker_for(&portal, &dir, 2);

    let records = run(&mut walker, None).await;

    assert_eq!(keys_with(&records, VisitStatus::Success), leaf_keys(&menu));
    assert_eq!(walker.recoveries().len(), 1);
}

#[tokio::test]
async fn test_exhausted_budget_fails_only_that_leaf() {
    let dir = TempDir::new().unwrap();
    let portal = ScriptedPortal::new(sample_menu(), dir.path().join("downloads"));
    portal.lose_session_on_download("A > B > D", 100);
    let mut walker = walker_for(&portal, &dir, 2);

    let records = run(&mut walker, None).await;

    let failed: Vec<&VisitRecord> = records
        .iter()
        .filter(|r| r.status == VisitStatus::Failed)
        .collect();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].key(), "A > B > D");
    assert_eq!(failed[0].error_kind.as_deref(), Some("session_unrecoverable"));

    let succeeded = keys_with(&records, VisitStatus::Success);
    assert!(succeeded.contains(&"A > B > E".to_string()));
    assert!(succeeded.contains(&"I > J > L".to_string()));
    assert_eq!(
        records.iter().filter(|r| r.key() == "A > B > D").count(),
        1
    );
}

#[tokio::test]
async fn test_budget_exhausted_on_the_way_back_fails_only_that_leaf() {
    let dir = TempDir::new().unwrap();
    let menu = vec![
        branch(
            "A",
            vec![
                branch("B", vec![leaf("C"), leaf("D"), leaf("E")]),
                branch("F", vec![leaf("G")]),
            ],
        ),
        branch("I", vec![branch("J", vec![leaf("K")])]),
    ];
    let portal = ScriptedPortal::new(menu, dir.path().join("downloads"));
    // D drops the session once, then both trips back to D lose it again
    portal.lose_session_on_download("A > B > D", 1);
    portal.lose_session_on(Operation::OpenRoot, 3);
    portal.lose_session_on(Operation::OpenRoot, 5);
    let mut walker = walker_for(&portal, &dir, 2);

    let records = run(&mut walker, None).await;

    let failed: Vec<&VisitRecord> = records
        .iter()
        .filter(|r| r.status == VisitStatus::Failed)
        .collect();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].key(), "A > B > D");
    assert_eq!(failed[0].error_kind.as_deref(), Some("session_unrecoverable"));
    assert_eq!(
        records.iter().filter(|r| r.key() == "A > B > D").count(),
        1
    );

    assert_eq!(
        keys_with(&records, VisitStatus::Success),
        vec!["A > B > C", "A > B > E", "A > F > G", "I > J > K"]
    );
}

#[tokio::test]
async fn test_changed_menu_after_recovery() {
    let dir = TempDir::new().unwrap();
    let portal = ScriptedPortal::new(
        vec![
            branch("M1", vec![branch("S1", vec![leaf("L1"), leaf("L2"), leaf("L3")])]),
            branch("M2", vec![branch("S9", vec![leaf("X")])]),
        ],
        dir.path().join("downloads"),
    );
    portal.replace_menu_on_reopen(vec![
        branch("M1", vec![branch("S1", vec![leaf("L1"), leaf("L3")])]),
        branch("M2", vec![branch("S9", vec![leaf("X")])]),
        branch("M3", vec![branch("S10", vec![leaf("Y")])]),
    ]);
    portal.kill_after(Operation::AwaitDownload, 1);
    let mut walker = walker_for(&portal, &dir, 2);

    let records = run(&mut walker, None).await;

    let summary: Vec<(String, VisitStatus)> =
        records.iter().map(|r| (r.key(), r.status)).collect();
    assert_eq!(
        summary,
        vec![
            ("M1 > S1 > L1".to_string(), VisitStatus::Success),
            ("M1 > S1 > L2".to_string(), VisitStatus::Failed),
            ("M1 > S1 > L3".to_string(), VisitStatus::Success),
            ("M2 > S9 > X".to_string(), VisitStatus::Success),
            ("M3 > S10 > Y".to_string(), VisitStatus::Success),
        ]
    );
    assert_eq!(
        records[1].error_detail.as_deref(),
        Some("path not found after recovery: M1 > S1 > L2")
    );
}

#[tokio::test]
async fn test_vanished_branch_after_recovery() {
    let dir = TempDir::new().unwrap();
    let portal = ScriptedPortal::new(
        vec![branch(
            "M",
            vec![
                branch("Gone", vec![leaf("L1"), leaf("L2")]),
                branch("Kept", vec![leaf("K")]),
            ],
        )],
        dir.path().join("downloads"),
    );
    portal.replace_menu_on_reopen(vec![branch("M", vec![branch("Kept", vec![leaf("K")])])]);
    portal.kill_after(Operation::AwaitDownload, 1);
    let mut walker = walker_for(&portal, &dir, 2);

    let records = run(&mut walker, None).await;

    let summary: Vec<(String, VisitStatus)> =
        records.iter().map(|r| (r.key(), r.status)).collect();
    assert_eq!(
        summary,
        vec![
            ("M > Gone > L1".to_string(), VisitStatus::Success),
            ("M > Gone".to_string(), VisitStatus::Failed),
            ("M > Kept > K".to_string(), VisitStatus::Success),
        ]
    );
    assert_eq!(
        records[1].error_kind.as_deref(),
        Some("path_not_found_after_recovery")
    );
}

#[tokio::test]
async fn test_download_closing_the_tree_is_not_a_recovery() {
    let dir = TempDir::new().unwrap();
    let menu = sample_menu();
    let portal = ScriptedPortal::new(menu.clone(), dir.path().join("downloads"));
    portal.set_download_leaves_tree(true);
    let mut walker = walker_for(&portal, &dir, 0);

    let records = run(&mut walker, None).await;

    assert_eq!(keys_with(&records, VisitStatus::Success), leaf_keys(&menu));
    assert!(walker.recoveries().is_empty());
    assert_eq!(portal.call_count(Operation::Reopen), 0);
}

// ============================================================================
// Leaf-scoped failures
// ============================================================================

#[tokio::test]
async fn test_failed_download_does_not_stop_siblings() {
    let dir = TempDir::new().unwrap();
    let portal = ScriptedPortal::new(sample_menu(), dir.path().join("downloads"));
    portal.fail_download("A > B > C");
    let mut walker = walker_for(&portal, &dir, 2);

    let records = run(&mut walker, None).await;

    assert_eq!(records[0].status, VisitStatus::Failed);
    assert_eq!(records[0].error_kind.as_deref(), Some("download_failed"));
    assert_eq!(records[1].key(), "A > B > D");
    assert_eq!(records[1].status, VisitStatus::Success);
}

#[tokio::test]
async fn test_missing_row_is_retried_after_reenumeration() {
    let dir = TempDir::new().unwrap();
    let portal = ScriptedPortal::new(sample_menu(), dir.path().join("downloads"));
    portal.hide_element("D", 1);
    let mut walker = walker_for(&portal, &dir, 2);

    let records = run(&mut walker, None).await;

    assert!(keys_with(&records, VisitStatus::Failed).is_empty());
    assert!(walker.recoveries().is_empty());
}

#[tokio::test]
async fn test_missing_row_fails_after_retries() {
    let dir = TempDir::new().unwrap();
    let portal = ScriptedPortal::new(sample_menu(), dir.path().join("downloads"));
    portal.hide_element("D", 10);
    let mut walker = walker_for(&portal, &dir, 2);

    let records = run(&mut walker, None).await;

    let failed: Vec<&VisitRecord> = records
        .iter()
        .filter(|r| r.status == VisitStatus::Failed)
        .collect();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].key(), "A > B > D");
    assert_eq!(failed[0].error_kind.as_deref(), Some("element_not_found"));
    assert!(keys_with(&records, VisitStatus::Success).contains(&"A > B > E".to_string()));
}

#[tokio::test]
async fn test_slow_page_gets_one_extended_wait() {
    let dir = TempDir::new().unwrap();
    let menu = sample_menu();
    let portal = ScriptedPortal::new(menu.clone(), dir.path().join("downloads"));
    let mut walker = walker_for(&portal, &dir, 2);
    walker.start(None).await.unwrap();
    portal.slow_stability(1);

    let mut records = Vec::new();
    while let Some(record) = walker.next_visit().await {
        records.push(record);
    }

    assert_eq!(keys_with(&records, VisitStatus::Success), leaf_keys(&menu));
}

#[tokio::test]
async fn test_page_that_never_settles_fails_once() {
    let dir = TempDir::new().unwrap();
    let portal = ScriptedPortal::new(sample_menu(), dir.path().join("downloads"));
    let mut walker = walker_for(&portal, &dir, 2);
    walker.start(None).await.unwrap();
    // both the normal and the extended wait for A time out
    portal.slow_stability(2);

    let mut records = Vec::new();
    while let Some(record) = walker.next_visit().await {
        records.push(record);
    }

    let failed: Vec<&VisitRecord> = records
        .iter()
        .filter(|r| r.status == VisitStatus::Failed)
        .collect();
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].key(), "A");
    assert_eq!(failed[0].error_kind.as_deref(), Some("timeout_exceeded"));
    assert_eq!(walker.recoveries().len(), 0);

    let succeeded = keys_with(&records, VisitStatus::Success);
    assert_eq!(succeeded, vec!["I > J > K", "I > J > L"]);
}

#[tokio::test]
async fn test_failed_branch_is_recorded_once() {
    let dir = TempDir::new().unwrap();
    let portal = ScriptedPortal::new(sample_menu(), dir.path().join("downloads"));
    portal.hide_element("F", 10);
    let mut walker = walker_for(&portal, &dir, 2);

    let records = run(&mut walker, None).await;

    assert_eq!(keys_with(&records, VisitStatus::Failed), vec!["A > F"]);
    assert!(keys_with(&records, VisitStatus::Success).contains(&"I > J > K".to_string()));
}

// ============================================================================
// Start path, cancellation, fatal startup
// ============================================================================

#[tokio::test]
async fn test_start_path_confines_walk_to_subtree() {
    let dir = TempDir::new().unwrap();
    let portal = ScriptedPortal::new(sample_menu(), dir.path().join("downloads"));
    let mut walker = walker_for(&portal, &dir, 2);
    let start = CategoryPath::parse_key("I > J").unwrap();

    let records = run(&mut walker, Some(&start)).await;

    assert_eq!(
        keys_with(&records, VisitStatus::Success),
        vec!["I > J > K", "I > J > L"]
    );
}

#[tokio::test]
async fn test_start_path_at_a_leaf() {
    let dir = TempDir::new().unwrap();
    let portal = ScriptedPortal::new(sample_menu(), dir.path().join("downloads"));
    let mut walker = walker_for(&portal, &dir, 2);
    let start = CategoryPath::parse_key("A > B > D").unwrap();

    let records = run(&mut walker, Some(&start)).await;

    assert_eq!(records.len(), 1);
    assert_eq!(records[0].key(), "A > B > D");
}

#[tokio::test]
async fn test_unknown_start_path_is_fatal() {
    let dir = TempDir::new().unwrap();
    let portal = ScriptedPortal::new(sample_menu(), dir.path().join("downloads"));
    let mut walker = walker_for(&portal, &dir, 2);
    let start = CategoryPath::parse_key("A > Nope").unwrap();

    let error = walker.start(Some(&start)).await.unwrap_err();
    assert!(matches!(error, ScanError::PathNotFound(_)));
    assert!(error.is_fatal());
}

#[tokio::test]
async fn test_unreachable_root_is_fatal() {
    let dir = TempDir::new().unwrap();
    let portal = ScriptedPortal::new(sample_menu(), dir.path().join("downloads"));
    portal.fail_open_root();
    let mut walker = walker_for(&portal, &dir, 2);

    let error = walker.start(None).await.unwrap_err();
    assert!(matches!(error, ScanError::RootUnreachable(_)));
    assert!(walker.next_visit().await.is_none());
}

#[tokio::test]
async fn test_cancel_between_leaves() {
    let dir = TempDir::new().unwrap();
    let portal = ScriptedPortal::new(sample_menu(), dir.path().join("downloads"));
    let mut walker = walker_for(&portal, &dir, 2);
    let cancel = walker.cancel_flag();
    walker.start(None).await.unwrap();

    let first = walker.next_visit().await.unwrap();
    assert_eq!(first.key(), "A > B > C");
    cancel.store(true, Ordering::SeqCst);

    assert!(walker.next_visit().await.is_none());
    assert!(walker.is_cancelled());
    assert_eq!(portal.downloads(), vec!["A > B > C"]);
}

#[tokio::test]
async fn test_progress_callback_sees_each_leaf_once() {
    let dir = TempDir::new().unwrap();
    let menu = sample_menu();
    let portal = ScriptedPortal::new(menu.clone(), dir.path().join("downloads"));
    portal.kill_after(Operation::AwaitDownload, 1);
    let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    let mut walker = walker_for(&portal, &dir, 2).with_progress_callback(Arc::new(
        move |count: usize, path: &CategoryPath| {
            sink.lock().unwrap().push((count, path.key()));
        },
    ));

    run(&mut walker, None).await;

    let seen = seen.lock().unwrap();
    let keys: Vec<String> = seen.iter().map(|(_, k)| k.clone()).collect();
    assert_eq!(keys, leaf_keys(&menu));
    assert_eq!(seen.last().unwrap().0, leaf_keys(&menu).len());
}
