use crate::{sync::FeedProgress, types::DataKind};

#[test]
fn test_uninitialized_until_reset() {
    let progress = FeedProgress::new(DataKind::Bodies);
    assert!(!progress.is_initialized());
    assert_eq!(progress.snapshot().percent(), None);

    progress.reset(30, 100);
    let snapshot = progress.snapshot();
    assert!(snapshot.is_initialized());
    assert_eq!(snapshot.start, 30);
    assert_eq!(snapshot.total, Some(70));
    assert_eq!(snapshot.done, 0);
}

#[test]
fn test_done_never_exceeds_total() {
    let progress = FeedProgress::new(DataKind::Headers);
    progress.reset(0, 10);
    progress.add_done(7);
    progress.add_done(7);
    assert_eq!(progress.snapshot().done, 10);
    assert_eq!(progress.snapshot().percent(), Some(100.0));
}

#[test]
fn test_queued_counter() {
    let progress = FeedProgress::new(DataKind::Receipts);
    progress.reset(0, 100);
    progress.add_queued(32);
    progress.remove_queued(16);
    assert_eq!(progress.snapshot().queued, 16);

    progress.remove_queued(100);
    assert_eq!(progress.snapshot().queued, 0);
}

#[test]
fn test_mark_end_completes_range() {
    let progress = FeedProgress::new(DataKind::Headers);
    progress.reset(0, 100);
    progress.add_done(40);
    progress.add_queued(16);
    progress.mark_end();

    let snapshot = progress.snapshot();
    assert!(snapshot.ended);
    assert_eq!(snapshot.done, 100);
    assert_eq!(snapshot.queued, 0);
}

#[test]
fn test_reset_starts_new_generation() {
    let progress = FeedProgress::new(DataKind::Blocks);
    progress.reset(0, 10);
    progress.add_done(5);
    let first = progress.snapshot().generation;

    progress.reset(10, 20);
    let snapshot = progress.snapshot();
    assert_ne!(snapshot.generation, first);
    assert_eq!(snapshot.done, 0);
    assert!(!snapshot.ended);
}

#[test]
fn test_discovered_items_grow_total() {
    let progress = FeedProgress::new(DataKind::StateNodes);
    progress.reset(0, 1);
    progress.add_done(1);
    progress.add_total(4);
    let snapshot = progress.snapshot();
    assert_eq!(snapshot.total, Some(5));
    assert_eq!(snapshot.percent(), Some(20.0));
}
