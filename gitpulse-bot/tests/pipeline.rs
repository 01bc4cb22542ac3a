//! Poll pipeline tests: fetch → filter → format → dispatch → commit.
//!
//! Tests cover:
//! - First poll of a repository, then a repeat poll with the same feed
//! - Oldest-first ordering and one line per push commit
//! - Seen-set cap and the time window
//! - Fan-out to several channels, per-source isolation
//! - Rate limiting and fetch failures
//! - Overlapping polls of one source
//! - Running with a store that cannot persist anything

mod common;

use std::sync::Arc;
use std::time::Duration;

use gitpulse_bot::error::FetchError;
use gitpulse_bot::fetcher::RateStatus;
use tokio::sync::watch;

use common::*;

fn not_shutdown() -> watch::Receiver<bool> {
    watch::channel(false).1
}

#[tokio::test]
async fn first_poll_announces_in_window_events_oldest_first() {
    let h = harness();
    let repo = src("octo/repo");
    let chan = dest("#dev");
    h.poller.subscriptions().subscribe(&chan, &repo);

    // GitHub lists newest first
    h.fetcher.set_events(
        &repo,
        feed(
            &repo,
            vec![
                issue("3", 1, "Crash on start"),
                push("2", 2, "bbb", "Second change"),
                push("1", 3, "aaa", "First change"),
            ],
        ),
    );

    let report = h.poller.poll_source(&repo, &[chan.clone()]).await.unwrap();
    assert_eq!(report.new_events, 3);
    assert_eq!(report.lines, 3);

    let lines = h.dispatcher.lines_for(&chan);
    assert_eq!(lines.len(), 3);
    assert!(lines[0].contains("First change"), "{lines:?}");
    assert!(lines[1].contains("Second change"), "{lines:?}");
    assert!(lines[2].contains("issue opened: Crash on start"), "{lines:?}");
    assert_eq!(h.poller.seen().ids(&repo), vec!["1", "2", "3"]);
}

#[tokio::test]
async fn repeat_poll_announces_nothing() {
    let h = harness();
    let repo = src("octo/repo");
    let chan = dest("#dev");
    h.fetcher.set_events(
        &repo,
        feed(&repo, vec![issue("3", 1, "Bug"), push("2", 2, "bbb", "Change")]),
    );

    h.poller.poll_source(&repo, &[chan.clone()]).await.unwrap();
    h.dispatcher.clear();

    let report = h.poller.poll_source(&repo, &[chan.clone()]).await.unwrap();
    assert_eq!(report.new_events, 0);
    assert!(h.dispatcher.lines().is_empty());
}

#[tokio::test]
async fn only_newly_appeared_events_are_announced() {
    let h = harness();
    let repo = src("octo/repo");
    let chan = dest("#dev");

    h.fetcher.set_events(&repo, feed(&repo, vec![issue("1", 5, "Old")]));
    h.poller.poll_source(&repo, &[chan.clone()]).await.unwrap();
    h.dispatcher.clear();

    h.fetcher.set_events(
        &repo,
        feed(&repo, vec![issue("2", 1, "New"), issue("1", 5, "Old")]),
    );
    h.poller.poll_source(&repo, &[chan.clone()]).await.unwrap();
    let lines = h.dispatcher.lines();
    assert_eq!(lines.len(), 1);
    assert!(lines[0].contains("New"));
}

#[tokio::test]
async fn seen_set_keeps_only_the_newest_ids() {
    let h = harness_with(Arc::new(gitpulse_bot::store::SqliteStore::in_memory().unwrap()), 2, 10);
    let repo = src("octo/repo");
    h.fetcher.set_events(
        &repo,
        feed(&repo, vec![star("c", 1), star("b", 2), star("a", 3)]),
    );

    h.poller.poll_source(&repo, &[dest("#dev")]).await.unwrap();
    assert_eq!(h.poller.seen().ids(&repo), vec!["b", "c"]);
}

#[tokio::test]
async fn feed_larger_than_cap_is_not_reannounced() {
    let h = harness_with(Arc::new(gitpulse_bot::store::SqliteStore::in_memory().unwrap()), 2, 10);
    let repo = src("octo/repo");
    let chan = dest("#dev");
    let events = feed(&repo, vec![issue("c", 1, "C"), issue("b", 2, "B"), issue("a", 3, "A")]);

    h.fetcher.set_events(&repo, events.clone());
    h.poller.poll_source(&repo, &[chan.clone()]).await.unwrap();
    let first = h.dispatcher.lines();
    assert_eq!(first.len(), 2);
    assert!(first[0].contains(": B "), "{first:?}");
    assert!(first[1].contains(": C "), "{first:?}");

    for _ in 0..3 {
        h.dispatcher.clear();
        h.fetcher.set_events(&repo, events.clone());
        let report = h.poller.poll_source(&repo, &[chan.clone()]).await.unwrap();
        assert_eq!(report.new_events, 0);
        assert!(h.dispatcher.lines().is_empty());
    }
}

#[tokio::test]
async fn events_outside_window_are_never_announced() {
    let h = harness();
    let repo = src("octo/repo");
    h.fetcher.set_events(
        &repo,
        feed(&repo, vec![issue("2", 10, "Recent"), issue("1", 3 * 60, "Ancient")]),
    );

    let report = h.poller.poll_source(&repo, &[dest("#dev")]).await.unwrap();
    assert_eq!(report.new_events, 1);
    let lines = h.dispatcher.lines();
    assert_eq!(lines.len(), 1);
    assert!(lines[0].contains("Recent"));
}

#[tokio::test]
async fn unknown_kinds_are_committed_but_silent() {
    let h = harness();
    let repo = src("octo/repo");
    h.fetcher.set_events(
        &repo,
        feed(
            &repo,
            vec![wire_event("9", "GollumEvent", 1, serde_json::json!({"pages": []}))],
        ),
    );

    let report = h.poller.poll_source(&repo, &[dest("#dev")]).await.unwrap();
    assert_eq!(report.new_events, 1);
    assert_eq!(report.lines, 0);
    assert!(h.dispatcher.lines().is_empty());
    assert_eq!(h.poller.seen().ids(&repo), vec!["9"]);
}

#[tokio::test]
async fn every_follower_gets_the_same_lines() {
    let h = harness();
    let repo = src("octo/repo");
    let (a, b) = (dest("#a"), dest("#b"));
    h.poller.subscriptions().subscribe(&a, &repo);
    h.poller.subscriptions().subscribe(&b, &repo);
    h.fetcher.set_events(&repo, feed(&repo, vec![issue("1", 1, "Shared")]));

    let report = h.poller.poll_cycle(&not_shutdown()).await;
    assert_eq!(report.attempted, 1);
    assert_eq!(h.fetcher.call_count(), 1);
    assert_eq!(h.dispatcher.lines_for(&a).len(), 1);
    assert_eq!(h.dispatcher.lines_for(&a), h.dispatcher.lines_for(&b));
}

#[tokio::test]
async fn validator_is_passed_back_on_next_fetch() {
    let h = harness();
    let repo = src("octo/repo");
    h.fetcher.set(
        &repo,
        Reply::Events {
            events: feed(&repo, vec![star("1", 1)]),
            validator: Some("\"v1\"".into()),
            rate: None,
        },
    );
    h.poller.poll_source(&repo, &[]).await.unwrap();

    h.fetcher.set(&repo, Reply::NotModified);
    let report = h.poller.poll_source(&repo, &[]).await.unwrap();
    assert_eq!(report.new_events, 0);

    let calls = h.fetcher.calls();
    assert_eq!(calls[0].1, None);
    assert_eq!(calls[1].1.as_deref(), Some("\"v1\""));
    assert_eq!(h.poller.seen().validator(&repo).as_deref(), Some("\"v1\""));
}

#[tokio::test]
async fn rate_limit_skips_rest_of_cycle_and_retries_next_time() {
    let h = harness();
    let (first, second) = (src("octo/first"), src("octo/second"));
    let chan = dest("#dev");
    h.poller.subscriptions().subscribe(&chan, &first);
    h.poller.subscriptions().subscribe(&chan, &second);

    h.fetcher.set(&first, Reply::RateLimited);
    h.fetcher.set_events(&second, feed(&second, vec![issue("1", 1, "Waiting")]));

    let report = h.poller.poll_cycle(&not_shutdown()).await;
    assert!(report.rate_limited);
    assert_eq!(report.attempted, 1);
    assert_eq!(report.skipped, 1);
    assert!(h.dispatcher.lines().is_empty());
    assert_eq!(h.fetcher.call_count(), 1);

    h.fetcher.set_events(&first, Vec::new());
    let report = h.poller.poll_cycle(&not_shutdown()).await;
    assert!(!report.rate_limited);
    assert_eq!(report.attempted, 2);
    assert_eq!(h.dispatcher.lines().len(), 1);
}

#[tokio::test]
async fn low_quota_stops_the_cycle_after_the_current_source() {
    let h = harness();
    let (first, second) = (src("octo/first"), src("octo/second"));
    let chan = dest("#dev");
    h.poller.subscriptions().subscribe(&chan, &first);
    h.poller.subscriptions().subscribe(&chan, &second);

    h.fetcher.set(
        &first,
        Reply::Events {
            events: feed(&first, vec![issue("1", 1, "Still announced")]),
            validator: None,
            rate: Some(RateStatus {
                remaining: 3,
                reset_at: None,
            }),
        },
    );
    h.fetcher.set_events(&second, Vec::new());

    let report = h.poller.poll_cycle(&not_shutdown()).await;
    assert!(report.rate_limited);
    assert_eq!(report.skipped, 1);
    assert_eq!(h.dispatcher.lines().len(), 1);
}

#[tokio::test]
async fn failing_source_does_not_block_others() {
    let h = harness();
    let (broken, fine) = (src("octo/broken"), src("octo/fine"));
    let chan = dest("#dev");
    h.poller.subscriptions().subscribe(&chan, &broken);
    h.poller.subscriptions().subscribe(&chan, &fine);
    h.fetcher.set(&broken, Reply::Transient);
    h.fetcher.set_events(&fine, feed(&fine, vec![issue("1", 1, "Works")]));

    let report = h.poller.poll_cycle(&not_shutdown()).await;
    assert_eq!(report.failed, 1);
    assert_eq!(report.attempted, 2);
    assert_eq!(h.dispatcher.lines().len(), 1);
    assert!(h.poller.seen().ids(&broken).is_empty());
}

#[tokio::test]
async fn cancelled_cycle_fetches_nothing() {
    let h = harness();
    h.poller.subscriptions().subscribe(&dest("#dev"), &src("octo/repo"));
    let (tx, rx) = watch::channel(true);

    let report = h.poller.poll_cycle(&rx).await;
    drop(tx);
    assert!(report.cancelled);
    assert_eq!(h.fetcher.call_count(), 0);
}

#[tokio::test]
async fn manual_fetch_reports_each_source() {
    let h = harness();
    let chan = dest("#dev");
    let (ok, missing) = (src("octo/ok"), src("octo/missing"));
    h.poller.subscriptions().subscribe(&chan, &ok);
    h.poller.subscriptions().subscribe(&chan, &missing);
    h.fetcher.set_events(&ok, feed(&ok, vec![star("1", 1)]));
    h.fetcher.set(&missing, Reply::NotFound);

    let results = h.poller.poll_destination(&chan).await;
    assert_eq!(results.len(), 2);
    assert_eq!(results[0].0, ok);
    assert!(results[0].1.is_ok());
    assert!(matches!(results[1].1, Err(FetchError::NotFound)));
    assert_eq!(h.dispatcher.lines_for(&chan).len(), 1);
}

#[tokio::test]
async fn overlapping_polls_announce_once() {
    let h = harness();
    let repo = src("octo/repo");
    let chan = dest("#dev");
    h.fetcher.set_delay(Duration::from_millis(50));
    h.fetcher.set_events(
        &repo,
        feed(&repo, vec![issue("2", 1, "Two"), issue("1", 2, "One")]),
    );

    let dests = [chan.clone()];
    let (a, b) = tokio::join!(
        h.poller.poll_source(&repo, &dests),
        h.poller.poll_source(&repo, &dests),
    );
    let total = a.unwrap().new_events + b.unwrap().new_events;
    assert_eq!(total, 2);
    assert_eq!(h.dispatcher.lines_for(&chan).len(), 2);
}

#[tokio::test]
async fn broken_store_degrades_to_memory() {
    let h = harness_with(Arc::new(BrokenStore), 50, 10);
    let repo = src("octo/repo");
    let chan = dest("#dev");
    h.poller.subscriptions().subscribe(&chan, &repo);
    assert_eq!(h.poller.subscriptions().sources_for(&chan), vec![repo.clone()]);

    h.fetcher.set_events(&repo, feed(&repo, vec![issue("1", 1, "Once")]));
    h.poller.poll_cycle(&not_shutdown()).await;
    h.poller.poll_cycle(&not_shutdown()).await;
    assert_eq!(h.dispatcher.lines().len(), 1);
}

#[tokio::test]
async fn last_unsubscribe_releases_source_state() {
    let h = harness();
    let repo = src("octo/repo");
    let (a, b) = (dest("#a"), dest("#b"));
    h.poller.subscriptions().subscribe(&a, &repo);
    h.poller.subscriptions().subscribe(&b, &repo);
    h.fetcher.set_events(&repo, feed(&repo, vec![star("1", 1)]));
    h.poller.poll_followed(&repo).await.unwrap();
    assert_eq!(h.poller.tracked_sources(), 1);
    assert_eq!(h.poller.seen().cached(), 1);

    h.poller.unsubscribe(&a, &repo);
    assert_eq!(h.poller.tracked_sources(), 1);

    h.poller.unsubscribe(&b, &repo);
    assert_eq!(h.poller.tracked_sources(), 0);
    assert_eq!(h.poller.seen().cached(), 0);

    // History comes back from the store on resubscribe
    h.dispatcher.clear();
    h.poller.subscriptions().subscribe(&a, &repo);
    h.poller.poll_followed(&repo).await.unwrap();
    assert!(h.dispatcher.lines().is_empty());
}
