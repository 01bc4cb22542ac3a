//! Channel commands end to end against fake fetch/dispatch.

mod common;

use std::time::Duration;

use gitpulse_bot::commands::{BotCommand, execute, follow_up, parse};
use gitpulse_bot::scheduler::Scheduler;

use common::*;

/// Scheduler whose first cycle is far away, so only the test polls.
fn idle_scheduler(h: &Harness, interval_secs: u64) -> (Scheduler, tokio::task::JoinHandle<()>) {
    Scheduler::spawn_after(
        h.poller.clone(),
        Duration::from_secs(interval_secs),
        Duration::from_secs(3600),
    )
}

#[tokio::test]
async fn subscribe_list_unsubscribe() {
    let h = harness();
    let (scheduler, task) = idle_scheduler(&h, 3600);
    let chan = dest("#dev");

    let out = execute(parse("!subscribe Octo/Repo", "!").unwrap(), &chan, "!", &h.poller, &scheduler).await;
    assert_eq!(out.replies, vec!["Subscribed to octo/repo in channel #dev."]);
    assert_eq!(out.poll, Some(src("octo/repo")));

    let out = execute(BotCommand::Subscribe("octo/repo".into()), &chan, "!", &h.poller, &scheduler).await;
    assert_eq!(out.replies, vec!["Already subscribed to octo/repo in channel #dev."]);
    assert_eq!(out.poll, None);

    let out = execute(BotCommand::List, &chan, "!", &h.poller, &scheduler).await;
    assert_eq!(
        out.replies,
        vec!["Subscribed to the following repositories in #dev: octo/repo"]
    );

    let out = execute(BotCommand::Unsubscribe("octo/repo".into()), &chan, "!", &h.poller, &scheduler).await;
    assert_eq!(out.replies, vec!["Unsubscribed from octo/repo in channel #dev."]);
    let out = execute(BotCommand::Unsubscribe("octo/repo".into()), &chan, "!", &h.poller, &scheduler).await;
    assert_eq!(out.replies, vec!["Not subscribed to octo/repo in channel #dev."]);

    let out = execute(BotCommand::List, &chan, "!", &h.poller, &scheduler).await;
    assert_eq!(out.replies, vec!["No repositories subscribed to in #dev."]);

    scheduler.shutdown();
    task.await.unwrap();
}

#[tokio::test]
async fn bad_repository_gets_usage() {
    let h = harness();
    let (scheduler, task) = idle_scheduler(&h, 3600);

    let out = execute(BotCommand::Subscribe("not-a-repo".into()), &dest("#dev"), "!", &h.poller, &scheduler).await;
    assert_eq!(out.replies, vec!["Usage: !subscribe owner/repo"]);
    assert!(h.poller.subscriptions().destinations().is_empty());

    scheduler.shutdown();
    task.await.unwrap();
}

#[tokio::test]
async fn follow_up_announces_to_all_followers() {
    let h = harness();
    let repo = src("octo/repo");
    h.poller.subscriptions().subscribe(&dest("#a"), &repo);
    h.poller.subscriptions().subscribe(&dest("#b"), &repo);
    h.fetcher.set_events(&repo, feed(&repo, vec![star("1", 1)]));

    assert_eq!(follow_up(&h.poller, &repo).await, None);
    assert_eq!(h.dispatcher.lines_for(&dest("#a")).len(), 1);
    assert_eq!(h.dispatcher.lines_for(&dest("#b")).len(), 1);

    h.fetcher.set(&repo, Reply::NotFound);
    assert_eq!(
        follow_up(&h.poller, &repo).await.as_deref(),
        Some("Could not fetch octo/repo (not found)")
    );
}

#[tokio::test]
async fn fetch_reports_one_error_line() {
    let h = harness();
    let (scheduler, task) = idle_scheduler(&h, 3600);
    let chan = dest("#dev");

    let out = execute(BotCommand::Fetch, &chan, "!", &h.poller, &scheduler).await;
    assert_eq!(out.replies, vec!["No repositories subscribed to in #dev."]);

    let (ok, down) = (src("octo/ok"), src("octo/down"));
    h.poller.subscriptions().subscribe(&chan, &ok);
    h.poller.subscriptions().subscribe(&chan, &down);
    h.fetcher.set_events(&ok, Vec::new());
    h.fetcher.set(&down, Reply::Transient);

    let out = execute(BotCommand::Fetch, &chan, "!", &h.poller, &scheduler).await;
    assert_eq!(out.replies, vec!["Could not fetch octo/down (temporary failure)"]);

    h.fetcher.set_events(&down, Vec::new());
    let out = execute(BotCommand::Fetch, &chan, "!", &h.poller, &scheduler).await;
    assert_eq!(out.replies, vec!["No new activity for #dev."]);

    h.fetcher.set_events(&down, feed(&down, vec![star("9", 1)]));
    let out = execute(BotCommand::Fetch, &chan, "!", &h.poller, &scheduler).await;
    assert!(out.replies.is_empty());
    assert_eq!(h.dispatcher.lines_for(&chan).len(), 1);

    scheduler.shutdown();
    task.await.unwrap();
}

#[tokio::test]
async fn interval_show_and_set() {
    let h = harness();
    let (scheduler, task) = idle_scheduler(&h, 300);
    let chan = dest("#dev");

    let out = execute(BotCommand::Interval(Some("60".into())), &chan, "!", &h.poller, &scheduler).await;
    assert_eq!(out.replies, vec!["Poll interval set to 60s."]);
    assert_eq!(scheduler.interval(), Duration::from_secs(60));

    for bad in ["0", "-5", "soon"] {
        let out = execute(BotCommand::Interval(Some(bad.into())), &chan, "!", &h.poller, &scheduler).await;
        assert_eq!(out.replies, vec!["Interval must be a positive number of seconds."]);
    }
    assert_eq!(scheduler.interval(), Duration::from_secs(60));

    let out = execute(BotCommand::Interval(None), &chan, "!", &h.poller, &scheduler).await;
    assert!(out.replies[0].starts_with("Polling every 60s"), "{:?}", out.replies);

    let out = execute(BotCommand::Help, &chan, "!", &h.poller, &scheduler).await;
    assert!(out.replies.iter().any(|l| l.starts_with("!subscribe")));

    scheduler.shutdown();
    task.await.unwrap();
}
