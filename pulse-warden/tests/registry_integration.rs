//     ______   __  __     __         ______     ______
//    /\  == \ /\ \/\ \   /\ \       /\  ___\   /\  ___\
//    \ \  _-/ \ \ \_\ \  \ \ \____  \ \___  \  \ \  __\
//     \ \_\    \ \_____\  \ \_____\  \/\_____\  \ \_____\
//      \/_/     \/_____/   \/_____/   \/_____/   \/_____/
//
// Author: Colin MacRitchie / Ripple Group
// Registry lifecycle across threads and tasks
use std::thread;

use pulse_warden::context::{self, Frame};
use pulse_warden::registry::{Outstanding, WorkRegistry};
use pulse_warden::work::{Work, WorkKind};

fn ids(registry: &impl WorkRegistry) -> Vec<String> {
    registry.stream().map(|w| w.id().to_string()).collect()
}

#[test]
fn test_nested_tickets_restore_outer_work() {
    let registry = Outstanding::new();
    context::sync_scope(Frame::new(), || {
        let _outer = registry.create(Work::builder("outer").build());
        {
            let _inner = registry.create(Work::builder("inner").build());
            assert_eq!(registry.current().unwrap().id(), "inner");
            assert_eq!(ids(&registry), vec!["outer", "inner"]);
        }
        assert_eq!(registry.current().unwrap().id(), "outer");
    });
    assert!(registry.is_empty());
}

#[test]
fn test_current_is_per_thread() {
    let registry = Outstanding::new();
    let _main = registry.create(Work::builder("main").build());

    let other = registry.clone();
    let seen = thread::spawn(move || {
        let before = other.current().map(|w| w.id().to_string());
        let _t = other.create(Work::builder("worker").build());
        (before, other.current().map(|w| w.id().to_string()), other.len())
    })
    .join()
    .unwrap();

    assert_eq!(seen, (None, Some("worker".to_string()), 2));
    assert_eq!(registry.current().unwrap().id(), "main");
    assert_eq!(registry.len(), 1);
}

#[test]
fn test_ticket_closed_on_other_thread_restores_its_frame() {
    let registry = Outstanding::new();
    context::sync_scope(Frame::new(), || {
        let ticket = registry.create(Work::builder("moved").build());
        thread::spawn(move || drop(ticket)).join().unwrap();
        assert!(registry.current().is_none());
        assert!(registry.is_empty());
    });
}

#[test]
fn test_registries_share_frame_without_interference() {
    let requests = Outstanding::new();
    let jobs = Outstanding::new();

    context::sync_scope(Frame::new(), || {
        let _r = requests.create(Work::builder("req").build());
        let _j = jobs.create(Work::builder("job").build());

        assert_eq!(requests.current().unwrap().id(), "req");
        assert_eq!(jobs.current().unwrap().id(), "job");
        assert_eq!(context::innermost().unwrap().id(), "job");
        assert_eq!(ids(&requests), vec!["req"]);
    });
}

#[test]
fn test_filtered_view_delegates_registration() {
    let base = Outstanding::new();
    let tasks = base.filtered(WorkKind::Task);

    context::sync_scope(Frame::new(), || {
        let _req = base.create(Work::builder("req").kind(WorkKind::Request).build());
        let _task = tasks.create(Work::builder("task").kind(WorkKind::Task).build());

        assert_eq!(ids(&tasks), vec!["task"]);
        assert_eq!(ids(&base), vec!["req", "task"]);
        assert_eq!(tasks.current().unwrap().id(), "task");
        assert_eq!(tasks.len(), 1);
    });
}

#[test]
fn test_put_in_context_reaches_work_and_frame() {
    let registry = Outstanding::new();
    context::sync_scope(Frame::new(), || {
        let work = Work::builder("w").build();
        let _t = registry.create(work.clone());

        let value = registry.put_in_context("order_id", "o-9".to_string()).unwrap();
        assert_eq!(value, "o-9");
        assert_eq!(work.get("order_id").as_deref(), Some("o-9"));
        assert_eq!(context::field("order_id").as_deref(), Some("o-9"));

        assert!(registry.put_in_context("OrderId", "x".to_string()).is_err());
        assert!(registry.put_in_context("", "x".to_string()).is_err());
        assert_eq!(work.get("OrderId"), None);
    });
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_task_scoped_current_survives_migration() {
    let registry = Outstanding::new();
    let mut handles = Vec::new();

    for i in 0..32 {
        let registry = registry.clone();
        handles.push(tokio::spawn(context::scope(Frame::new(), async move {
            let id = format!("req-{i}");
            let _t = registry.create(Work::builder(id.clone()).build());
            for _ in 0..10 {
                tokio::task::yield_now().await;
                assert_eq!(registry.current().unwrap().id(), id);
            }
        })));
    }

    for handle in handles {
        handle.await.unwrap();
    }
    assert!(registry.is_empty());
}

#[test]
fn test_stream_tolerates_concurrent_mutation() {
    let registry = Outstanding::new();
    let writers: Vec<_> = (0..4)
        .map(|t| {
            let registry = registry.clone();
            thread::spawn(move || {
                for i in 0..500 {
                    let _ticket = registry.create(Work::builder(format!("{t}-{i}")).build());
                }
            })
        })
        .collect();

    for _ in 0..50 {
        for work in registry.stream() {
            assert!(work.id().contains('-'));
        }
    }

    for writer in writers {
        writer.join().unwrap();
    }
    assert!(registry.is_empty());
}
