//     ______   __  __     __         ______     ______
//    /\  == \ /\ \/\ \   /\ \       /\  ___\   /\  ___\
//    \ \  _-/ \ \ \_\ \  \ \ \____  \ \___  \  \ \  __\
//     \ \_\    \ \_____\  \ \_____\  \/\_____\  \ \_____\
//      \/_/     \/_____/   \/_____/   \/_____/   \/_____/
//
// Author: Colin MacRitchie / Ripple Group
// Delegated work across threads, tasks and the checkpoint macro
use std::sync::Arc;

use pulse_warden::context::{self, Frame};
use pulse_warden::ids::SequentialIds;
use pulse_warden::propagate::Decorator;
use pulse_warden::registry::{Outstanding, WorkRegistry};
use pulse_warden::work::{Work, WorkKind};
use pulse_warden::ZombieAbort;
use pulse_warden_macros::checkpoint;

#[checkpoint]
fn sum_rows(rows: &[u64]) -> Result<u64, ZombieAbort> {
    let mut total = 0;
    for row in rows {
        total += row;
    }
    Ok(total)
}

#[checkpoint(check_interval = 4)]
async fn drain(rx: &mut tokio::sync::mpsc::Receiver<u32>) -> Result<u32, ZombieAbort> {
    let mut seen = 0;
    while let Some(_item) = rx.recv().await {
        seen += 1;
    }
    Ok(seen)
}

#[test]
fn test_checkpoint_passes_for_healthy_work() {
    let registry = Outstanding::new();
    context::sync_scope(Frame::new(), || {
        let _t = registry.create(Work::builder("req").build());
        assert_eq!(sum_rows(&[1, 2, 3]), Ok(6));
    });
}

#[test]
fn test_checkpoint_aborts_killed_work() {
    let registry = Outstanding::new();
    context::sync_scope(Frame::new(), || {
        let work = Work::builder("req").build();
        let _t = registry.create(work.clone());
        work.interrupt().unwrap();

        let abort = sum_rows(&[1, 2, 3]).unwrap_err();
        assert_eq!(abort.id, "req");
    });
}

#[tokio::test]
async fn test_async_checkpoint() {
    let (tx, mut rx) = tokio::sync::mpsc::channel(16);
    for i in 0..10 {
        tx.send(i).await.unwrap();
    }
    drop(tx);
    assert_eq!(drain(&mut rx).await, Ok(10));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_fan_out_keeps_root_id() {
    let registry = Outstanding::new();
    let decorator = Decorator::new()
        .registering(registry.filtered(WorkKind::Task))
        .with_ids(Arc::new(SequentialIds::new("child")));

    let root = Work::builder("root-1").kind(WorkKind::Request).build();
    let handles = context::scope(Frame::new(), {
        let registry = registry.clone();
        let decorator = decorator.clone();
        async move {
            let _ticket = registry.create(root);
            (0..8)
                .map(|i| {
                    decorator.spawn(format!("part-{i}"), async {
                        tokio::task::yield_now().await;
                        context::field("root_request_id")
                    })
                })
                .collect::<Vec<_>>()
        }
    })
    .await;

    for handle in handles {
        assert_eq!(handle.await.unwrap().as_deref(), Some("root-1"));
    }
    assert!(registry.is_empty());
}

#[test]
fn test_blocking_pool_child_is_registered() {
    let runtime = tokio::runtime::Builder::new_multi_thread().worker_threads(1).build().unwrap();
    let registry = Outstanding::new();
    let decorator = Decorator::new().registering(registry.clone());

    let probe = registry.clone();
    let seen = runtime.block_on(async move {
        decorator
            .spawn_blocking("export", move || probe.current().map(|w| (w.kind(), w.name().map(str::to_string))))
            .await
            .unwrap()
    });

    assert_eq!(seen, Some((WorkKind::Task, Some("export".to_string()))));
    assert!(registry.is_empty());
}
