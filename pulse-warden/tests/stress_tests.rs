//! Stress tests with 1000+ concurrent units of work
//!
//! Admission, sweeps and delegation run together; the checks are about
//! bookkeeping staying consistent, not about timing.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use pulse_warden::context::{self, Frame};
use pulse_warden::registry::WorkRegistry;
use pulse_warden::work::{Work, WorkKind};
use pulse_warden::zombie::ZombieConfig;
use pulse_warden::{FloodConfig, Warden, WardenConfig};

fn stress_warden() -> Arc<Warden> {
    let config = WardenConfig {
        flood: FloodConfig {
            max_resources: 200,
            ..FloodConfig::default()
        },
        zombie: ZombieConfig {
            period_ms: 5,
            watch_ms: 1,
            thread_name: "stress-zombies".to_string(),
        },
        ..WardenConfig::default()
    };
    Arc::new(Warden::from_config(config).unwrap())
}

#[test]
fn test_thousand_requests_across_threads() {
    let warden = stress_warden();
    warden.start().unwrap();

    let admitted = Arc::new(AtomicU64::new(0));
    let rejected = Arc::new(AtomicU64::new(0));
    let start = Instant::now();

    let handles: Vec<_> = (0..8)
        .map(|worker| {
            let warden = Arc::clone(&warden);
            let admitted = Arc::clone(&admitted);
            let rejected = Arc::clone(&rejected);
            thread::spawn(move || {
                for i in 0..125 {
                    context::sync_scope(Frame::new(), || {
                        let work = Work::builder(format!("{worker}-{i}"))
                            .kind(WorkKind::Request)
                            .session(format!("s{}", i % 10))
                            .user(format!("u{}", i % 5))
                            .build();
                        let _ticket = warden.registry().create(work.clone());

                        if warden.sensor().may_proceed(Some(&work)).is_admitted() {
                            warden.metrics().record_admitted();
                            admitted.fetch_add(1, Ordering::Relaxed);
                            // Well-behaved work passes its checkpoints
                            assert!(pulse_warden::kill_runaway().is_ok() || work.is_killed());
                        } else {
                            rejected.fetch_add(1, Ordering::Relaxed);
                        }
                    });
                }
            })
        })
        .collect();

    for handle in handles {
        handle.join().unwrap();
    }
    warden.close();

    let admitted = admitted.load(Ordering::Relaxed);
    let rejected = rejected.load(Ordering::Relaxed);
    let snapshot = warden.metrics().snapshot();

    assert_eq!(admitted + rejected, 1000);
    assert_eq!(snapshot.admitted, admitted);
    assert_eq!(snapshot.rejected, rejected);
    assert!(warden.registry().is_empty());
    assert!(start.elapsed() < Duration::from_secs(30));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_thousand_delegated_tasks() {
    let warden = stress_warden();
    let completions = Arc::new(AtomicU64::new(0));

    let root = Work::builder("root").kind(WorkKind::Request).build();
    let handles = context::scope(Frame::new(), {
        let warden = Arc::clone(&warden);
        let completions = Arc::clone(&completions);
        async move {
            let _ticket = warden.registry().create(root);
            (0..1000)
                .map(|i| {
                    let completions = Arc::clone(&completions);
                    warden.decorator().spawn(format!("part-{i}"), async move {
                        tokio::task::yield_now().await;
                        completions.fetch_add(1, Ordering::Relaxed);
                        context::field("root_request_id")
                    })
                })
                .collect::<Vec<_>>()
        }
    })
    .await;

    for handle in handles {
        assert_eq!(handle.await.unwrap().as_deref(), Some("root"));
    }

    let snapshot = warden.metrics().snapshot();
    assert_eq!(completions.load(Ordering::Relaxed), 1000);
    assert_eq!(snapshot.tasks_started, 1000);
    assert_eq!(snapshot.tasks_finished, 1000);
    assert!(warden.registry().is_empty());
}

#[test]
fn test_scans_during_churn() {
    let warden = stress_warden();
    let stop = Arc::new(std::sync::atomic::AtomicBool::new(false));

    let churn: Vec<_> = (0..4)
        .map(|t| {
            let warden = Arc::clone(&warden);
            let stop = Arc::clone(&stop);
            thread::spawn(move || {
                let mut i = 0u64;
                while !stop.load(Ordering::Relaxed) {
                    let work = Work::builder(format!("{t}-{i}")).max_time(Duration::from_millis(1)).build();
                    let _ticket = warden.registry().create(work);
                    i += 1;
                }
            })
        })
        .collect();

    for _ in 0..200 {
        let report = warden.detector().scan();
        assert!(report.kills + report.kill_failures <= report.zombies);
    }
    stop.store(true, Ordering::Relaxed);
    for handle in churn {
        handle.join().unwrap();
    }

    assert!(warden.registry().is_empty());
    assert_eq!(warden.metrics().snapshot().scans, 200);
}
