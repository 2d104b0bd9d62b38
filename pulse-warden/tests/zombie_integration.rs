//     ______   __  __     __         ______     ______
//    /\  == \ /\ \/\ \   /\ \       /\  ___\   /\  ___\
//    \ \  _-/ \ \ \_\ \  \ \ \____  \ \___  \  \ \  __\
//     \ \_\    \ \_____\  \ \_____\  \/\_____\  \ \_____\
//      \/_/     \/_____/   \/_____/   \/_____/   \/_____/
//
// Author: Colin MacRitchie / Ripple Group
//! Zombie detector against live registries

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use pulse_warden::clock::{Clock, ManualClock};
use pulse_warden::events::{Event, EventSink};
use pulse_warden::registry::{Outstanding, WorkRegistry};
use pulse_warden::work::{Interrupt, InterruptError, Work};
use pulse_warden::zombie::{ZombieConfig, ZombieDetector};

#[derive(Default)]
struct Kills(AtomicUsize);

impl EventSink for Kills {
    fn on_event(&self, event: &Event<'_>) {
        if let Event::Killed { .. } = event {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }
}

struct Unkillable;

impl Interrupt for Unkillable {
    fn interrupt(&self) -> Result<(), InterruptError> {
        Err(InterruptError::Refused("not permitted".to_string()))
    }
}

fn expired(clock: &Arc<ManualClock>, id: &str) -> Arc<Work> {
    Work::builder(id)
        .clock(clock.clone() as Arc<dyn Clock>)
        .max_time(Duration::from_secs(1))
        .build()
}

#[test]
fn test_ten_zombies_ten_kills_per_scan() {
    let clock = ManualClock::shared();
    let registry = Outstanding::new();
    let sink = Arc::new(Kills::default());
    let detector = ZombieDetector::new(registry.clone(), ZombieConfig::default()).with_sink(sink.clone());

    let mut tickets: Vec<_> = (0..10).map(|i| registry.create(expired(&clock, &format!("z{i}")))).collect();
    clock.advance(Duration::from_secs(2));

    let report = detector.scan();
    assert_eq!(report.zombies, 10);
    assert_eq!(report.kills, 10);
    assert_eq!(sink.0.load(Ordering::SeqCst), 10);

    // Closed tickets are never killed again
    tickets.truncate(4);
    let report = detector.scan();
    assert_eq!(report.kills, 4);
    assert_eq!(sink.0.load(Ordering::SeqCst), 14);
}

#[test]
fn test_kill_failure_does_not_stop_sweep() {
    let clock = ManualClock::shared();
    let registry = Outstanding::new();
    let detector = ZombieDetector::new(registry.clone(), ZombieConfig::default());

    let stubborn = Work::builder("stubborn")
        .clock(clock.clone() as Arc<dyn Clock>)
        .max_time(Duration::from_secs(1))
        .owner(Arc::new(Unkillable))
        .build();
    let _a = registry.create(stubborn.clone());
    let _b = registry.create(expired(&clock, "willing"));
    clock.advance(Duration::from_secs(5));

    let report = detector.scan();
    assert_eq!(report.kill_failures, 1);
    assert_eq!(report.kills, 1);
    assert_eq!(registry.len(), 2);
    // The token is cancelled even when the owner refuses
    assert!(stubborn.is_killed());
}

#[test]
fn test_background_thread_kills_zombies() {
    let registry = Outstanding::new();
    let config = ZombieConfig {
        period_ms: 10,
        watch_ms: 5,
        thread_name: "zombie-test".to_string(),
    };
    let detector = ZombieDetector::new(registry.clone(), config);

    let work = Work::builder("slow").max_time(Duration::from_millis(1)).build();
    let _ticket = registry.create(work.clone());
    detector.start().unwrap();

    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    while !work.is_killed() && std::time::Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(5));
    }
    detector.close();

    assert!(work.is_killed());
    assert!(!detector.is_running());
}

#[tokio::test]
async fn test_killed_request_observes_cancellation() {
    let clock = ManualClock::shared();
    let registry = Outstanding::new();
    let detector = ZombieDetector::new(registry.clone(), ZombieConfig::default());
    let work = expired(&clock, "req");
    let _ticket = registry.create(work.clone());

    let token = work.cancellation().clone();
    let waiter = tokio::spawn(async move { token.cancelled().await });

    clock.advance(Duration::from_secs(3));
    detector.scan();
    tokio::time::timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
}
