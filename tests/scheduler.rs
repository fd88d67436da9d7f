//! Deadline scheduler integration tests
//!
//! Ordering, cancellation and iterator schedules observed through a running
//! scheduler loop.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{TimeDelta, Utc};
use tokio::sync::mpsc;
use tokio::time::timeout;

use vipcore::scheduler::{callback, Scheduler};
use vipcore::utils::time::{cron, periodic};

const WAIT: Duration = Duration::from_secs(5);

fn recorder(
    scheduler: &Scheduler,
    log: &Arc<Mutex<Vec<usize>>>,
    id: usize,
    offset_ms: i64,
) -> vipcore::ScheduledEvent {
    let log = Arc::clone(log);
    scheduler.schedule_once(
        Utc::now() + TimeDelta::milliseconds(offset_ms),
        callback(move || {
            let log = Arc::clone(&log);
            async move {
                log.lock().unwrap().push(id);
                Ok(())
            }
        }),
    )
}

#[tokio::test]
async fn test_fires_in_deadline_order_regardless_of_insertion() {
    let scheduler = Arc::new(Scheduler::default());
    let log = Arc::new(Mutex::new(Vec::new()));
    let offsets = [90, 10, 70, 30, 50];
    let events: Vec<_> = offsets
        .iter()
        .enumerate()
        .map(|(id, ms)| recorder(&scheduler, &log, id, *ms))
        .collect();

    let s = Arc::clone(&scheduler);
    let task = tokio::spawn(async move { s.run().await });
    timeout(WAIT, async {
        while !events.iter().all(|e| e.is_finished()) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    task.abort();

    assert_eq!(*log.lock().unwrap(), vec![1, 3, 4, 2, 0]);
}

#[tokio::test]
async fn test_past_deadlines_fire_immediately_once() {
    let scheduler = Arc::new(Scheduler::default());
    let (tx, mut rx) = mpsc::unbounded_channel();
    let tx2 = tx.clone();
    scheduler.schedule_once(
        Utc::now() - TimeDelta::hours(1),
        callback(move || {
            let tx = tx.clone();
            async move {
                let _ = tx.send("past");
                Ok(())
            }
        }),
    );
    // Relative deadline given as a Duration.
    scheduler.schedule_once(
        Duration::from_millis(20),
        callback(move || {
            let tx = tx2.clone();
            async move {
                let _ = tx.send("relative");
                Ok(())
            }
        }),
    );

    let s = Arc::clone(&scheduler);
    let task = tokio::spawn(async move { s.run().await });
    assert_eq!(timeout(WAIT, rx.recv()).await.unwrap(), Some("past"));
    assert_eq!(timeout(WAIT, rx.recv()).await.unwrap(), Some("relative"));
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(rx.try_recv().is_err());
    assert!(scheduler.is_empty());
    task.abort();
}

#[tokio::test]
async fn test_cancelled_entry_never_fires() {
    let scheduler = Arc::new(Scheduler::default());
    let log = Arc::new(Mutex::new(Vec::new()));
    let keep = recorder(&scheduler, &log, 1, 40);
    let dropped = recorder(&scheduler, &log, 2, 20);
    dropped.cancel();

    let s = Arc::clone(&scheduler);
    let task = tokio::spawn(async move { s.run().await });
    timeout(WAIT, async {
        while !(keep.is_finished() && dropped.is_finished()) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    task.abort();

    assert!(dropped.is_canceled());
    assert_eq!(*log.lock().unwrap(), vec![1]);
}

#[tokio::test]
async fn test_failing_callback_does_not_stop_loop() {
    let scheduler = Arc::new(Scheduler::default());
    let (tx, mut rx) = mpsc::unbounded_channel();
    scheduler.schedule_once(
        Duration::ZERO,
        callback(|| async { Err::<(), _>(vipcore::CoreError::Other(anyhow::anyhow!("boom"))) }),
    );
    scheduler.schedule_once(
        Duration::from_millis(5),
        callback(|| async {
            let fail = true;
            if fail {
                panic!("callback panicked");
            }
            Ok(())
        }),
    );
    scheduler.schedule_once(
        Duration::from_millis(30),
        callback(move || {
            let tx = tx.clone();
            async move {
                let _ = tx.send(());
                Ok(())
            }
        }),
    );

    let s = Arc::clone(&scheduler);
    let task = tokio::spawn(async move { s.run().await });
    assert_eq!(timeout(WAIT, rx.recv()).await.unwrap(), Some(()));
    task.abort();
}

#[tokio::test]
async fn test_periodic_iterator_fires_repeatedly_until_cancelled() {
    let scheduler = Arc::new(Scheduler::default());
    let (tx, mut rx) = mpsc::unbounded_channel();
    let event = scheduler.schedule_iter(
        periodic(Duration::from_millis(20)).starting_after(Duration::ZERO),
        callback(move || {
            let tx = tx.clone();
            async move {
                let _ = tx.send(Utc::now());
                Ok(())
            }
        }),
    );

    let s = Arc::clone(&scheduler);
    let task = tokio::spawn(async move { s.run().await });
    let mut stamps = Vec::new();
    for _ in 0..3 {
        stamps.push(timeout(WAIT, rx.recv()).await.unwrap().unwrap());
    }
    event.cancel();
    assert!(stamps.windows(2).all(|w| w[0] <= w[1]));

    // At most one firing that was already in flight may still land.
    tokio::time::sleep(Duration::from_millis(100)).await;
    let mut late = 0;
    while rx.try_recv().is_ok() {
        late += 1;
    }
    assert!(late <= 1);
    task.abort();
}

#[tokio::test]
async fn test_bounded_cron_schedule_finishes() {
    let scheduler = Arc::new(Scheduler::default());
    let start = Utc::now() - TimeDelta::minutes(10);
    let stop = start + TimeDelta::minutes(3);
    // Every minute of a window in the past: fires immediately, once per match.
    let matches: Vec<_> = cron("* * * * *")
        .unwrap()
        .starting_at(start)
        .until(stop)
        .collect();
    assert_eq!(matches.len(), 3);

    let (tx, mut rx) = mpsc::unbounded_channel();
    let event = scheduler.schedule_iter(
        matches,
        callback(move || {
            let tx = tx.clone();
            async move {
                let _ = tx.send(());
                Ok(())
            }
        }),
    );

    let s = Arc::clone(&scheduler);
    let task = tokio::spawn(async move { s.run().await });
    for _ in 0..3 {
        timeout(WAIT, rx.recv()).await.unwrap().unwrap();
    }
    timeout(WAIT, async {
        while !event.is_finished() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .unwrap();
    task.abort();
}

#[tokio::test]
async fn test_aborting_loop_fires_nothing_further() {
    let scheduler = Arc::new(Scheduler::default());
    let log = Arc::new(Mutex::new(Vec::new()));
    recorder(&scheduler, &log, 1, 200);

    let s = Arc::clone(&scheduler);
    let task = tokio::spawn(async move { s.run().await });
    tokio::time::sleep(Duration::from_millis(20)).await;
    task.abort();
    let _ = task.await;

    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(log.lock().unwrap().is_empty());
}
