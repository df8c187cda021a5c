mod common;

use common::{t0, FixedLoadProbe};
use dual_feed_fusion::core::counters;
use dual_feed_fusion::core::config::SchedulerConfig;
use dual_feed_fusion::core::{Counters, ManualClock};
use dual_feed_fusion::scheduler::{job, ResourceScheduler, SystemState, TaskJob, TaskKind};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

fn reporting(kind: TaskKind, tx: mpsc::UnboundedSender<TaskKind>) -> TaskJob {
    job(move || {
        let tx = tx.clone();
        async move {
            let _ = tx.send(kind);
            Ok(())
        }
    })
}

async fn settle(scheduler: &ResourceScheduler) {
    for _ in 0..400 {
        if scheduler.running() == 0 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("tasks still running");
}

#[tokio::test]
async fn critical_load_holds_back_everything_but_critical_work() {
    let clock = Arc::new(ManualClock::new(t0()));
    let probe = Arc::new(FixedLoadProbe::new(99.0, clock.clone()));
    let counters = Arc::new(Counters::new());
    let scheduler = Arc::new(ResourceScheduler::new(
        SchedulerConfig::default(),
        clock.clone(),
        counters.clone(),
        probe.clone(),
    ));

    scheduler.sample();
    assert_eq!(scheduler.state(), SystemState::Critical);

    let (tx, mut rx) = mpsc::unbounded_channel();
    for kind in [TaskKind::Calibration, TaskKind::Compression, TaskKind::StatusReport] {
        scheduler.submit_kind(kind, reporting(kind, tx.clone())).unwrap();
    }

    let report = scheduler.dispatch_once();
    assert_eq!(report.dispatched, 1);
    assert_eq!(rx.recv().await, Some(TaskKind::Compression));
    settle(&scheduler).await;
    assert_eq!(scheduler.queue_len(), 2);
    assert!(counters.get(counters::TASKS_DEFERRED) >= 2);

    // load drops; cooldown elapses; Recovery admits medium priority work
    probe.set_cpu(20.0);
    clock.advance_secs(30);
    scheduler.sample();
    assert_eq!(scheduler.state(), SystemState::Recovery);

    assert_eq!(scheduler.dispatch_once().dispatched, 1);
    assert_eq!(rx.recv().await, Some(TaskKind::Calibration));
    settle(&scheduler).await;

    clock.advance_secs(30);
    scheduler.sample();
    assert_eq!(scheduler.state(), SystemState::Normal);
    assert_eq!(scheduler.dispatch_once().dispatched, 1);
    assert_eq!(rx.recv().await, Some(TaskKind::StatusReport));
    assert_eq!(counters.get(counters::STATE_TRANSITIONS), 3);
}
