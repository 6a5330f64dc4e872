use eventide_scheduler::{
    EventLoop, LoopConfig, LoopState, LoopStats, ManualClock, PendingWork, RunSummary,
    SchedulerError,
};
use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::time::Duration;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::TRACE)
        .try_init();
}

#[test]
fn test_stop_discards_pending_work() {
    init_tracing();
    let scheduler = EventLoop::with_clock(ManualClock::new());
    let token = Rc::new(());

    let t = token.clone();
    scheduler
        .schedule_microtask(move || drop(t))
        .unwrap();
    let t = token.clone();
    scheduler
        .schedule_macrotask(move || drop(t))
        .unwrap();
    let t = token.clone();
    scheduler
        .set_timeout(Duration::from_millis(10), move || drop(t))
        .unwrap();
    let t = token.clone();
    scheduler
        .set_interval(Duration::from_millis(10), move || {
            let _ = Rc::strong_count(&t);
        })
        .unwrap();
    assert_eq!(Rc::strong_count(&token), 5);

    scheduler.stop();

    // Every closure was dropped without running
    assert_eq!(Rc::strong_count(&token), 1);
    assert_eq!(scheduler.pending(), PendingWork::default());
    assert_eq!(scheduler.state(), LoopState::Stopped);
    assert_eq!(scheduler.stats().macrotasks_run, 0);
}

#[test]
fn test_stopped_loop_rejects_work() {
    let scheduler = EventLoop::with_clock(ManualClock::new());
    scheduler.stop();
    scheduler.stop();

    assert!(scheduler.is_stopped());
    assert_eq!(
        scheduler.schedule_microtask(|| {}).unwrap_err(),
        SchedulerError::Stopped
    );
    assert_eq!(
        scheduler.schedule_macrotask(|| {}).unwrap_err(),
        SchedulerError::Stopped
    );
    assert_eq!(
        scheduler
            .set_timeout(Duration::from_millis(1), || {})
            .unwrap_err(),
        SchedulerError::Stopped
    );
    assert_eq!(
        scheduler
            .set_interval(Duration::from_millis(1), || {})
            .unwrap_err(),
        SchedulerError::Stopped
    );

    // Run methods return immediately
    assert_eq!(scheduler.run_until_idle().unwrap(), RunSummary::default());
    assert_eq!(scheduler.run_forever().unwrap(), RunSummary::default());
    assert!(!scheduler.tick().unwrap());
}

#[test]
fn test_stop_from_task_halts_the_drain() {
    let scheduler = Rc::new(EventLoop::with_clock(ManualClock::new()));
    let log = Rc::new(RefCell::new(Vec::new()));

    {
        let sch = scheduler.clone();
        let log = log.clone();
        scheduler
            .schedule_macrotask(move || {
                log.borrow_mut().push("A");

                let stopper = sch.clone();
                let l = log.clone();
                sch.schedule_microtask(move || {
                    l.borrow_mut().push("M1");
                    stopper.stop();
                })
                .unwrap();

                let l = log.clone();
                sch.schedule_microtask(move || l.borrow_mut().push("M2"))
                    .unwrap();
                let l = log.clone();
                sch.schedule_macrotask(move || l.borrow_mut().push("B"))
                    .unwrap();
            })
            .unwrap();
    }

    let summary = scheduler.run_until_idle().unwrap();

    assert_eq!(*log.borrow(), vec!["A", "M1"]);
    assert_eq!(summary.tasks_run, 2);
    assert_eq!(scheduler.state(), LoopState::Stopped);
    assert!(scheduler.is_idle());
}

#[test]
fn test_stop_ends_run_forever() {
    let clock = ManualClock::new();
    let scheduler = Rc::new(EventLoop::with_clock(clock.clone()));
    let fired = Rc::new(Cell::new(0));

    let weak = Rc::downgrade(&scheduler);
    let f = fired.clone();
    scheduler
        .set_interval(Duration::from_millis(10), move || {
            f.set(f.get() + 1);
            if f.get() == 4 {
                if let Some(scheduler) = weak.upgrade() {
                    scheduler.stop();
                }
            }
        })
        .unwrap();

    let summary = scheduler.run_forever().unwrap();

    assert_eq!(fired.get(), 4);
    assert_eq!(summary.tasks_run, 4);
    assert_eq!(clock.elapsed(), Duration::from_millis(40));
}

#[test]
fn test_run_until_stalled_does_not_wait() {
    let clock = ManualClock::new();
    let scheduler = EventLoop::with_clock(clock.clone());
    let fired = Rc::new(Cell::new(false));

    let flag = fired.clone();
    scheduler
        .set_timeout(Duration::from_millis(10), move || flag.set(true))
        .unwrap();

    let summary = scheduler.run_until_stalled().unwrap();
    assert_eq!(summary.tasks_run, 0);
    assert!(!fired.get());
    assert_eq!(clock.elapsed(), Duration::ZERO);
    assert_eq!(scheduler.next_deadline(), Some(clock.origin() + Duration::from_millis(10)));

    clock.advance(Duration::from_millis(10));
    scheduler.run_until_stalled().unwrap();
    assert!(fired.get());
}

#[test]
fn test_stats_track_each_kind_of_work() {
    let clock = ManualClock::new();
    let scheduler = Rc::new(EventLoop::with_clock(clock.clone()));

    {
        let sch = scheduler.clone();
        scheduler
            .schedule_macrotask(move || {
                sch.schedule_microtask(|| {}).unwrap();
                sch.schedule_microtask(|| {}).unwrap();
            })
            .unwrap();
    }
    scheduler
        .set_timeout(Duration::from_millis(5), || {})
        .unwrap();
    let cancelled = scheduler
        .set_timeout(Duration::from_millis(5), || {})
        .unwrap();
    scheduler.cancel(cancelled);
    scheduler
        .schedule_macrotask(|| -> anyhow::Result<()> { anyhow::bail!("nope") })
        .unwrap();

    let summary = scheduler.run_until_idle().unwrap();
    let stats = scheduler.stats();

    assert_eq!(
        stats,
        LoopStats {
            iterations: 3,
            macrotasks_run: 3,
            microtasks_run: 2,
            timers_fired: 1,
            cancellations: 1,
            failures: 1,
            remote_received: 0,
        }
    );
    assert_eq!(summary.iterations, 3);
    assert_eq!(summary.tasks_run, 5);
}

#[test]
fn test_loops_are_independent() {
    let first = EventLoop::builder()
        .name("first")
        .clock(ManualClock::new())
        .build();
    let second = EventLoop::builder()
        .config(LoopConfig {
            name: "second".to_string(),
            ..LoopConfig::default()
        })
        .clock(ManualClock::new())
        .build();

    let ran = Rc::new(Cell::new(0));
    let r = ran.clone();
    first.schedule_macrotask(move || r.set(r.get() + 1)).unwrap();
    let r = ran.clone();
    second.schedule_macrotask(move || r.set(r.get() + 10)).unwrap();

    first.stop();
    second.run_until_idle().unwrap();

    assert_eq!(ran.get(), 10);
    assert_eq!(first.state(), LoopState::Stopped);
    assert_eq!(second.state(), LoopState::Idle);
    assert_eq!(second.config().name, "second");
}
