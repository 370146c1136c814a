use std::{
    collections::{BTreeSet, HashMap},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use futures::FutureExt;
use parking_lot::Mutex;
use throng::{
    Completion, Scheduler, SchedulerError, Task, TaskRegistry, ThinkTime, UserClass, Workload,
    WorkloadError,
};
use tokio::time::Instant;

fn ms(n: u64) -> Duration {
    Duration::from_millis(n)
}

fn ping() -> TaskRegistry {
    TaskRegistry::new()
        .with_task(Task::new("ping", 1, |_| async { Ok(Completion::Done) }.boxed()))
        .unwrap()
}

fn single_class(class: UserClass) -> Workload {
    Workload::new().with_class(class).unwrap()
}

fn browsers() -> Workload {
    single_class(UserClass::new("browser", ping()).with_think_time(ThinkTime::constant(ms(500))))
}

#[tokio::test(start_paused = true)]
async fn ramp_up_respects_target_and_spawn_rate() {
    let mut scheduler = Scheduler::builder().workload(browsers()).seed(1).build();
    let started = Instant::now();
    scheduler.start(50, 10.0).unwrap();

    loop {
        tokio::time::sleep(ms(50)).await;
        let pop = scheduler.population();
        let elapsed = started.elapsed().as_secs_f64();
        assert!(pop.spawned <= 50, "{pop:?}");
        assert!(
            pop.spawned as f64 <= 10.0 * elapsed + 1.0 + 1e-9,
            "spawned {} users after {elapsed}s",
            pop.spawned
        );
        if pop.running == 50 {
            break;
        }
        assert!(elapsed < 6.0, "target not reached in time: {pop:?}");
    }
    let ramp = started.elapsed();
    assert!(ramp >= ms(4_500) && ramp <= ms(5_500), "{ramp:?}");

    tokio::time::sleep(Duration::from_secs(3)).await;
    let pop = scheduler.population();
    assert_eq!((pop.target, pop.spawned, pop.running), (50, 50, 50));

    scheduler.stop().await.unwrap();
    let pop = scheduler.population();
    assert_eq!(pop.stopped, 50);
    assert_eq!(pop.starting + pop.running + pop.stopping, 0);
}

#[tokio::test(start_paused = true)]
async fn nothing_is_recorded_after_stop() {
    let tasks = TaskRegistry::new()
        .with_task(Task::new("slow", 1, |_| {
            async {
                tokio::time::sleep(ms(200)).await;
                Ok(Completion::Done)
            }
            .boxed()
        }))
        .unwrap();
    let class = UserClass::new("slowpoke", tasks).with_think_time(ThinkTime::constant(ms(50)));
    let workload = single_class(class);
    let mut scheduler = Scheduler::builder().workload(workload).build();

    scheduler.start(20, 100.0).unwrap();
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(scheduler.is_running());
    scheduler.stop().await.unwrap();
    assert!(!scheduler.is_running());

    let recorded = scheduler.metrics().recorded();
    assert!(recorded > 0);
    assert_eq!(scheduler.population().stopped, 20);

    tokio::time::sleep(Duration::from_secs(5)).await;
    assert_eq!(scheduler.metrics().recorded(), recorded);
    assert_eq!(scheduler.snapshot().count(), recorded);
}

#[tokio::test(start_paused = true)]
async fn failed_start_hooks_do_not_affect_healthy_users() {
    let broken_tasks = TaskRegistry::new()
        .with_task(Task::new("unreachable", 1, |_| async { Ok(Completion::Done) }.boxed()))
        .unwrap();
    let broken = UserClass::new("broken", broken_tasks)
        .with_on_start(|_| async { Err(anyhow::anyhow!("login returned 401")) }.boxed())
        .with_think_time(ThinkTime::constant(ms(100)));
    let healthy = UserClass::new("healthy", ping()).with_think_time(ThinkTime::constant(ms(100)));
    let workload = Workload::new()
        .with_class(broken)
        .unwrap()
        .with_class(healthy)
        .unwrap();

    let mut scheduler = Scheduler::builder().workload(workload).seed(99).build();
    scheduler.start(20, 20.0).unwrap();
    tokio::time::sleep(Duration::from_secs(3)).await;

    let pop = scheduler.population();
    assert_eq!(pop.spawned, 20, "failed users are not replaced");
    assert!(pop.startup_failures > 0 && pop.running > 0, "{pop:?}");
    assert_eq!(pop.startup_failures + pop.running, 20);

    let snapshot = scheduler.snapshot();
    assert_eq!(snapshot.startup_failures["broken"], pop.startup_failures as u64);
    assert!(snapshot.action("unreachable").is_none());
    assert!(snapshot.action("ping").unwrap().count > 0);

    scheduler.stop().await.unwrap();
    assert_eq!(scheduler.population().stopped, 20);
}

#[tokio::test(start_paused = true)]
async fn failing_actions_keep_users_looping() {
    let tasks = TaskRegistry::new()
        .with_task(Task::new("flaky", 1, |_| {
            async { Err(anyhow::anyhow!("GET /api/cases/list returned 503")) }.boxed()
        }))
        .unwrap();
    let class = UserClass::new("stubborn", tasks).with_think_time(ThinkTime::constant(ms(100)));
    let workload = single_class(class);

    let snapshot = Scheduler::builder()
        .workload(workload)
        .build()
        .run_for(5, 50.0, Duration::from_secs(3))
        .await
        .unwrap();

    let flaky = snapshot.action("flaky").unwrap();
    assert!(flaky.count >= 5 * 20, "{}", flaky.count);
    assert_eq!(flaky.successes, 0);
    assert_eq!(flaky.errors["GET /api/cases/list returned 503"], flaky.count);
}

#[tokio::test(start_paused = true)]
async fn panicking_actions_do_not_shrink_the_population() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let tasks = TaskRegistry::new()
        .with_task(Task::new("boom", 1, move |_| {
            let call = counter.fetch_add(1, Ordering::SeqCst);
            async move {
                if call < 5 {
                    panic!("handler bug");
                }
                Ok(Completion::Done)
            }
            .boxed()
        }))
        .unwrap();
    let class = UserClass::new("crasher", tasks).with_think_time(ThinkTime::constant(ms(100)));
    let mut scheduler = Scheduler::builder().workload(single_class(class)).build();

    scheduler.start(5, 50.0).unwrap();
    tokio::time::sleep(Duration::from_secs(3)).await;
    let pop = scheduler.population();
    assert_eq!((pop.spawned, pop.running, pop.stopped), (5, 5, 0), "{pop:?}");

    let snapshot = scheduler.snapshot();
    let boom = snapshot.action("boom").unwrap();
    assert_eq!(boom.errors["panicked: handler bug"], 5);
    assert!(boom.successes > 0);

    scheduler.stop().await.unwrap();
    assert_eq!(scheduler.population().stopped, 5);
}

#[tokio::test(start_paused = true)]
async fn sessions_are_private_to_their_user() {
    let seen: Arc<Mutex<HashMap<usize, Vec<u64>>>> = Arc::default();
    let recorder = Arc::clone(&seen);
    let tasks = TaskRegistry::new()
        .with_task(Task::new("visit", 1, move |session| {
            let seen = Arc::clone(&recorder);
            async move {
                let expected = format!("user-{}", session.user());
                anyhow::ensure!(session.identity() == Some(expected.as_str()), "wrong identity");
                let visits = session.get_u64("visits").unwrap_or(0) + 1;
                session.set("visits", visits);
                tokio::time::sleep(ms(10)).await;
                seen.lock().entry(session.user()).or_default().push(visits);
                Ok(Completion::Done)
            }
            .boxed()
        }))
        .unwrap();
    let class = UserClass::new("visitor", tasks)
        .with_on_start(|session| {
            async move {
                session.set_identity(format!("user-{}", session.user()));
                Ok(())
            }
            .boxed()
        })
        .with_think_time(ThinkTime::between(ms(20), ms(80)));

    let snapshot = Scheduler::builder()
        .workload(single_class(class))
        .seed(5)
        .build()
        .run_for(10, 100.0, Duration::from_secs(2))
        .await
        .unwrap();

    assert_eq!(snapshot.action("visit").unwrap().failures(), 0);
    let seen = seen.lock();
    assert_eq!(seen.len(), 10);
    for (user, visits) in seen.iter() {
        let expected: Vec<u64> = (1..=visits.len() as u64).collect();
        assert_eq!(visits, &expected, "user {user} saw foreign writes");
    }
}

#[tokio::test(start_paused = true)]
async fn lowering_the_target_retires_the_newest_users() {
    let active: Arc<Mutex<BTreeSet<usize>>> = Arc::default();
    let recorder = Arc::clone(&active);
    let tasks = TaskRegistry::new()
        .with_task(Task::new("work", 1, move |session| {
            recorder.lock().insert(session.user());
            async { Ok(Completion::Done) }.boxed()
        }))
        .unwrap();
    let workload =
        single_class(UserClass::new("worker", tasks).with_think_time(ThinkTime::constant(ms(100))));
    let mut scheduler = Scheduler::builder().workload(workload).build();

    scheduler.start(30, 30.0).unwrap();
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(scheduler.population().running, 30);

    scheduler.set_target(10).unwrap();
    tokio::time::sleep(Duration::from_secs(2)).await;
    let pop = scheduler.population();
    assert_eq!((pop.target, pop.running, pop.stopped), (10, 10, 20));

    active.lock().clear();
    tokio::time::sleep(Duration::from_secs(1)).await;
    assert_eq!(*active.lock(), (0..10).collect::<BTreeSet<_>>());

    scheduler.set_target(15).unwrap();
    tokio::time::sleep(Duration::from_secs(2)).await;
    let pop = scheduler.population();
    assert_eq!((pop.spawned, pop.running), (35, 15));

    scheduler.stop().await.unwrap();
    assert_eq!(scheduler.population().stopped, 35);
}

#[tokio::test(start_paused = true)]
async fn elapsed_time_spans_the_run_only() {
    let mut scheduler = Scheduler::builder().workload(browsers()).build();
    tokio::time::sleep(Duration::from_secs(30)).await;

    let snapshot = scheduler.run_for(5, 10.0, Duration::from_secs(4)).await.unwrap();
    assert!(
        snapshot.elapsed >= Duration::from_secs(4) && snapshot.elapsed < ms(4_100),
        "{:?}",
        snapshot.elapsed
    );

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(scheduler.snapshot().elapsed, snapshot.elapsed);
}

#[tokio::test(start_paused = true)]
async fn lifecycle_misuse_is_rejected() {
    let mut scheduler = Scheduler::builder().workload(browsers()).build();
    assert_eq!(scheduler.set_target(3), Err(SchedulerError::NotStarted));
    assert!(matches!(
        scheduler.start(3, 0.0),
        Err(SchedulerError::InvalidSpawnRate(_))
    ));
    assert!(matches!(
        scheduler.start(3, f64::NAN),
        Err(SchedulerError::InvalidSpawnRate(_))
    ));

    assert_eq!(scheduler.stop().await, Err(SchedulerError::NotStarted));
    scheduler.start(3, 10.0).unwrap();
    assert_eq!(scheduler.start(3, 10.0), Err(SchedulerError::AlreadyStarted));

    scheduler.stop().await.unwrap();
    assert_eq!(scheduler.stop().await, Ok(()));
    assert_eq!(scheduler.start(3, 10.0), Err(SchedulerError::Stopped));
    assert_eq!(scheduler.set_target(5), Err(SchedulerError::Stopped));
}

#[tokio::test]
async fn empty_workload_cannot_start() {
    let mut scheduler = Scheduler::builder().workload(Workload::new()).build();
    assert_eq!(
        scheduler.start(1, 1.0),
        Err(SchedulerError::Workload(WorkloadError::NoUserClasses))
    );
}

#[test]
fn start_requires_a_runtime() {
    let mut scheduler = Scheduler::builder().workload(browsers()).build();
    assert_eq!(scheduler.start(1, 1.0), Err(SchedulerError::NoRuntime));
}
