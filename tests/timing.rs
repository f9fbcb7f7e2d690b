use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use sensord::pipeline::dispatcher::ActionDispatcher;
use sensord::{Action, ActionPayload, ThreadPriority};

/// Fire times of tagged actions.
type Log = Arc<Mutex<Vec<(usize, Instant)>>>;

fn recording_action(log: &Log, tag: usize, time: Duration, latency: Duration) -> Action {
    let log = log.clone();
    Action::new(
        time,
        ActionPayload::custom(move || log.lock().unwrap().push((tag, Instant::now()))),
    )
    .with_latency(latency)
}

#[test]
fn actions_fire_at_tick_plus_offset_minus_latency() {
    let dispatcher = ActionDispatcher::new(Duration::from_millis(2));
    dispatcher.start(ThreadPriority::Inherit, None).unwrap();
    let log: Log = Arc::default();

    // Injected tick timestamp, far enough out that every deadline is ahead.
    let t0 = Instant::now() + Duration::from_millis(20);
    let latency = Duration::from_micros(1_500);
    let deadlines: Vec<_> = (0..25)
        .map(|i| {
            let time = Duration::from_millis(3 + 2 * i as u64);
            let action = recording_action(&log, i, time, latency);
            let deadline = t0 + action.time - action.latency;
            dispatcher.schedule(deadline, action);
            deadline
        })
        .collect();

    thread::sleep(Duration::from_millis(120));
    assert_eq!(dispatcher.shutdown(), 0);

    let log = log.lock().unwrap();
    assert_eq!(log.len(), deadlines.len());
    let mut lateness: Vec<_> = log
        .iter()
        .map(|&(tag, fired)| {
            assert!(fired >= deadlines[tag], "action {tag} fired early");
            fired - deadlines[tag]
        })
        .collect();
    lateness.sort();
    let median = lateness[lateness.len() / 2];
    assert!(median < Duration::from_micros(200), "median lateness {median:?}");
    assert_eq!(dispatcher.stats().fired, deadlines.len() as u64);
}

#[test]
fn past_deadlines_fire_immediately_in_order() {
    let dispatcher = ActionDispatcher::new(Duration::from_micros(500));
    let log: Log = Arc::default();
    let past = Instant::now();
    for tag in 0..3 {
        dispatcher.schedule(past, recording_action(&log, tag, Duration::ZERO, Duration::ZERO));
    }
    dispatcher.start(ThreadPriority::Inherit, None).unwrap();
    thread::sleep(Duration::from_millis(20));
    dispatcher.shutdown();

    let tags: Vec<_> = log.lock().unwrap().iter().map(|&(tag, _)| tag).collect();
    assert_eq!(tags, vec![0, 1, 2]);
}
