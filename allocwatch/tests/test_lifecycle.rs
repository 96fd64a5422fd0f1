use std::cell::RefCell;
use std::rc::Rc;
use std::time::{Duration, Instant};

use allocwatch::codec::encode;
use allocwatch::domain::{AttachError, Pid, TransportError};
use allocwatch::lifecycle::{Phase, Session, WARMUP_BASE_SIZE};
use allocwatch::probe::{AttachTarget, ProbeProgram};
use allocwatch::resolver::DlResolver;
use allocwatch::transport::local::{self, Consumer, Producer};
use allocwatch::transport::EventSource;
use allocwatch_common::AllocEvent;
use tokio_util::sync::CancellationToken;

type Log = Rc<RefCell<Vec<String>>>;

/// Consumer end that records when it is released
struct RecordingTransport {
    consumer: Consumer,
    log: Log,
}

impl EventSource for RecordingTransport {
    async fn poll<F>(&mut self, timeout: Duration, on_record: F) -> Result<usize, TransportError>
    where
        F: FnMut(&[u8]),
    {
        self.consumer.poll(timeout, on_record).await
    }
}

impl Drop for RecordingTransport {
    fn drop(&mut self) {
        self.log.borrow_mut().push("transport".to_string());
    }
}

/// Stands in for the kernel program: the test plays the probe by writing
/// to the producer end
struct SimulatedProbe {
    consumer: Option<Consumer>,
    log: Log,
}

impl ProbeProgram for SimulatedProbe {
    type Link = u32;
    type Transport = RecordingTransport;

    fn attach(&mut self, target: &AttachTarget) -> Result<u32, AttachError> {
        self.log.borrow_mut().push(format!("attach {}", target.pid));
        Ok(1)
    }

    fn detach(&mut self, link: u32) -> Result<(), AttachError> {
        assert_eq!(link, 1);
        self.log.borrow_mut().push("detach".to_string());
        Ok(())
    }

    fn open_transport(&mut self) -> Result<RecordingTransport, TransportError> {
        let consumer = self.consumer.take().ok_or(TransportError::Closed)?;
        Ok(RecordingTransport { consumer, log: Rc::clone(&self.log) })
    }
}

impl Drop for SimulatedProbe {
    fn drop(&mut self) {
        self.log.borrow_mut().push("program".to_string());
    }
}

fn subscribed_session(log: &Log) -> (Session<SimulatedProbe>, Producer) {
    let (producer, consumer) = local::channel(64 * 1024);
    let probe = SimulatedProbe { consumer: Some(consumer), log: Rc::clone(log) };

    let mut session = Session::new();
    session.load(probe).unwrap();
    session.attach(&DlResolver, "malloc", Pid::current()).expect("malloc should resolve in-process");
    session.subscribe().unwrap();
    (session, producer)
}

fn teardown_entries(log: &Log) -> Vec<String> {
    log.borrow().iter().filter(|e| !e.starts_with("attach")).cloned().collect()
}

#[tokio::test]
async fn test_warm_up_delivers_sizes_in_order() {
    let log = Log::default();
    let (mut session, mut producer) = subscribed_session(&log);
    let pid = u64::from(Pid::current().0);

    let target = session.target().cloned().unwrap();
    assert!(target.binary_path.is_absolute());
    assert_eq!(log.borrow()[0], format!("attach {}", Pid::current()));

    // Every allocation fires the simulated probe once
    let mut events: Vec<AllocEvent> = Vec::new();
    session
        .warm_up(
            5,
            |size| assert!(producer.try_send(&encode(&AllocEvent { pid, size: size as u64 }))),
            &mut events,
        )
        .await
        .unwrap();

    let sizes: Vec<u64> = events.iter().map(|e| e.size).collect();
    assert_eq!(sizes, vec![32, 33, 34, 35, 36]);
    assert_eq!(WARMUP_BASE_SIZE, 32);
    assert!(events.iter().all(|e| e.pid == pid));
    assert_eq!(session.summary().delivered, 5);
    assert_eq!(session.phase(), Phase::Polling);
}

#[tokio::test]
async fn test_events_across_polls_keep_order() {
    let log = Log::default();
    let (mut session, mut producer) = subscribed_session(&log);

    let mut events: Vec<AllocEvent> = Vec::new();
    for size in 32..=36u64 {
        assert!(producer.try_send(&encode(&AllocEvent { pid: 1, size })));
        if size % 2 == 0 {
            session.poll_once(Duration::from_millis(50), &mut events).await.unwrap();
        }
    }
    session.poll_once(Duration::from_millis(50), &mut events).await.unwrap();

    assert_eq!(events.iter().map(|e| e.size).collect::<Vec<_>>(), vec![32, 33, 34, 35, 36]);
}

#[tokio::test]
async fn test_cancel_while_blocked_in_poll() {
    let log = Log::default();
    let (mut session, _producer) = subscribed_session(&log);
    let poll_interval = Duration::from_millis(200);

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        trigger.cancel();
    });

    let started = Instant::now();
    let mut events: Vec<AllocEvent> = Vec::new();
    let summary = session.run(poll_interval, None, &mut events, &cancel).await.unwrap();
    let elapsed = started.elapsed();

    // Observed at the end of the poll that was in flight
    assert!(elapsed < poll_interval * 2, "took {elapsed:?}");
    assert!(summary.polls >= 1);
    assert_eq!(session.phase(), Phase::Draining);

    session.close();
    session.close();
    drop(session);

    assert_eq!(teardown_entries(&log), vec!["transport", "detach", "program"]);
}

#[tokio::test]
async fn test_cancel_before_run_skips_polling() {
    let log = Log::default();
    let (mut session, _producer) = subscribed_session(&log);

    let cancel = CancellationToken::new();
    cancel.cancel();

    let mut events: Vec<AllocEvent> = Vec::new();
    let summary = session.run(Duration::from_secs(5), None, &mut events, &cancel).await.unwrap();
    assert_eq!(summary.polls, 0);

    drop(session);
    assert_eq!(teardown_entries(&log), vec!["transport", "detach", "program"]);
}

#[tokio::test]
async fn test_dropped_session_tears_down_once() {
    let log = Log::default();
    let (mut session, mut producer) = subscribed_session(&log);

    assert!(producer.try_send(&encode(&AllocEvent { pid: 1, size: 64 })));
    let mut events: Vec<AllocEvent> = Vec::new();
    session.poll_once(Duration::from_millis(50), &mut events).await.unwrap();
    assert_eq!(events.len(), 1);

    drop(session);
    assert_eq!(teardown_entries(&log), vec!["transport", "detach", "program"]);
}
