//! # Session Lifecycle
//!
//! Drives one tracing session through a fixed sequence of phases:
//!
//! ```text
//! Idle → Loaded → Attached → Subscribed → Polling → Draining → Closed
//! ```
//!
//! A failure while attaching or subscribing tears down whatever was already
//! set up and leaves the session `Closed`. Teardown always releases the
//! transport first, then the attachment, then the program, whether it runs
//! through [`Session::close`] or through `Drop`.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use log::{debug, info, warn};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::codec::decode;
use crate::domain::{LifecycleError, Pid};
use crate::probe::{AttachTarget, Attachment, ProbeProgram, ProbeStats};
use crate::resolver::SymbolResolver;
use crate::sink::EventSink;
use crate::transport::EventSource;

/// Poll timeout after each warm-up allocation
pub const WARMUP_POLL: Duration = Duration::from_millis(200);

/// Size of the first warm-up allocation; each following one is a byte larger
pub const WARMUP_BASE_SIZE: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Loaded,
    Attached,
    Subscribed,
    Polling,
    Draining,
    Closed,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Idle => "idle",
            Phase::Loaded => "loaded",
            Phase::Attached => "attached",
            Phase::Subscribed => "subscribed",
            Phase::Polling => "polling",
            Phase::Draining => "draining",
            Phase::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// Validated settings for one session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// Process to trace
    pub pid: Pid,
    /// Function to probe
    pub symbol: String,
    /// Only search this module for the symbol
    pub binary: Option<PathBuf>,
    /// Compiled probe object
    pub probe_object: PathBuf,
    pub poll_interval: Duration,
    /// Stop after this long (`None` runs until cancelled)
    pub duration: Option<Duration>,
    /// Number of warm-up allocations when tracing ourselves
    pub warmup: usize,
    /// Suppress per-event output
    pub quiet: bool,
}

impl SessionConfig {
    /// Whether the traced process is this one
    #[must_use]
    pub fn traces_self(&self) -> bool {
        self.pid == Pid::current()
    }
}

/// Record counts over a session
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PollSummary {
    /// Events decoded and handed to the sink
    pub delivered: u64,
    /// Records skipped because they were too short
    pub skipped: u64,
    /// Poll calls made
    pub polls: u64,
}

impl fmt::Display for PollSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} events delivered, {} records skipped, {} polls",
            self.delivered, self.skipped, self.polls
        )
    }
}

/// One probe, one attachment, one transport
///
/// Field order matches release order.
pub struct Session<P: ProbeProgram> {
    transport: Option<P::Transport>,
    attachment: Option<Attachment<P::Link>>,
    program: Option<P>,
    phase: Phase,
    summary: PollSummary,
}

impl<P: ProbeProgram> Default for Session<P> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: ProbeProgram> Session<P> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            transport: None,
            attachment: None,
            program: None,
            phase: Phase::Idle,
            summary: PollSummary::default(),
        }
    }

    #[must_use]
    pub fn phase(&self) -> Phase {
        self.phase
    }

    #[must_use]
    pub fn summary(&self) -> PollSummary {
        self.summary
    }

    /// The live attachment's target, if attached
    #[must_use]
    pub fn target(&self) -> Option<&AttachTarget> {
        self.attachment.as_ref().map(|a| &a.target)
    }

    /// Probe-side counters; only available until the program is released
    #[must_use]
    pub fn probe_stats(&self) -> Option<ProbeStats> {
        self.program.as_ref().and_then(P::stats)
    }

    fn expect_phase(&self, expected: Phase) -> Result<(), LifecycleError> {
        if self.phase == expected {
            Ok(())
        } else {
            Err(LifecycleError::InvalidPhase { expected, actual: self.phase })
        }
    }

    /// Take ownership of a loaded program
    ///
    /// # Errors
    /// Returns an error if the session is not idle
    pub fn load(&mut self, program: P) -> Result<(), LifecycleError> {
        self.expect_phase(Phase::Idle)?;
        self.program = Some(program);
        self.phase = Phase::Loaded;
        debug!("Session {}", self.phase);
        Ok(())
    }

    /// Resolve `symbol` and bind the probe to it in `pid`
    ///
    /// On failure the session is torn down and left `Closed`.
    ///
    /// # Errors
    /// Returns an error if resolution or attachment fails
    pub fn attach<R>(&mut self, resolver: &R, symbol: &str, pid: Pid) -> Result<AttachTarget, LifecycleError>
    where
        R: SymbolResolver + ?Sized,
    {
        self.expect_phase(Phase::Loaded)?;
        let result = self.try_attach(resolver, symbol, pid);
        if let Err(e) = &result {
            warn!("Attach failed: {e}");
            self.close();
        }
        result
    }

    fn try_attach<R>(&mut self, resolver: &R, symbol: &str, pid: Pid) -> Result<AttachTarget, LifecycleError>
    where
        R: SymbolResolver + ?Sized,
    {
        let location = resolver.resolve(symbol)?;
        let offset = location.file_offset()?;
        debug!(
            "{symbol} resolved to {} in {} (base {}), file offset {offset}",
            location.virtual_address,
            location.module_path.display(),
            location.load_base
        );

        let target = AttachTarget { binary_path: location.module_path, offset, pid };
        let Some(program) = self.program.as_mut() else {
            return Err(LifecycleError::InvalidPhase { expected: Phase::Loaded, actual: self.phase });
        };
        let link = program.attach(&target)?;

        self.attachment = Some(Attachment { link, target: target.clone() });
        self.phase = Phase::Attached;
        Ok(target)
    }

    /// Open the program's event transport
    ///
    /// On failure the session is torn down and left `Closed`.
    ///
    /// # Errors
    /// Returns an error if the transport cannot be opened
    pub fn subscribe(&mut self) -> Result<(), LifecycleError> {
        self.expect_phase(Phase::Attached)?;
        let Some(program) = self.program.as_mut() else {
            return Err(LifecycleError::InvalidPhase { expected: Phase::Attached, actual: self.phase });
        };

        match program.open_transport() {
            Ok(transport) => {
                self.transport = Some(transport);
                self.phase = Phase::Subscribed;
                debug!("Session {}", self.phase);
                Ok(())
            }
            Err(e) => {
                warn!("Subscribe failed: {e}");
                self.close();
                Err(e.into())
            }
        }
    }

    /// Wait up to `timeout` for records and deliver the decoded events
    ///
    /// Records too short to hold an event are skipped.
    ///
    /// # Errors
    /// Returns an error if the session is not subscribed or the transport
    /// is no longer valid
    pub async fn poll_once<S>(&mut self, timeout: Duration, sink: &mut S) -> Result<usize, LifecycleError>
    where
        S: EventSink + ?Sized,
    {
        if self.phase == Phase::Subscribed {
            self.phase = Phase::Polling;
        }
        self.expect_phase(Phase::Polling)?;
        let Some(transport) = self.transport.as_mut() else {
            return Err(LifecycleError::InvalidPhase { expected: Phase::Polling, actual: self.phase });
        };

        let mut delivered = 0;
        let mut skipped = 0;
        let drained = transport
            .poll(timeout, |bytes| match decode(bytes) {
                Ok(event) => {
                    sink.deliver(&event);
                    delivered += 1;
                }
                Err(e) => {
                    debug!("Skipping record: {e}");
                    skipped += 1;
                }
            })
            .await;

        self.summary.polls += 1;
        self.summary.delivered += delivered;
        self.summary.skipped += skipped;
        drained.map_err(LifecycleError::from)
    }

    /// Make `count` allocations of increasing size, polling after each
    ///
    /// Only meaningful when the traced process is this one.
    ///
    /// # Errors
    /// Returns an error if polling fails
    pub async fn warm_up<A, S>(&mut self, count: usize, mut allocate: A, sink: &mut S) -> Result<(), LifecycleError>
    where
        A: FnMut(usize),
        S: EventSink + ?Sized,
    {
        for size in (WARMUP_BASE_SIZE..).take(count) {
            allocate(size);
            self.poll_once(WARMUP_POLL, sink).await?;
        }
        Ok(())
    }

    /// Poll until cancelled, until `duration` has passed, or until the
    /// transport fails
    ///
    /// Cancellation is checked once per iteration, so it is observed within
    /// one `poll_interval`. The session is left `Draining` on a clean stop.
    ///
    /// # Errors
    /// Returns an error if the session is not subscribed or the transport
    /// fails
    pub async fn run<S>(
        &mut self,
        poll_interval: Duration,
        duration: Option<Duration>,
        sink: &mut S,
        cancel: &CancellationToken,
    ) -> Result<PollSummary, LifecycleError>
    where
        S: EventSink + ?Sized,
    {
        if self.phase == Phase::Subscribed {
            self.phase = Phase::Polling;
        }
        self.expect_phase(Phase::Polling)?;
        let deadline = duration.map(|d| Instant::now() + d);

        let outcome = loop {
            if cancel.is_cancelled() {
                info!("Stopping: cancelled");
                break Ok(());
            }
            if deadline.is_some_and(|d| Instant::now() >= d) {
                info!("Stopping: duration reached");
                break Ok(());
            }
            if let Err(e) = self.poll_once(poll_interval, sink).await {
                break Err(e);
            }
        };

        self.phase = Phase::Draining;
        debug!("Session {} ({})", self.phase, self.summary);
        outcome.map(|()| self.summary)
    }

    /// Release the transport, then the attachment, then the program
    ///
    /// Safe to call more than once; only the first call does anything.
    pub fn close(&mut self) {
        if self.phase == Phase::Closed {
            return;
        }
        debug!("Closing session ({})", self.phase);

        drop(self.transport.take());

        if let Some(attachment) = self.attachment.take() {
            match self.program.as_mut() {
                Some(program) => {
                    if let Err(e) = program.detach(attachment.link) {
                        warn!("{e}");
                    }
                }
                None => warn!("Attachment to {} outlived its program", attachment.target),
            }
        }

        drop(self.program.take());
        self.phase = Phase::Closed;
    }
}

impl<P: ProbeProgram> Drop for Session<P> {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{AttachError, FileOffset, ResolutionError, TransportError, VirtAddr};
    use crate::resolver::SymbolLocation;
    use crate::transport::local::{self, Consumer, Producer};
    use allocwatch_common::AllocEvent;
    use std::cell::RefCell;
    use std::rc::Rc;

    type Log = Rc<RefCell<Vec<&'static str>>>;

    struct FixedResolver(Result<SymbolLocation, fn() -> ResolutionError>);

    impl SymbolResolver for FixedResolver {
        fn resolve(&self, _symbol: &str) -> Result<SymbolLocation, ResolutionError> {
            self.0.clone().map_err(|make| make())
        }
    }

    fn libc_location() -> FixedResolver {
        FixedResolver(Ok(SymbolLocation {
            virtual_address: VirtAddr(0x7f00_000a_d9a0),
            module_path: PathBuf::from("/usr/lib/libc.so.6"),
            load_base: VirtAddr(0x7f00_0000_0000),
        }))
    }

    struct Tracked {
        consumer: Consumer,
        log: Log,
    }

    impl EventSource for Tracked {
        async fn poll<F>(&mut self, timeout: Duration, on_record: F) -> Result<usize, TransportError>
        where
            F: FnMut(&[u8]),
        {
            self.consumer.poll(timeout, on_record).await
        }
    }

    impl Drop for Tracked {
        fn drop(&mut self) {
            self.log.borrow_mut().push("transport");
        }
    }

    struct FakeProbe {
        consumer: Option<Consumer>,
        reject_attach: bool,
        log: Log,
    }

    impl FakeProbe {
        fn new(log: &Log) -> (Self, Producer) {
            let (producer, consumer) = local::channel(1024);
            (Self { consumer: Some(consumer), reject_attach: false, log: Rc::clone(log) }, producer)
        }
    }

    impl ProbeProgram for FakeProbe {
        type Link = ();
        type Transport = Tracked;

        fn attach(&mut self, target: &AttachTarget) -> Result<(), AttachError> {
            if self.reject_attach {
                return Err(AttachError::Rejected {
                    probe: "handle_alloc".to_string(),
                    binary: target.binary_path.clone(),
                    offset: target.offset,
                    pid: target.pid,
                    error: "rejected".to_string(),
                });
            }
            self.log.borrow_mut().push("attach");
            Ok(())
        }

        fn detach(&mut self, (): ()) -> Result<(), AttachError> {
            self.log.borrow_mut().push("detach");
            Ok(())
        }

        fn open_transport(&mut self) -> Result<Tracked, TransportError> {
            let consumer = self.consumer.take().ok_or(TransportError::MapNotFound("EVENTS".to_string()))?;
            Ok(Tracked { consumer, log: Rc::clone(&self.log) })
        }
    }

    impl Drop for FakeProbe {
        fn drop(&mut self) {
            self.log.borrow_mut().push("program");
        }
    }

    fn loaded(log: &Log) -> (Session<FakeProbe>, Producer) {
        let (probe, producer) = FakeProbe::new(log);
        let mut session = Session::new();
        session.load(probe).unwrap();
        (session, producer)
    }

    #[test]
    fn test_attach_computes_file_offset() {
        let log = Log::default();
        let (mut session, _producer) = loaded(&log);

        let target = session.attach(&libc_location(), "malloc", Pid(7)).unwrap();
        assert_eq!(target.offset, FileOffset(0xa_d9a0));
        assert_eq!(target.binary_path, PathBuf::from("/usr/lib/libc.so.6"));
        assert_eq!(session.phase(), Phase::Attached);
        assert_eq!(session.target(), Some(&target));
    }

    #[test]
    fn test_resolution_failure_closes() {
        let log = Log::default();
        let (mut session, _producer) = loaded(&log);
        let resolver = FixedResolver(Err(|| ResolutionError::SymbolNotFound("malloc".to_string())));

        let err = session.attach(&resolver, "malloc", Pid(7)).unwrap_err();
        assert!(matches!(err, LifecycleError::Resolution(ResolutionError::SymbolNotFound(_))));
        assert_eq!(session.phase(), Phase::Closed);
        assert_eq!(*log.borrow(), vec!["program"]);
    }

    #[test]
    fn test_attach_rejection_closes() {
        let log = Log::default();
        let (mut session, _producer) = loaded(&log);
        session.program.as_mut().unwrap().reject_attach = true;

        let err = session.attach(&libc_location(), "malloc", Pid(7)).unwrap_err();
        assert!(matches!(err, LifecycleError::Attach(AttachError::Rejected { .. })));
        assert_eq!(session.phase(), Phase::Closed);
        assert_eq!(*log.borrow(), vec!["program"]);
    }

    #[test]
    fn test_subscribe_failure_detaches_then_releases() {
        let log = Log::default();
        let (mut session, _producer) = loaded(&log);
        session.program.as_mut().unwrap().consumer = None;
        session.attach(&libc_location(), "malloc", Pid(7)).unwrap();

        let err = session.subscribe().unwrap_err();
        assert!(matches!(err, LifecycleError::Transport(TransportError::MapNotFound(_))));
        assert_eq!(session.phase(), Phase::Closed);
        assert_eq!(*log.borrow(), vec!["attach", "detach", "program"]);
    }

    #[test]
    fn test_out_of_order_calls_rejected() {
        let log = Log::default();
        let mut session: Session<FakeProbe> = Session::new();
        let err = session.subscribe().unwrap_err();
        assert!(matches!(
            err,
            LifecycleError::InvalidPhase { expected: Phase::Attached, actual: Phase::Idle }
        ));

        let (probe, _producer) = FakeProbe::new(&log);
        session.load(probe).unwrap();
        let (second, _producer) = FakeProbe::new(&log);
        assert!(session.load(second).is_err());
    }

    #[test]
    fn test_close_is_idempotent() {
        let log = Log::default();
        let (mut session, _producer) = loaded(&log);
        session.attach(&libc_location(), "malloc", Pid(7)).unwrap();
        session.subscribe().unwrap();

        session.close();
        session.close();
        drop(session);
        assert_eq!(*log.borrow(), vec!["attach", "transport", "detach", "program"]);
    }

    #[test]
    fn test_drop_releases_in_order() {
        let log = Log::default();
        let (mut session, _producer) = loaded(&log);
        session.attach(&libc_location(), "malloc", Pid(7)).unwrap();
        session.subscribe().unwrap();

        drop(session);
        assert_eq!(*log.borrow(), vec!["attach", "transport", "detach", "program"]);
    }

    #[tokio::test]
    async fn test_short_records_skipped() {
        let log = Log::default();
        let (mut session, mut producer) = loaded(&log);
        session.attach(&libc_location(), "malloc", Pid(7)).unwrap();
        session.subscribe().unwrap();

        assert!(producer.try_send(&[1, 2, 3]));
        assert!(producer.try_send(&AllocEvent { pid: 7, size: 64 }.to_ne_bytes()));

        let mut events: Vec<AllocEvent> = Vec::new();
        let drained = session.poll_once(Duration::from_millis(50), &mut events).await.unwrap();
        assert_eq!(drained, 2);
        assert_eq!(events, vec![AllocEvent { pid: 7, size: 64 }]);
        assert_eq!(session.summary(), PollSummary { delivered: 1, skipped: 1, polls: 1 });
        assert_eq!(session.phase(), Phase::Polling);
    }

    #[tokio::test]
    async fn test_run_stops_after_duration() {
        let log = Log::default();
        let (mut session, _producer) = loaded(&log);
        session.attach(&libc_location(), "malloc", Pid(7)).unwrap();
        session.subscribe().unwrap();

        let mut events: Vec<AllocEvent> = Vec::new();
        let cancel = CancellationToken::new();
        let summary = session
            .run(Duration::from_millis(10), Some(Duration::from_millis(50)), &mut events, &cancel)
            .await
            .unwrap();

        assert!(summary.polls >= 1);
        assert!(events.is_empty());
        assert_eq!(session.phase(), Phase::Draining);
    }

    #[tokio::test]
    async fn test_run_fails_when_producer_gone() {
        let log = Log::default();
        let (mut session, producer) = loaded(&log);
        session.attach(&libc_location(), "malloc", Pid(7)).unwrap();
        session.subscribe().unwrap();
        drop(producer);

        let mut events: Vec<AllocEvent> = Vec::new();
        let err = session
            .run(Duration::from_millis(10), None, &mut events, &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, LifecycleError::Transport(TransportError::Closed)));
        assert_eq!(session.phase(), Phase::Draining);
    }

    #[test]
    fn test_traces_self() {
        let config = SessionConfig {
            pid: Pid::current(),
            symbol: "malloc".to_string(),
            binary: None,
            probe_object: PathBuf::from("target/bpfel-unknown-none/release/allocwatch"),
            poll_interval: Duration::from_millis(250),
            duration: None,
            warmup: 5,
            quiet: false,
        };
        assert!(config.traces_self());
        assert!(!SessionConfig { pid: Pid(1), ..config }.traces_self());
    }
}
