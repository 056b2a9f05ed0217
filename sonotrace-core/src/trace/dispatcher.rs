//! Trace cycle state machine.
//!
//! A cycle moves `Idle → RunRequested → ResultAvailable → Idle`. The run request
//! comes either from an explicit trigger or from the periodic clock, never both:
//! in trigger-only mode the clock is ignored. Dispatching is refused while the
//! previous cycle's result is unparsed or a parse is running, which keeps each
//! readback tied to exactly one cycle.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use crate::error::{Result, SonoTraceError};
use crate::trace::backend::{CycleHandle, TraceBackend, TracePoll, TraceRequest};
use crate::trace::raw_hit::RawHit;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum RunState {
    Idle = 0,
    RunRequested = 1,
    ResultAvailable = 2,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum RunMode {
    Continuous { rate_hz: f32 },
    TriggerOnly,
}

#[derive(Debug)]
struct InFlight {
    handle: CycleHandle,
    expected_rows: usize,
}

#[derive(Debug)]
struct Readback {
    handle: CycleHandle,
    rows: Vec<RawHit>,
    expected_rows: usize,
}

/// Sets the shared parsing flag for as long as it lives.
pub struct ParseGuard {
    flag: Arc<AtomicBool>,
}

impl ParseGuard {
    fn acquire(flag: &Arc<AtomicBool>) -> Option<Self> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .ok()?;
        Some(Self {
            flag: Arc::clone(flag),
        })
    }
}

impl Drop for ParseGuard {
    fn drop(&mut self) {
        self.flag.store(false, Ordering::Release);
    }
}

/// Borrowed view of a finished readback, valid for one parse.
pub struct ReadbackView<'a> {
    handle: CycleHandle,
    rows: &'a [RawHit],
    expected_rows: usize,
}

impl<'a> ReadbackView<'a> {
    pub fn handle(&self) -> CycleHandle {
        self.handle
    }

    /// Row at `index`, `None` if the backend returned fewer rows.
    pub fn row(&self, index: usize) -> Option<&'a RawHit> {
        self.rows.get(index)
    }

    pub fn rows(&self) -> &'a [RawHit] {
        self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn expected_len(&self) -> usize {
        self.expected_rows
    }

    pub fn is_complete(&self) -> bool {
        self.rows.len() == self.expected_rows
    }
}

impl Drop for ReadbackView<'_> {
    fn drop(&mut self) {
        log::trace!("Released readback view for {}", self.handle);
    }
}

pub struct TraceDispatcher {
    mode: RunMode,
    state: RunState,
    execution_counter: u64,
    last_parsed_counter: u64,
    last_execution: Option<Instant>,
    in_flight: Option<InFlight>,
    readback: Option<Readback>,
    parsing: Arc<AtomicBool>,
}

impl TraceDispatcher {
    pub fn new(mode: RunMode) -> Self {
        Self {
            mode,
            state: RunState::Idle,
            execution_counter: 0,
            last_parsed_counter: 0,
            last_execution: None,
            in_flight: None,
            readback: None,
            parsing: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn mode(&self) -> RunMode {
        self.mode
    }

    pub fn set_mode(&mut self, mode: RunMode) {
        self.mode = mode;
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn execution_counter(&self) -> u64 {
        self.execution_counter
    }

    pub fn last_parsed_counter(&self) -> u64 {
        self.last_parsed_counter
    }

    pub fn is_parsing(&self) -> bool {
        self.parsing.load(Ordering::Acquire)
    }

    /// A dispatched cycle whose result has not been parsed yet.
    pub fn has_unparsed_cycle(&self) -> bool {
        self.execution_counter > self.last_parsed_counter
    }

    pub fn in_flight(&self) -> Option<CycleHandle> {
        self.in_flight.as_ref().map(|f| f.handle)
    }

    fn can_request(&self) -> bool {
        self.state == RunState::Idle && !self.has_unparsed_cycle() && !self.is_parsing()
    }

    /// Explicit trigger. Returns `false` if a cycle is already underway.
    pub fn request_run(&mut self) -> bool {
        if !self.can_request() {
            return false;
        }
        self.state = RunState::RunRequested;
        true
    }

    /// Periodic clock. Requests a run when the configured period has elapsed
    /// since the last dispatch; always `false` in trigger-only mode.
    pub fn clock(&mut self, now: Instant) -> bool {
        let RunMode::Continuous { rate_hz } = self.mode else {
            return false;
        };
        if !self.can_request() {
            return false;
        }
        if let Some(last) = self.last_execution {
            let period = Duration::from_secs_f32(1.0 / rate_hz.max(f32::EPSILON));
            if now.saturating_duration_since(last) < period {
                return false;
            }
        }
        self.state = RunState::RunRequested;
        true
    }

    /// Submits the requested cycle to `backend`.
    ///
    /// # Errors
    ///
    /// Returns `Rejected` without touching the execution counter if no run was
    /// requested, a cycle is in flight, the previous result is unparsed or a parse
    /// is in progress. Returns the backend's error if submission fails, in which
    /// case the dispatcher goes back to `Idle`.
    pub fn dispatch<B: TraceBackend + ?Sized>(
        &mut self,
        backend: &mut B,
        request: TraceRequest,
        now: Instant,
    ) -> Result<CycleHandle> {
        if self.is_parsing() || self.has_unparsed_cycle() {
            return Err(SonoTraceError::Rejected(format!(
                "Previous cycle {} not parsed yet",
                self.execution_counter
            )));
        }
        if self.state != RunState::RunRequested || self.in_flight.is_some() {
            return Err(SonoTraceError::Rejected(format!(
                "No run requested (state {:?})",
                self.state
            )));
        }

        let handle = CycleHandle::new(self.execution_counter + 1);
        let expected_rows = request.expected_rows();
        if let Err(e) = backend.submit(handle, request) {
            self.state = RunState::Idle;
            return Err(e);
        }

        self.execution_counter = handle.index();
        self.last_execution = Some(now);
        self.in_flight = Some(InFlight {
            handle,
            expected_rows,
        });
        log::debug!("Dispatched {} expecting {} rows", handle, expected_rows);
        Ok(handle)
    }

    /// Checks the backend once for the in-flight cycle. Returns `true` when a
    /// result just became available.
    pub fn poll<B: TraceBackend + ?Sized>(&mut self, backend: &mut B) -> bool {
        let Some(in_flight) = &self.in_flight else {
            return false;
        };
        match backend.poll(in_flight.handle) {
            TracePoll::Pending => false,
            TracePoll::Ready(rows) => {
                let in_flight = self.in_flight.take();
                if let Some(InFlight {
                    handle,
                    expected_rows,
                }) = in_flight
                {
                    self.readback = Some(Readback {
                        handle,
                        rows,
                        expected_rows,
                    });
                    self.state = RunState::ResultAvailable;
                }
                true
            }
        }
    }

    /// Holds the parsing flag outside of [`parse_with`](Self::parse_with).
    ///
    /// Returns `None` if a parse is already running.
    pub fn parse_guard(&self) -> Option<ParseGuard> {
        ParseGuard::acquire(&self.parsing)
    }

    /// Runs `parse` over the finished readback and marks the cycle parsed.
    ///
    /// The parsing flag is held for the duration of the call and released on
    /// every exit path. Returns `None` without calling `parse` when no result is
    /// available or another parse holds the flag.
    pub fn parse_with<R>(&mut self, parse: impl FnOnce(&ReadbackView<'_>) -> R) -> Option<R> {
        if self.state != RunState::ResultAvailable {
            return None;
        }
        let _guard = self.parse_guard()?;
        let readback = self.readback.take()?;

        let view = ReadbackView {
            handle: readback.handle,
            rows: &readback.rows,
            expected_rows: readback.expected_rows,
        };
        if !view.is_complete() {
            log::error!(
                "Readback for {} holds {} rows, expected {}",
                view.handle,
                view.len(),
                view.expected_len()
            );
        }
        let result = parse(&view);
        drop(view);

        self.last_parsed_counter = readback.handle.index();
        self.state = RunState::Idle;
        Some(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    /// Returns scripted rows after a configurable number of polls.
    #[derive(Default)]
    struct ScriptedBackend {
        rows: Vec<RawHit>,
        pending_polls: usize,
        submitted: HashMap<CycleHandle, usize>,
        fail_submit: bool,
    }

    impl TraceBackend for ScriptedBackend {
        fn submit(&mut self, handle: CycleHandle, _request: TraceRequest) -> Result<()> {
            if self.fail_submit {
                return Err(SonoTraceError::Backend("offline".into()));
            }
            self.submitted.insert(handle, self.pending_polls);
            Ok(())
        }

        fn poll(&mut self, handle: CycleHandle) -> TracePoll {
            match self.submitted.get_mut(&handle) {
                Some(0) => {
                    self.submitted.remove(&handle);
                    TracePoll::Ready(self.rows.clone())
                }
                Some(remaining) => {
                    *remaining -= 1;
                    TracePoll::Pending
                }
                None => TracePoll::Pending,
            }
        }
    }

    fn request(rays: usize, bounces: usize) -> TraceRequest {
        TraceRequest {
            azimuths: vec![0.0; rays],
            elevations: vec![0.0; rays],
            num_distribution_rays: rays,
            max_bounces: bounces,
            emitter_count: 1,
            sensor_buffer: Vec::new(),
        }
    }

    #[test]
    fn test_full_cycle() {
        let mut backend = ScriptedBackend {
            rows: vec![RawHit::miss(); 4],
            pending_polls: 2,
            ..Default::default()
        };
        let mut dispatcher = TraceDispatcher::new(RunMode::TriggerOnly);
        assert_eq!(dispatcher.state(), RunState::Idle);

        assert!(dispatcher.request_run());
        assert_eq!(dispatcher.state(), RunState::RunRequested);
        let handle = dispatcher
            .dispatch(&mut backend, request(2, 2), Instant::now())
            .unwrap();
        assert_eq!(handle.index(), 1);
        assert_eq!(dispatcher.in_flight(), Some(handle));

        // backend not ready yet, dispatcher keeps waiting
        assert!(!dispatcher.poll(&mut backend));
        assert!(!dispatcher.poll(&mut backend));
        assert_eq!(dispatcher.state(), RunState::RunRequested);
        assert!(dispatcher.poll(&mut backend));
        assert_eq!(dispatcher.state(), RunState::ResultAvailable);

        let rows = dispatcher.parse_with(|view| {
            assert!(view.is_complete());
            view.len()
        });
        assert_eq!(rows, Some(4));
        assert_eq!(dispatcher.state(), RunState::Idle);
        assert_eq!(dispatcher.last_parsed_counter(), 1);
        assert!(!dispatcher.is_parsing());
    }

    #[test]
    fn test_trigger_refused_while_cycle_underway() {
        let mut backend = ScriptedBackend::default();
        let mut dispatcher = TraceDispatcher::new(RunMode::TriggerOnly);
        assert!(dispatcher.request_run());
        assert!(!dispatcher.request_run());
        dispatcher
            .dispatch(&mut backend, request(1, 1), Instant::now())
            .unwrap();
        // dispatched but unparsed
        assert!(!dispatcher.request_run());
    }

    #[test]
    fn test_dispatch_refused_while_parsing() {
        let mut backend = ScriptedBackend::default();
        let mut dispatcher = TraceDispatcher::new(RunMode::TriggerOnly);
        assert!(dispatcher.request_run());

        let guard = dispatcher.parse_guard().unwrap();
        let result = dispatcher.dispatch(&mut backend, request(1, 1), Instant::now());
        assert!(matches!(result, Err(SonoTraceError::Rejected(_))));
        assert_eq!(dispatcher.execution_counter(), 0);
        assert!(backend.submitted.is_empty());

        drop(guard);
        assert!(!dispatcher.is_parsing());
        assert!(
            dispatcher
                .dispatch(&mut backend, request(1, 1), Instant::now())
                .is_ok()
        );
        assert_eq!(dispatcher.execution_counter(), 1);
    }

    #[test]
    fn test_parse_without_result_releases_guard() {
        let mut dispatcher = TraceDispatcher::new(RunMode::TriggerOnly);
        let mut called = false;
        assert!(dispatcher.parse_with(|_| called = true).is_none());
        assert!(!called);
        assert!(!dispatcher.is_parsing());
    }

    #[test]
    fn test_short_readback_is_parsed() {
        let mut backend = ScriptedBackend {
            rows: vec![RawHit::miss(); 1],
            ..Default::default()
        };
        let mut dispatcher = TraceDispatcher::new(RunMode::TriggerOnly);
        dispatcher.request_run();
        dispatcher
            .dispatch(&mut backend, request(2, 3), Instant::now())
            .unwrap();
        assert!(dispatcher.poll(&mut backend));
        let seen = dispatcher.parse_with(|view| {
            (view.len(), view.expected_len(), view.row(5).is_none())
        });
        assert_eq!(seen, Some((1, 6, true)));
        assert_eq!(dispatcher.state(), RunState::Idle);
    }

    #[test]
    fn test_failed_submit_returns_to_idle() {
        let mut backend = ScriptedBackend {
            fail_submit: true,
            ..Default::default()
        };
        let mut dispatcher = TraceDispatcher::new(RunMode::TriggerOnly);
        dispatcher.request_run();
        assert!(
            dispatcher
                .dispatch(&mut backend, request(1, 1), Instant::now())
                .is_err()
        );
        assert_eq!(dispatcher.state(), RunState::Idle);
        assert_eq!(dispatcher.execution_counter(), 0);
    }

    #[test]
    fn test_clock_is_rate_limited() {
        let mut backend = ScriptedBackend::default();
        let mut dispatcher = TraceDispatcher::new(RunMode::Continuous { rate_hz: 10.0 });
        let start = Instant::now();

        assert!(dispatcher.clock(start));
        dispatcher.dispatch(&mut backend, request(1, 1), start).unwrap();
        assert!(dispatcher.poll(&mut backend));
        dispatcher.parse_with(|_| ());

        assert!(!dispatcher.clock(start + Duration::from_millis(50)));
        assert!(dispatcher.clock(start + Duration::from_millis(150)));
    }

    #[test]
    fn test_clock_ignored_in_trigger_mode() {
        let mut dispatcher = TraceDispatcher::new(RunMode::TriggerOnly);
        assert!(!dispatcher.clock(Instant::now()));
        assert_eq!(dispatcher.state(), RunState::Idle);
    }
}
