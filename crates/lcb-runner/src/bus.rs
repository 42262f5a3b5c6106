//! A virtual CAN bus joining several interfaces in lockstep simulated time.
//!
//! Every interface keeps its own executor. The bus runs them until nothing
//! is ready, carries each transmitted frame to every other interface, and
//! only then moves time to the earliest pending timer anywhere. Interfaces
//! whose timers fall due at the same instant fire in attach order, with the
//! frames of each delivered before the next fires.

use std::time::Duration;

use crossbeam_channel::{unbounded, Receiver};
use lcb_can::{CanFrame, Completion, CompletionReceiver, IfCan, IfCanBuilder, IfHandle, Mti, NodeHandle, NodeId};
use lcb_executor::{Executor, FlowTime};
use tracing::{debug, trace, warn};

use crate::error::{RunnerError, RunnerResult};
use crate::report::{InterfaceSummary, RunReport, TraceEntry, WriteOutcome, WriteStatus};
use crate::scenario::{ScheduledStimulus, Stimulus};

/// Origin recorded for injected frames.
pub const EXTERNAL_ORIGIN: &str = "external";

struct BusPort {
    name: String,
    exec: Executor<IfCan>,
    handle: IfHandle,
    tx: Receiver<CanFrame>,
}

struct PendingWrite {
    index: usize,
    interface: String,
    kind: &'static str,
    mti: Mti,
    issued: FlowTime,
    rx: CompletionReceiver,
}

impl PendingWrite {
    fn outcome(&self, completed: Option<FlowTime>, status: WriteStatus) -> WriteOutcome {
        WriteOutcome {
            index: self.index,
            interface: self.interface.clone(),
            kind: self.kind.to_string(),
            mti: self.mti.raw(),
            issued_us: self.issued.as_micros(),
            completed_us: completed.map(|t| t.as_micros()),
            status,
        }
    }
}

#[derive(Default)]
pub struct VirtualBus {
    ports: Vec<BusPort>,
    now: FlowTime,
    trace: Vec<TraceEntry>,
    pending: Vec<PendingWrite>,
    writes: Vec<WriteOutcome>,
    issued: usize,
    dropped: u64,
}

impl VirtualBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build an interface from `builder` and connect it to the bus.
    pub fn attach(&mut self, name: &str, builder: IfCanBuilder) -> RunnerResult<&mut IfCan> {
        if self.port_index(name).is_ok() {
            return Err(RunnerError::DuplicateInterface(name.to_string()));
        }
        let (sink, tx) = unbounded();
        let (mut exec, handle) = builder.with_name(name).build(sink);
        exec.sync_clock(self.now);
        debug!(iface = name, ports = self.ports.len() + 1, "attached to bus");
        let index = self.ports.len();
        self.ports.push(BusPort {
            name: name.to_string(),
            exec,
            handle,
            tx,
        });
        Ok(self.ports[index].exec.service_mut())
    }

    fn port_index(&self, name: &str) -> RunnerResult<usize> {
        self.ports
            .iter()
            .position(|p| p.name == name)
            .ok_or_else(|| RunnerError::UnknownInterface(name.to_string()))
    }

    pub fn interface(&self, name: &str) -> Option<&IfCan> {
        let index = self.port_index(name).ok()?;
        Some(self.ports[index].exec.service())
    }

    pub fn interface_mut(&mut self, name: &str) -> Option<&mut IfCan> {
        let index = self.port_index(name).ok()?;
        Some(self.ports[index].exec.service_mut())
    }

    /// Handle for registering handlers or writing from outside the bus.
    pub fn handle(&self, name: &str) -> Option<IfHandle> {
        let index = self.port_index(name).ok()?;
        Some(self.ports[index].handle.clone())
    }

    pub fn now(&self) -> FlowTime {
        self.now
    }

    pub fn trace(&self) -> &[TraceEntry] {
        &self.trace
    }

    /// Writes that have completed so far, in completion order.
    pub fn completed_writes(&self) -> &[WriteOutcome] {
        &self.writes
    }

    /// Put `frame` on the bus as if a node outside the simulation sent it.
    pub fn inject(&mut self, frame: CanFrame) {
        self.record(EXTERNAL_ORIGIN.to_string(), frame);
        self.deliver(None, frame);
        self.settle();
    }

    /// Returns the write's index in the report.
    pub fn write_global(&mut self, interface: &str, mti: Mti, src: NodeId, payload: Vec<u8>) -> RunnerResult<usize> {
        let index = self.port_index(interface)?;
        let (completion, rx) = Completion::channel();
        if let Err(err) = self.ports[index].handle.write_global(mti, src, payload, completion) {
            debug!(iface = interface, error = %err, "global write rejected");
        }
        Ok(self.track(index, "global", mti, rx))
    }

    pub fn write_addressed(
        &mut self,
        interface: &str,
        mti: Mti,
        src: NodeId,
        dst: NodeHandle,
        payload: Vec<u8>,
    ) -> RunnerResult<usize> {
        let index = self.port_index(interface)?;
        let (completion, rx) = Completion::channel();
        if let Err(err) = self.ports[index].handle.write_addressed(mti, src, dst, payload, completion) {
            debug!(iface = interface, error = %err, "addressed write rejected");
        }
        Ok(self.track(index, "addressed", mti, rx))
    }

    fn track(&mut self, port: usize, kind: &'static str, mti: Mti, rx: CompletionReceiver) -> usize {
        let index = self.issued;
        self.issued += 1;
        self.pending.push(PendingWrite {
            index,
            interface: self.ports[port].name.clone(),
            kind,
            mti,
            issued: self.now,
            rx,
        });
        self.settle();
        index
    }

    pub fn apply(&mut self, stimulus: &Stimulus) -> RunnerResult<()> {
        match stimulus {
            Stimulus::Global {
                interface,
                mti,
                src,
                payload,
            } => {
                self.write_global(interface, *mti, *src, payload.clone())?;
            }
            Stimulus::Addressed {
                interface,
                mti,
                src,
                dst,
                payload,
            } => {
                self.write_addressed(interface, *mti, *src, *dst, payload.clone())?;
            }
            Stimulus::Inject { frame } => self.inject(*frame),
        }
        Ok(())
    }

    fn record(&mut self, origin: String, frame: CanFrame) {
        trace!(time = %self.now, origin = %origin, frame = %frame, "bus");
        self.trace.push(TraceEntry {
            time_us: self.now.as_micros(),
            origin,
            frame: frame.to_string(),
        });
    }

    fn deliver(&mut self, origin: Option<usize>, frame: CanFrame) {
        for j in 0..self.ports.len() {
            if Some(j) == origin {
                continue;
            }
            let port = &mut self.ports[j];
            if port.handle.deliver_received_frame(frame).is_ok() {
                continue;
            }
            // No free receive slot: drain the interface and retry once.
            port.exec.run_until_idle();
            if let Err(err) = port.handle.deliver_received_frame(frame) {
                self.dropped += 1;
                warn!(iface = %port.name, frame = %frame, error = %err, "receive queue full, frame lost");
            }
        }
    }

    /// Run every interface and carry frames until the bus is quiet.
    fn settle(&mut self) {
        loop {
            let mut busy = false;
            for i in 0..self.ports.len() {
                busy |= self.ports[i].exec.run_until_idle() > 0;
                let frames: Vec<CanFrame> = self.ports[i].tx.try_iter().collect();
                for frame in frames {
                    busy = true;
                    self.record(self.ports[i].name.clone(), frame);
                    self.deliver(Some(i), frame);
                }
            }
            if !busy {
                break;
            }
        }
        self.poll_writes();
    }

    fn poll_writes(&mut self) {
        let now = self.now;
        let mut waiting = Vec::with_capacity(self.pending.len());
        for write in self.pending.drain(..) {
            match write.rx.try_result() {
                Some(result) => self.writes.push(write.outcome(Some(now), result.into())),
                None => waiting.push(write),
            }
        }
        self.pending = waiting;
    }

    fn next_deadline(&self) -> Option<FlowTime> {
        self.ports.iter().filter_map(|p| p.exec.next_deadline()).min()
    }

    /// Move every interface to `target`, firing timers in time order.
    pub fn advance_to(&mut self, target: FlowTime) {
        self.settle();
        while let Some(deadline) = self.next_deadline().filter(|d| *d <= target) {
            self.now = self.now.max(deadline);
            let now = self.now;
            for port in &mut self.ports {
                port.exec.sync_clock(now);
            }
            for i in 0..self.ports.len() {
                if self.ports[i].exec.next_deadline().is_some_and(|d| d <= now) {
                    self.ports[i].exec.advance_to(now);
                    self.settle();
                }
            }
        }
        self.now = self.now.max(target);
        let now = self.now;
        for port in &mut self.ports {
            port.exec.sync_clock(now);
        }
    }

    pub fn advance_by(&mut self, delta: Duration) {
        self.advance_to(self.now + delta);
    }

    /// Apply `schedule` and run until `until`. Stimuli scheduled after
    /// `until` are skipped.
    pub fn run(&mut self, schedule: &[ScheduledStimulus], until: FlowTime) -> RunnerResult<RunReport> {
        for item in schedule {
            let at = FlowTime::from_millis(item.at_ms);
            if at > until {
                debug!(at = %at, "stimulus after end of run, skipped");
                continue;
            }
            self.advance_to(at);
            self.apply(&item.stimulus)?;
        }
        self.advance_to(until);
        Ok(self.report())
    }

    /// Snapshot of the run so far. Writes still in flight show as pending.
    pub fn report(&self) -> RunReport {
        let mut writes = self.writes.clone();
        writes.extend(self.pending.iter().map(|w| w.outcome(None, WriteStatus::Pending)));
        writes.sort_by_key(|w| w.index);
        RunReport {
            scenario: None,
            end_us: self.now.as_micros(),
            frames: self.trace.clone(),
            writes,
            interfaces: self
                .ports
                .iter()
                .map(|p| InterfaceSummary::of(p.exec.service()))
                .collect(),
            dropped_frames: self.dropped,
        }
    }
}
