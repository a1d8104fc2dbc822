//! # Multi-Processor Halt Coordinator
//!
//! When one processor enters the debugger it becomes the owner of the
//! session and asks every other online processor to park itself:
//!
//! 1. A new session number is taken from the [`HaltSequence`]
//! 2. Every other processor gets the debugger's halt IPI
//! 3. The owner polls each processor's acknowledged session number
//! 4. Processors that have not caught up within the IPI budget get an NMI,
//!    since the IPI may be masked or the target may be spinning with
//!    interrupts off
//! 5. After the NMI budget the owner gives up on the stragglers, logs them
//!    and carries on with the processors that did park
//!
//! Parked processors sit in [`HaltCoordinator::park`] until the owner calls
//! [`HaltCoordinator::release`].
//!
//! The whole exchange is best effort and bounded. A processor stuck with
//! interrupts disabled in a way even an NMI cannot break never blocks the
//! session; it is reported in [`HaltReport::unresponsive`].

use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};

use tracing::{debug, warn};

use crate::config::SessionConfig;
use crate::error::TrapdoorError;
use crate::platform::{Interconnect, Processor};
use crate::types::{CpuId, CpuSet, MAX_CPUS};

/// Per-processor acknowledgement counters
///
/// Each processor only ever writes its own slot, and only ever raises it.
/// A processor has parked for session `n` once its slot reads `n` or more.
#[derive(Debug)]
pub struct HaltSequence
{
    session: AtomicU64,
    acknowledged: [AtomicU64; MAX_CPUS],
    released: AtomicU64,
}

impl HaltSequence
{
    /// Counters for a machine that has never entered the debugger
    pub const fn new() -> Self
    {
        #[allow(clippy::declare_interior_mutable_const)]
        const ZERO: AtomicU64 = AtomicU64::new(0);
        Self {
            session: AtomicU64::new(0),
            acknowledged: [ZERO; MAX_CPUS],
            released: AtomicU64::new(0),
        }
    }

    /// Start a new session and return its number
    pub fn begin(&self) -> u64
    {
        self.session.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Number of the latest session
    pub fn current(&self) -> u64
    {
        self.session.load(Ordering::Acquire)
    }

    /// Record that `cpu` has parked for the current session
    pub fn acknowledge(&self, cpu: CpuId)
    {
        if let Some(slot) = self.acknowledged.get(cpu.index()) {
            slot.fetch_max(self.current(), Ordering::AcqRel);
        }
    }

    /// Whether `cpu` has parked for `session`
    pub fn has_acknowledged(&self, cpu: CpuId, session: u64) -> bool
    {
        self.acknowledged
            .get(cpu.index())
            .is_some_and(|slot| slot.load(Ordering::Acquire) >= session)
    }

    /// Let processors parked for `session` resume
    pub fn release(&self, session: u64)
    {
        self.released.fetch_max(session, Ordering::AcqRel);
    }

    /// Whether `session` has ended
    pub fn is_released(&self, session: u64) -> bool
    {
        self.released.load(Ordering::Acquire) >= session
    }

    /// Acknowledge the current session and spin until the owner ends it
    ///
    /// Called by the halt IPI and NMI handlers of every non-owner processor.
    pub fn park<P: Processor>(&self, processor: &P)
    {
        let session = self.current();
        self.acknowledge(processor.cpu_id());
        while !self.is_released(session) {
            processor.relax();
        }
    }
}

impl Default for HaltSequence
{
    fn default() -> Self
    {
        Self::new()
    }
}

/// Outcome of one halt request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HaltReport
{
    /// Processor that owns the session
    pub owner: CpuId,
    /// Session number the processors were asked to acknowledge
    pub session: u64,
    /// Processors that were asked to park (empty with `no_ipi`)
    pub requested: CpuSet,
    /// Processors that acknowledged
    pub parked: CpuSet,
    /// Processors that needed an NMI
    pub escalated: CpuSet,
    /// Processors that never acknowledged
    pub unresponsive: CpuSet,
}

impl HaltReport
{
    /// Whether every requested processor parked
    pub fn is_complete(&self) -> bool
    {
        self.unresponsive.is_empty()
    }

    /// One [`TrapdoorError::UnresponsiveProcessor`] per straggler
    pub fn errors(&self) -> impl Iterator<Item = TrapdoorError>
    {
        self.unresponsive.iter().map(TrapdoorError::UnresponsiveProcessor)
    }
}

impl fmt::Display for HaltReport
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        write!(
            f,
            "owner {} session {}: parked [{}] escalated [{}] unresponsive [{}]",
            self.owner, self.session, self.parked, self.escalated, self.unresponsive
        )
    }
}

/// Drives the halt exchange from the owning processor
#[derive(Debug, Clone, Copy)]
pub struct HaltCoordinator<'s>
{
    sequence: &'s HaltSequence,
    ipi_budget: u32,
    nmi_budget: u32,
    no_ipi: bool,
}

impl<'s> HaltCoordinator<'s>
{
    /// Coordinator over `sequence` with the budgets of `config`
    pub fn new(sequence: &'s HaltSequence, config: &SessionConfig) -> Self
    {
        Self {
            sequence,
            ipi_budget: config.ipi_poll_budget,
            nmi_budget: config.nmi_poll_budget,
            no_ipi: config.no_ipi,
        }
    }

    /// The counters this coordinator polls
    pub fn sequence(&self) -> &'s HaltSequence
    {
        self.sequence
    }

    /// Park every other online processor, escalating to NMI where needed
    ///
    /// Never fails: processors that do not respond within both budgets are
    /// logged and listed in the report.
    pub fn halt_others<M>(&self, machine: &M) -> HaltReport
    where
        M: Processor + Interconnect,
    {
        let owner = machine.cpu_id();
        let session = self.sequence.begin();
        let mut report = HaltReport {
            owner,
            session,
            requested: CpuSet::empty(),
            parked: CpuSet::empty(),
            escalated: CpuSet::empty(),
            unresponsive: CpuSet::empty(),
        };

        if self.no_ipi {
            debug!(cpu = owner.0, session, "halt skipped, no_ipi set");
            return report;
        }

        report.requested = machine.online_cpus().without(owner);
        for cpu in report.requested.iter() {
            machine.send_halt_ipi(cpu);
        }

        let mut waiting = self.poll(machine, report.requested, session, self.ipi_budget);
        if !waiting.is_empty() {
            debug!(cpu = owner.0, session, laggards = waiting.bits(), "escalating halt to NMI");
            for cpu in waiting.iter() {
                machine.send_nmi(cpu);
            }
            report.escalated = waiting;
            waiting = self.poll(machine, waiting, session, self.nmi_budget);
        }

        for cpu in waiting.iter() {
            warn!(cpu = cpu.0, session, "processor did not respond to the halt request");
        }
        report.unresponsive = waiting;
        report.parked = CpuSet::from_iter(report.requested.iter().filter(|cpu| !waiting.contains(*cpu)));
        report
    }

    /// End the session started by `report`; parked processors resume
    pub fn release(&self, report: &HaltReport)
    {
        self.sequence.release(report.session);
    }

    /// Park the calling processor until the owner releases it
    pub fn park<P: Processor>(&self, processor: &P)
    {
        self.sequence.park(processor);
    }

    /// Poll until every processor of `pending` acknowledged or the budget ran out
    ///
    /// Returns the processors still missing.
    fn poll<P: Processor>(&self, processor: &P, pending: CpuSet, session: u64, budget: u32) -> CpuSet
    {
        let mut waiting = pending;
        let mut spins = 0;
        loop {
            for cpu in waiting.iter() {
                if self.sequence.has_acknowledged(cpu, session) {
                    waiting.remove(cpu);
                }
            }
            if waiting.is_empty() || spins >= budget {
                return waiting;
            }
            processor.relax();
            spins += 1;
        }
    }
}

#[cfg(test)]
mod tests
{
    use super::*;

    #[test]
    fn test_acknowledge_tracks_latest_session()
    {
        let sequence = HaltSequence::new();
        let first = sequence.begin();
        sequence.acknowledge(CpuId(3));
        assert!(sequence.has_acknowledged(CpuId(3), first));

        let second = sequence.begin();
        assert!(!sequence.has_acknowledged(CpuId(3), second));
    }

    #[test]
    fn test_release_is_monotonic()
    {
        let sequence = HaltSequence::new();
        sequence.release(5);
        sequence.release(2);
        assert!(sequence.is_released(5));
        assert!(!sequence.is_released(6));
    }

    #[test]
    fn test_out_of_range_cpu_is_never_acknowledged()
    {
        let sequence = HaltSequence::new();
        let session = sequence.begin();
        sequence.acknowledge(CpuId(200));
        assert!(!sequence.has_acknowledged(CpuId(200), session));
    }
}
