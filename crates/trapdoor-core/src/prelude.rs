//! Common module for library exports

pub use crate::arch::{Architecture, Native, X86, X86_64};
pub use crate::breakpoints::{BreakpointLength, BreakpointManager, BreakpointMode};
pub use crate::config::SessionConfig;
pub use crate::error::{TrapdoorError, TrapdoorResult};
pub use crate::halt::{HaltCoordinator, HaltReport, HaltSequence};
pub use crate::platform::{Interconnect, Machine, PageMapper, Processor, TaskContext};
pub use crate::registers::RegisterAccess;
pub use crate::session::{DebugEvent, Disposition, EntryReason, Outcome, ReasonDispatcher, Session};
pub use crate::types::{Address, CpuId, CpuSet};
