//! Session configuration
//!
//! ```rust
//! use trapdoor_core::config::SessionConfig;
//!
//! let config = SessionConfig::default().ipi_poll_budget(10_000).chain_declined(true);
//! assert_eq!(config.ipi_poll_budget, 10_000);
//! assert!(!config.no_ipi);
//! ```

/// Default number of polls before a silent processor is sent an NMI
pub const DEFAULT_IPI_POLL_BUDGET: u32 = 1_000_000;

/// Default number of polls after the NMI before a processor is given up on
pub const DEFAULT_NMI_POLL_BUDGET: u32 = 1_000_000;

/// Knobs of a debugger session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionConfig
{
    /// Polls to wait for halt IPI acknowledgements
    pub ipi_poll_budget: u32,
    /// Polls to wait after escalating to NMI
    pub nmi_poll_budget: u32,
    /// Leave the other processors running
    pub no_ipi: bool,
    /// Hand events the dispatcher declines to the displaced handler
    pub chain_declined: bool,
}

impl Default for SessionConfig
{
    fn default() -> Self
    {
        Self {
            ipi_poll_budget: DEFAULT_IPI_POLL_BUDGET,
            nmi_poll_budget: DEFAULT_NMI_POLL_BUDGET,
            no_ipi: false,
            chain_declined: false,
        }
    }
}

impl SessionConfig
{
    /// Polls to wait for IPI acknowledgements before escalating
    #[must_use]
    pub const fn ipi_poll_budget(mut self, polls: u32) -> Self
    {
        self.ipi_poll_budget = polls;
        self
    }

    /// Polls to wait after the NMI before giving up on a processor
    #[must_use]
    pub const fn nmi_poll_budget(mut self, polls: u32) -> Self
    {
        self.nmi_poll_budget = polls;
        self
    }

    /// Set both poll budgets at once
    #[must_use]
    pub const fn poll_budget(self, polls: u32) -> Self
    {
        self.ipi_poll_budget(polls).nmi_poll_budget(polls)
    }

    /// Skip halting the other processors
    #[must_use]
    pub const fn no_ipi(mut self, no_ipi: bool) -> Self
    {
        self.no_ipi = no_ipi;
        self
    }

    /// Call the displaced handler for events the dispatcher declines
    #[must_use]
    pub const fn chain_declined(mut self, chain: bool) -> Self
    {
        self.chain_declined = chain;
        self
    }
}
