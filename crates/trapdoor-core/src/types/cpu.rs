//! Processor identifiers and sets of processors

use core::fmt;

/// Largest number of processors the halt bookkeeping can track
pub const MAX_CPUS: usize = 64;

/// Logical processor number as assigned by the host
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct CpuId(pub u32);

impl CpuId
{
    /// Index into per-processor arrays
    pub const fn index(self) -> usize
    {
        self.0 as usize
    }
}

impl fmt::Display for CpuId
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        write!(f, "{}", self.0)
    }
}

/// Bitmask of up to [`MAX_CPUS`] processors
///
/// Identifiers at or beyond [`MAX_CPUS`] are silently ignored by `insert`
/// and never reported by `contains`.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct CpuSet(u64);

impl CpuSet
{
    /// No processors
    pub const fn empty() -> Self
    {
        Self(0)
    }

    /// Processors `0..count`
    pub const fn first(count: u32) -> Self
    {
        if count as usize >= MAX_CPUS {
            Self(u64::MAX)
        } else {
            Self((1u64 << count) - 1)
        }
    }

    /// Raw bitmask
    pub const fn bits(self) -> u64
    {
        self.0
    }

    /// Add a processor
    pub fn insert(&mut self, cpu: CpuId)
    {
        if cpu.index() < MAX_CPUS {
            self.0 |= 1 << cpu.0;
        }
    }

    /// Remove a processor
    pub fn remove(&mut self, cpu: CpuId)
    {
        if cpu.index() < MAX_CPUS {
            self.0 &= !(1 << cpu.0);
        }
    }

    /// Whether the processor is in the set
    pub const fn contains(self, cpu: CpuId) -> bool
    {
        cpu.index() < MAX_CPUS && self.0 & (1 << cpu.0) != 0
    }

    /// Copy of the set without `cpu`
    pub fn without(mut self, cpu: CpuId) -> Self
    {
        self.remove(cpu);
        self
    }

    /// Number of processors in the set
    pub const fn len(self) -> usize
    {
        self.0.count_ones() as usize
    }

    /// Whether the set is empty
    pub const fn is_empty(self) -> bool
    {
        self.0 == 0
    }

    /// Processors in ascending order
    pub fn iter(self) -> impl Iterator<Item = CpuId>
    {
        (0..MAX_CPUS as u32)
            .map(CpuId)
            .filter(move |cpu| self.contains(*cpu))
    }
}

impl FromIterator<CpuId> for CpuSet
{
    fn from_iter<I: IntoIterator<Item = CpuId>>(iter: I) -> Self
    {
        let mut set = CpuSet::empty();
        for cpu in iter {
            set.insert(cpu);
        }
        set
    }
}

impl fmt::Debug for CpuSet
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        f.debug_set().entries(self.iter().map(|cpu| cpu.0)).finish()
    }
}

impl fmt::Display for CpuSet
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result
    {
        let mut first = true;
        for cpu in self.iter() {
            if !first {
                f.write_str(",")?;
            }
            write!(f, "{cpu}")?;
            first = false;
        }
        if first {
            f.write_str("none")?;
        }
        Ok(())
    }
}
