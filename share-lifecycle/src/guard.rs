//! Single-flight guard for mutating wallet operations.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

const IDLE: u8 = 0;

/// Mutating operations serialized by the guard
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Generate = 1,
    Backup = 2,
    Recover = 3,
    Eject = 4,
    Notify = 5,
}

impl Operation {
    fn from_u8(raw: u8) -> Option<Self> {
        match raw {
            1 => Some(Operation::Generate),
            2 => Some(Operation::Backup),
            3 => Some(Operation::Recover),
            4 => Some(Operation::Eject),
            5 => Some(Operation::Notify),
            _ => None,
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Operation::Generate => "generate",
            Operation::Backup => "backup",
            Operation::Recover => "recover",
            Operation::Eject => "eject",
            Operation::Notify => "notify",
        };
        f.write_str(name)
    }
}

/// At most one mutating operation may hold the guard at a time.
///
/// The slot records which operation is in flight; acquisition is a single
/// compare-and-swap so two racing callers can never both succeed.
#[derive(Debug, Default)]
pub struct MutationGuard {
    in_flight: AtomicU8,
}

impl MutationGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claims the guard for `op`, or reports the operation already holding it
    pub fn try_acquire(&self, op: Operation) -> Result<MutationPermit<'_>, Operation> {
        match self
            .in_flight
            .compare_exchange(IDLE, op as u8, Ordering::AcqRel, Ordering::Acquire)
        {
            Ok(_) => Ok(MutationPermit { guard: self, op }),
            // A non-idle value was always written by `try_acquire`
            Err(current) => Err(Operation::from_u8(current).unwrap_or(op)),
        }
    }

    pub fn is_held(&self) -> bool {
        self.in_flight.load(Ordering::Acquire) != IDLE
    }

    pub fn in_flight(&self) -> Option<Operation> {
        Operation::from_u8(self.in_flight.load(Ordering::Acquire))
    }
}

/// Proof of holding the guard. Releases it when dropped, on every exit path.
#[derive(Debug)]
pub struct MutationPermit<'a> {
    guard: &'a MutationGuard,
    op: Operation,
}

impl MutationPermit<'_> {
    pub fn operation(&self) -> Operation {
        self.op
    }
}

impl Drop for MutationPermit<'_> {
    fn drop(&mut self) {
        self.guard.in_flight.store(IDLE, Ordering::Release);
    }
}
