//! The pre-reserved replay memory arena.
//!
//! The interpreter addresses replay data relative to a single large
//! address range reserved once at startup. The range is sized by probing
//! a descending list of candidates so the daemon grabs as much room as
//! the host allows without failing outright on small devices.

use crate::error::{ReplayError, Result};
use tracing::{debug, info};

const MIB: usize = 1024 * 1024;

/// Candidate arena sizes, largest first. The 3 GiB tier is only worth
/// probing on 64-bit hosts.
#[cfg(target_pointer_width = "64")]
pub const DEFAULT_ARENA_CANDIDATES: &[usize] = &[
    3 * 1024 * MIB,
    2 * 1024 * MIB,
    1024 * MIB,
    512 * MIB,
    256 * MIB,
    128 * MIB,
];

/// Candidate arena sizes, largest first.
#[cfg(not(target_pointer_width = "64"))]
pub const DEFAULT_ARENA_CANDIDATES: &[usize] = &[
    2 * 1024 * MIB,
    1024 * MIB,
    512 * MIB,
    256 * MIB,
    128 * MIB,
];

/// A single reserved address range shared by every VM context in the
/// process. Access during replay is serialized by the orchestrator's
/// device lock; the arena itself only hands out its bounds.
pub struct MemoryArena {
    reservation: Vec<u8>,
    size: usize,
}

impl MemoryArena {
    /// Reserve the largest candidate size that the host accepts.
    ///
    /// Candidates must be ordered largest first. Returns `E010` if none
    /// of them can be reserved.
    pub fn reserve(candidates: &[usize]) -> Result<Self> {
        for &size in candidates {
            let mut reservation: Vec<u8> = Vec::new();
            match reservation.try_reserve_exact(size) {
                Ok(()) => {
                    info!(bytes = size, "reserved replay arena");
                    return Ok(Self { reservation, size });
                }
                Err(_) => {
                    debug!(bytes = size, "arena candidate rejected by host");
                }
            }
        }
        Err(ReplayError::ArenaReserve {
            smallest: candidates.last().copied().unwrap_or(0),
        })
    }

    /// Reserve using the default candidate list.
    pub fn reserve_default() -> Result<Self> {
        Self::reserve(DEFAULT_ARENA_CANDIDATES)
    }

    /// The lowest address of the reserved range.
    pub fn base_address(&self) -> usize {
        self.reservation.as_ptr() as usize
    }

    /// One past the highest address of the reserved range. Pointer-like
    /// references produced by interpretation must stay below this.
    pub fn top_address(&self) -> usize {
        self.base_address() + self.size
    }

    /// The reserved size in bytes.
    pub fn size(&self) -> usize {
        self.size
    }
}

impl std::fmt::Debug for MemoryArena {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryArena")
            .field("base", &format_args!("{:#x}", self.base_address()))
            .field("size", &self.size)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_candidates_descend_to_the_smallest_tier() {
        assert!(
            DEFAULT_ARENA_CANDIDATES
                .windows(2)
                .all(|pair| pair[0] > pair[1])
        );
        assert_eq!(DEFAULT_ARENA_CANDIDATES.last().copied(), Some(128 * MIB));
    }

    #[test]
    fn reserves_first_fitting_candidate() {
        let arena = MemoryArena::reserve(&[4096, 1024]).unwrap();
        assert_eq!(arena.size(), 4096);
        assert_eq!(arena.top_address(), arena.base_address() + 4096);
    }

    #[test]
    fn falls_through_to_smaller_candidates() {
        // A reservation bigger than the address space must be refused.
        let absurd = usize::MAX / 2;
        let arena = MemoryArena::reserve(&[absurd, 2048]).unwrap();
        assert_eq!(arena.size(), 2048);
    }

    #[test]
    fn fails_when_nothing_fits() {
        let absurd = usize::MAX / 2;
        let err = MemoryArena::reserve(&[absurd]).unwrap_err();
        assert!(matches!(err, ReplayError::ArenaReserve { .. }));
    }
}
