//! The [`AllocError`] type and the [`ensure!`] assertion macro.

use core::fmt;

use thiserror::Error;

/// Which of the two guards surrounding a payload was found corrupted.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum GuardSide {
    Front,
    Back,
}

impl fmt::Display for GuardSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GuardSide::Front => f.write_str("front"),
            GuardSide::Back => f.write_str("back"),
        }
    }
}

/// Everything that can go wrong while allocating or freeing.
///
/// Capacity exhaustion is reported as [`AllocError::OutOfMemory`], misuse of an
/// allocator (bad sizes and alignments, out of order frees, foreign pointers) as one
/// of the invariant variants and overwritten guard bytes as [`AllocError::Corruption`].
/// None of these are retried internally.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Error)]
pub enum AllocError {
    #[error("allocation size must be greater than 0")]
    ZeroSize,
    #[error("alignment {0} is not a power of two")]
    InvalidAlignment(usize),
    #[error("out of memory, {requested} bytes requested")]
    OutOfMemory { requested: usize },
    #[error("request of {size} bytes aligned to {align} does not fit a pool slot")]
    SlotMismatch { size: usize, align: usize },
    #[error("{addr:#x} is not the most recent live allocation")]
    OutOfOrderFree { addr: usize },
    #[error("{addr:#x} was not allocated by this allocator")]
    ForeignPointer { addr: usize },
    #[error("{guard} guard at {addr:#x} corrupted, found {found:#010x}")]
    Corruption {
        guard: GuardSide,
        addr: usize,
        found: u32,
    },
    #[error("block size {size} does not fit the allocation header")]
    HeaderOverflow { size: usize },
    #[error("the allocator stores no size header")]
    MissingHeader,
    #[error("unsupported operation: {0}")]
    Unsupported(&'static str),
    #[error("virtual memory operation failed with errno {errno}")]
    VirtualMemory { errno: i32 },
}

/// Checks an allocator invariant.
///
/// On failure the location and the condition are reported through [`tracing::error!`]
/// and the enclosing function returns `Err($err)`.
macro_rules! ensure {
    ($cond:expr, $err:expr $(,)?) => {
        if !($cond) {
            let err = $err;
            ::tracing::error!(
                file = file!(),
                line = line!(),
                condition = stringify!($cond),
                %err,
                "Allocator assertion failed."
            );
            return Err(err.into());
        }
    };
}

pub(crate) use ensure;

/// Validates the size and alignment every strategy requires.
#[inline]
pub(crate) fn check_request(size: usize, align: usize) -> Result<(), AllocError> {
    ensure!(size > 0, AllocError::ZeroSize);
    ensure!(
        crate::util::is_power_of_two(align),
        AllocError::InvalidAlignment(align)
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn checked(x: usize) -> Result<usize, AllocError> {
        ensure!(x < 10, AllocError::OutOfMemory { requested: x });
        Ok(x)
    }

    #[test]
    fn test_ensure() {
        assert_eq!(checked(3), Ok(3));
        assert_eq!(checked(12), Err(AllocError::OutOfMemory { requested: 12 }));
    }

    #[test]
    fn test_check_request() {
        assert_eq!(check_request(0, 8), Err(AllocError::ZeroSize));
        assert_eq!(check_request(8, 0), Err(AllocError::InvalidAlignment(0)));
        assert_eq!(check_request(8, 24), Err(AllocError::InvalidAlignment(24)));
        assert!(check_request(1, 1).is_ok());
    }

    #[test]
    fn test_display() {
        let err = AllocError::Corruption {
            guard: GuardSide::Back,
            addr: 0x1000,
            found: 0xdead,
        };
        assert_eq!(
            err.to_string(),
            "back guard at 0x1000 corrupted, found 0x0000dead"
        );
    }
}
