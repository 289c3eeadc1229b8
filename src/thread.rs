//! Thread policies of the facade.
//!
//! Every facade operation runs inside [`ThreadPolicy::enter`]. [`SingleThread`] does
//! nothing and makes the facade `!Sync`, [`MultiThread`] serializes all operations
//! through a `Mutex`.

use core::cell::Cell;
use core::marker::PhantomData;
use std::sync::{Mutex, MutexGuard, PoisonError};

pub trait ThreadPolicy: Default {
    /// Held for the duration of one facade operation.
    type Guard<'a>
    where
        Self: 'a;

    fn enter(&self) -> Self::Guard<'_>;
}

/// No synchronization. The facade can be moved to another thread but not shared.
#[derive(Debug, Default)]
pub struct SingleThread {
    _not_sync: PhantomData<Cell<()>>,
}

impl ThreadPolicy for SingleThread {
    type Guard<'a> = ();

    #[inline(always)]
    fn enter(&self) -> Self::Guard<'_> {}
}

/// Serializes facade operations with a mutex.
#[derive(Debug, Default)]
pub struct MultiThread {
    lock: Mutex<()>,
}

impl ThreadPolicy for MultiThread {
    type Guard<'a> = MutexGuard<'a, ()>;

    /// A poisoned lock is entered anyway since it guards no data of its own.
    #[inline]
    fn enter(&self) -> Self::Guard<'_> {
        self.lock.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_1() {
        let policy = Arc::new(MultiThread::default());
        let clone = Arc::clone(&policy);
        let _ = thread::spawn(move || {
            let _guard = clone.enter();
            panic!("Poison the lock.");
        })
        .join();
        assert!(policy.lock.is_poisoned());
        let _guard = policy.enter();
    }

    #[test]
    fn test_2() {
        let policy = SingleThread::default();
        policy.enter();
    }
}
