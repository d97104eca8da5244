use core::ops::{Deref, DerefMut};

/// Data shared between threads and driver completion.
///
/// Every access happens inside [AtomicSection::enter] and must finish in
/// bounded time without suspending. On hosted targets the section is a spin
/// lock. A target whose drivers complete from interrupt context must also
/// mask that interrupt for the lifetime of the [Section] guard.
#[derive(Debug)]
pub(crate) struct AtomicSection<T> {
    inner: spin::Mutex<T>,
}

/// Access to the data of an [AtomicSection]. The section ends on drop.
pub(crate) struct Section<'s, T> {
    guard: spin::MutexGuard<'s, T>,
}

impl<T> AtomicSection<T> {
    pub(crate) const fn new(value: T) -> AtomicSection<T> {
        AtomicSection {
            inner: spin::Mutex::new(value),
        }
    }

    pub(crate) fn enter(&self) -> Section<'_, T> {
        Section {
            guard: self.inner.lock(),
        }
    }
}

impl<T> Deref for Section<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T> DerefMut for Section<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}

#[cfg(test)]
mod test {
    use std::thread;

    use super::*;

    #[test]
    fn test_sections_exclude_each_other() {
        let counter = AtomicSection::new(0usize);
        thread::scope(|scope| {
            for _ in 0..4 {
                scope.spawn(|| {
                    for _ in 0..1000 {
                        let mut section = counter.enter();
                        let value = *section;
                        *section = value + 1;
                    }
                });
            }
        });
        assert_eq!(*counter.enter(), 4000);
    }
}
