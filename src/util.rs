use crate::sync::{AtomicBool, Ordering};

/// A simple utility to dynamically assert that a section of code or data is
/// accessed by a single thread at a time.
///
/// Workpiles use it in debug builds to catch owner-side operations (push, pop)
/// issued from two threads at once. Only use this for debugging.
pub struct ExclusiveCheck<T> {
    lock: AtomicBool,
    tag: T
}

impl<T: std::fmt::Debug> ExclusiveCheck<T> {
    pub fn with_tag(tag: T) -> Self {
        ExclusiveCheck {
            lock: AtomicBool::new(false),
            tag,
        }
    }

    pub fn tag(&self) -> &T { &self.tag }

    pub fn begin(&self) {
        let res = self.lock.compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed);
        assert!(res.is_ok(), "Exclusive check failed (begin): {:?}", self.tag);
    }

    pub fn end(&self) {
        let res = self.lock.compare_exchange(true, false, Ordering::Release, Ordering::Relaxed);
        assert!(res.is_ok(), "Exclusive check failed (end): {:?}", self.tag);
    }

    /// Run `f` inside a begin/end pair.
    #[inline]
    pub fn run<R>(&self, f: impl FnOnce() -> R) -> R {
        self.begin();
        let result = f();
        self.end();

        result
    }
}

#[test]
fn exclu_check_sequential() {
    let check = ExclusiveCheck::with_tag("workpile#0");

    check.begin();
    check.end();

    assert_eq!(check.run(|| 42), 42);
    assert_eq!(*check.tag(), "workpile#0");
}

#[test]
#[should_panic]
fn exclu_check_nested() {
    let check = ExclusiveCheck::with_tag(());

    check.run(|| check.run(|| ()));
}
