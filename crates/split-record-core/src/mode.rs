//! Per-thread resolution mode for base-type instantiation.
//!
//! By default a base row is materialised as its implementation. Inside
//! [`as_base_instance`] it is materialised as the plain base object, which is
//! how an implementation reaches its own base without resolving back into an
//! implementation again.

use std::cell::Cell;

thread_local! {
    static BASE_INSTANCE_MODE: Cell<bool> = const { Cell::new(false) };
}

/// Whether base-type loads on this thread currently return plain base objects.
#[must_use]
pub fn base_instance_mode() -> bool {
    BASE_INSTANCE_MODE.with(Cell::get)
}

/// Restores the previous mode on drop, including during unwinding.
struct ModeGuard {
    previous: bool,
}

impl ModeGuard {
    fn enter(mode: bool) -> Self {
        let previous = BASE_INSTANCE_MODE.with(|flag| flag.replace(mode));
        Self { previous }
    }
}

impl Drop for ModeGuard {
    fn drop(&mut self) {
        BASE_INSTANCE_MODE.with(|flag| flag.set(self.previous));
    }
}

/// Run `f` with base instance mode switched on for the current thread.
pub fn as_base_instance<T>(f: impl FnOnce() -> T) -> T {
    let _guard = ModeGuard::enter(true);
    f()
}

/// Run `f` with base instance mode switched off, e.g. to resolve an
/// implementation from inside an [`as_base_instance`] scope.
pub fn as_implementation<T>(f: impl FnOnce() -> T) -> T {
    let _guard = ModeGuard::enter(false);
    f()
}

#[cfg(test)]
mod tests {
    use std::panic;
    use std::sync::mpsc;
    use std::thread;

    use super::*;

    #[test]
    fn scope_sets_and_clears_the_flag() {
        assert!(!base_instance_mode());
        let inside = as_base_instance(base_instance_mode);
        assert!(inside);
        assert!(!base_instance_mode());
    }

    #[test]
    fn nested_scopes_restore_the_outer_mode() {
        as_base_instance(|| {
            as_base_instance(|| assert!(base_instance_mode()));
            assert!(
                base_instance_mode(),
                "inner scope must not clear the outer one"
            );
            as_implementation(|| assert!(!base_instance_mode()));
            assert!(base_instance_mode());
        });
        assert!(!base_instance_mode());
    }

    #[test]
    fn flag_is_restored_after_error_and_panic() {
        let result: Result<(), String> = as_base_instance(|| Err("boom".to_string()));
        assert!(result.is_err());
        assert!(!base_instance_mode());

        let unwound = panic::catch_unwind(|| as_base_instance(|| panic!("inside scope")));
        assert!(unwound.is_err());
        assert!(!base_instance_mode());
    }

    #[test]
    fn flag_is_not_shared_between_threads() {
        let (entered_tx, entered_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();

        let worker = thread::spawn(move || {
            as_base_instance(|| {
                let _ = entered_tx.send(());
                let _ = release_rx.recv();
                base_instance_mode()
            })
        });

        let _ = entered_rx.recv();
        assert!(!base_instance_mode());
        let _ = release_tx.send(());

        assert!(worker.join().is_ok_and(|seen| seen));
    }
}
