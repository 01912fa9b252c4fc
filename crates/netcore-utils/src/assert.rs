/// Panics in debug builds, logs an error and continues in release builds.
#[macro_export]
macro_rules! safe_panic {
    ($($arg:tt)*) => {{
        if cfg!(debug_assertions) {
            panic!($($arg)*);
        } else {
            tracing::error!($($arg)*);
        }
    }};
}

/// Like `assert!`, but a failed check only aborts in debug builds.
#[macro_export]
macro_rules! safe_assert {
    ($cond:expr $(,)?) => {
        if !$cond {
            $crate::safe_panic!("assertion failed: {}", stringify!($cond));
        }
    };
    ($cond:expr, $($arg:tt)+) => {
        if !$cond {
            $crate::safe_panic!($($arg)+);
        }
    };
}

/// Like `assert_eq!`, but a failed check only aborts in debug builds.
#[macro_export]
macro_rules! safe_assert_eq {
    ($left:expr, $right:expr $(,)?) => {{
        let (left, right) = (&$left, &$right);
        if *left != *right {
            $crate::safe_panic!(
                "assertion failed: `(left == right)`\n  left: `{:?}`\n right: `{:?}`",
                left,
                right
            );
        }
    }};
}

/// Like `assert_ne!`, but a failed check only aborts in debug builds.
#[macro_export]
macro_rules! safe_assert_ne {
    ($left:expr, $right:expr $(,)?) => {{
        let (left, right) = (&$left, &$right);
        if *left == *right {
            $crate::safe_panic!(
                "assertion failed: `(left != right)`\n  left: `{:?}`\n right: `{:?}`",
                left,
                right
            );
        }
    }};
}

#[cfg(test)]
mod tests {
    #[test]
    fn safe_assert_passes_on_true() {
        safe_assert!(1 + 1 == 2);
    }

    #[test]
    #[should_panic]
    fn safe_assert_panics_in_debug() {
        safe_assert!(1 + 1 == 3, "math broke");
    }

    #[test]
    fn safe_assert_eq_passes() {
        safe_assert_eq!(2 + 2, 4);
    }
}
