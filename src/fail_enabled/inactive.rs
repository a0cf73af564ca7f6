/// Evaluates to the second argument if fail is enabled, otherwise the third argument.
///
/// Stub used when the `fail-enabled` feature is off: always takes the disabled branch.
#[macro_export]
macro_rules! if_fail_enabled_else(($n: ident, $enabled: expr, $disabled: expr $(,)?) => {{
    let _ = stringify!($n);
    $disabled
}});

/// Executes the given statement if fail is enabled
#[macro_export]
macro_rules! if_fail_enabled(($n: ident, $e: expr $(,)?) => {{
    $crate::if_fail_enabled_else!($n, $e, ());
}});

/// Returns the given error type (converted with into()) if fail is enabled
#[macro_export]
macro_rules! return_err_if_fail_enabled(($n: ident, $f: expr $(,)?) => {{
    $crate::if_fail_enabled!($n, return Err($f.into()));
}});
