//! Define dynamically-scoped display switches.

/// Defines a thread-local boolean that is only set for the dynamic extent of a closure. Handy for
/// [`std::fmt::Debug`] impls, whose signature is fixed, but which want to offer more than one
/// "view" (e.g., an IL listing with or without debug locations).
macro_rules! dynamic_variable {
    ($varname:ident, $with_var_set:ident, $if_var_set:ident) => {
        thread_local! {
            static $varname: std::cell::Cell<bool> = std::cell::Cell::new(false);
        }
        #[allow(non_snake_case)]
        pub fn $with_var_set<T>(f: impl FnOnce() -> T) -> T {
            $varname.with(|var_x| {
                let old_x = var_x.replace(true);
                let res = f();
                var_x.replace(old_x);
                res
            })
        }
        #[allow(non_snake_case)]
        fn $if_var_set<T>(then_f: impl FnOnce() -> T, else_f: impl FnOnce() -> T) -> T {
            $varname.with(|var_x| if var_x.get() { then_f() } else { else_f() })
        }
    };
}

pub(crate) use dynamic_variable;
