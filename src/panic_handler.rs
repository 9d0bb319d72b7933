use std::panic;

/// Install panic reporting for the binary
///
/// Debug builds get `better-panic` backtraces, release builds the
/// `human-panic` crash report. Either way the panic is also written to the
/// log file. The process is not terminated here: loader panics on render
/// workers are caught and turned into faults for that key.
pub fn initialize_panic_handler() {
    #[cfg(debug_assertions)]
    better_panic::install();

    #[cfg(not(debug_assertions))]
    human_panic::setup_panic!();

    let default_hook = panic::take_hook();
    panic::set_hook(Box::new(move |panic_info| {
        let thread = std::thread::current();
        log::error!(
            "Panic on thread {}: {panic_info}",
            thread.name().unwrap_or("<unnamed>")
        );
        default_hook(panic_info);
    }));
}
