//! Logging initialization. The engine itself never picks a sink; it emits
//! through the `log` facade with a `target:` per subsystem
//! (`"tracer"`, `"rendezvous"`, `"callbacks"`, `"symbols"`,
//! `"singlestep"`, `"debugger"`) so a host binary can filter or route as it
//! likes. This helper wires up `env_logger` reading `RUST_LOG`, which is
//! enough for a standalone engine binary or for the test suite; a real
//! deployment is expected to install its own `log::Log` implementation
//! instead (syslog, append-only file, ...) which is out of scope here.
use std::sync::Once;

static INIT: Once = Once::new();

/// Initialize the default `env_logger` sink. Idempotent: safe to call from
/// multiple tests or multiple `Debugger::init` calls.
pub fn init() {
    INIT.call_once(|| {
        let _ = env_logger::Builder::from_env(env_logger::Env::default()).try_init();
    });
}
