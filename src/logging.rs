// Logger setup for the binary

use std::io::Write;

use env_logger::Env;

/// Install a one-line log format: time, thread, target, message.
/// Honors `RUST_LOG`; defaults to `info`.
pub fn init() {
    let _ = env_logger::Builder::from_env(Env::default().default_filter_or("info"))
        .format(|buf, record| {
            let thread = std::thread::current();
            writeln!(
                buf,
                "{} {} {} {}: {}",
                buf.timestamp_millis(),
                record.level(),
                thread.name().unwrap_or("-"),
                record.target(),
                record.args()
            )
        })
        .try_init();
}
