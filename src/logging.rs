use log::{Level, LevelFilter, Metadata, Record};
use std::sync::OnceLock;
use std::time::SystemTime;

static BOOT_TIME: OnceLock<SystemTime> = OnceLock::new();
static INSTALLED: OnceLock<()> = OnceLock::new();

#[allow(dead_code)]
mod colors {
    pub const RESET: &str = "\x1b[0m";
    pub const BRIGHT_RED: &str = "\x1b[91m";
    pub const BRIGHT_YELLOW: &str = "\x1b[93m";
    pub const BRIGHT_GREEN: &str = "\x1b[92m";
    pub const BRIGHT_BLUE: &str = "\x1b[94m";
    pub const GRAY: &str = "\x1b[90m";
}

/// Logger that prints colored, boot-elapsed-timestamped lines
struct UpdateLogger;

impl log::Log for UpdateLogger {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= log::max_level()
    }

    fn log(&self, record: &Record) {
        if !self.enabled(record.metadata()) {
            return;
        }

        // Time since boot
        let boot_time = BOOT_TIME.get_or_init(SystemTime::now);
        let elapsed = SystemTime::now()
            .duration_since(*boot_time)
            .unwrap_or_default();
        let seconds = elapsed.as_secs();
        let millis = elapsed.subsec_millis();
        let ts_compact = if seconds < 60 {
            format!("{:>3}.{:03}s", seconds, millis)
        } else if seconds < 3600 {
            format!("{:>2}m{:02}s", seconds / 60, seconds % 60)
        } else {
            format!("{:>2}h{:02}m", seconds / 3600, (seconds % 3600) / 60)
        };

        let (color, level_str) = match record.level() {
            Level::Error => (colors::BRIGHT_RED, "ERROR"),
            Level::Warn => (colors::BRIGHT_YELLOW, "WARN "),
            Level::Info => (colors::BRIGHT_GREEN, "INFO "),
            Level::Debug => (colors::BRIGHT_BLUE, "DEBUG"),
            Level::Trace => (colors::GRAY, "TRACE"),
        };

        let target = record.target();
        let module = target.rsplit("::").next().unwrap_or(target);

        println!(
            "{}[{}] {} {}: {}{}",
            color,
            ts_compact,
            level_str,
            module,
            record.args(),
            colors::RESET
        );
    }

    fn flush(&self) {}
}

static LOGGER: UpdateLogger = UpdateLogger;

/// Install the logger. Safe to call more than once; later calls are no-ops.
pub fn init() {
    init_with_level(LevelFilter::Info);
}

pub fn init_with_level(level: LevelFilter) {
    INSTALLED.get_or_init(|| {
        BOOT_TIME.get_or_init(SystemTime::now);
        if log::set_logger(&LOGGER).is_ok() {
            log::set_max_level(level);
        }
    });
}
