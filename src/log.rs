use log::{LevelFilter, Log, Metadata, Record};
use once_cell::sync::Lazy;
use std::sync::{Arc, RwLock};

struct SilentLogger;

impl Log for SilentLogger {
    fn enabled(&self, _: &Metadata) -> bool {
        false
    }

    fn log(&self, _: &Record) {}

    fn flush(&self) {}
}

/// The `log` facade accepts exactly one global logger per process, but the
/// right sink changes over a run: stderr before any client is attached,
/// DAP `output` events once a session owns the transport. The global is
/// therefore this proxy, and sessions swap the sink underneath it.
#[derive(Clone)]
pub struct SinkSwitcher {
    sink: Arc<RwLock<Box<dyn Log>>>,
}

pub static LOGGER: Lazy<SinkSwitcher> = Lazy::new(|| {
    let switcher = SinkSwitcher {
        sink: Arc::new(RwLock::new(Box::new(SilentLogger))),
    };

    log::set_boxed_logger(Box::new(switcher.clone())).expect("first and only logger installation");
    log::set_max_level(LevelFilter::Debug);

    switcher
});

impl SinkSwitcher {
    /// Replaces the active sink and the global maximum level.
    pub fn switch<L: Log + 'static>(&self, logger: L, level_filter: LevelFilter) {
        *self.sink.write().unwrap() = Box::new(logger);
        log::set_max_level(level_filter);
    }
}

impl Log for SinkSwitcher {
    fn enabled(&self, metadata: &Metadata) -> bool {
        self.sink.read().unwrap().enabled(metadata)
    }

    fn log(&self, record: &Record) {
        self.sink.read().unwrap().log(record)
    }

    fn flush(&self) {
        self.sink.read().unwrap().flush()
    }
}
