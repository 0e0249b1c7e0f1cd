//! Injected logging sink.
//!
//! Components never touch a global logger directly: each holds a
//! [`Telemetry`] handle tagged with its component name, and the sink behind
//! it decides where records go. [`LogSink`] forwards to the `log` facade.

use std::fmt;
use std::sync::Arc;

use log::Level;

pub trait TelemetrySink: Send + Sync {
    fn record(&self, level: Level, component: &str, message: fmt::Arguments<'_>);
}

/// Forwards records to the `log` facade, using the component as target.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

impl TelemetrySink for LogSink {
    fn record(&self, level: Level, component: &str, message: fmt::Arguments<'_>) {
        log::log!(target: component, level, "{}", message);
    }
}

#[derive(Clone)]
pub struct Telemetry {
    sink: Arc<dyn TelemetrySink>,
    component: &'static str,
}

impl Telemetry {
    pub fn new(sink: Arc<dyn TelemetrySink>) -> Self {
        Self {
            sink,
            component: "engine",
        }
    }

    /// Same sink, different component tag.
    pub fn component(&self, component: &'static str) -> Self {
        Self {
            sink: Arc::clone(&self.sink),
            component,
        }
    }

    pub fn name(&self) -> &'static str {
        self.component
    }

    pub fn error(&self, message: fmt::Arguments<'_>) {
        self.sink.record(Level::Error, self.component, message);
    }

    pub fn warn(&self, message: fmt::Arguments<'_>) {
        self.sink.record(Level::Warn, self.component, message);
    }

    pub fn info(&self, message: fmt::Arguments<'_>) {
        self.sink.record(Level::Info, self.component, message);
    }

    pub fn debug(&self, message: fmt::Arguments<'_>) {
        self.sink.record(Level::Debug, self.component, message);
    }

    pub fn trace(&self, message: fmt::Arguments<'_>) {
        self.sink.record(Level::Trace, self.component, message);
    }
}

impl Default for Telemetry {
    fn default() -> Self {
        Self::new(Arc::new(LogSink))
    }
}

impl fmt::Debug for Telemetry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Telemetry")
            .field("component", &self.component)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    #[derive(Default)]
    struct Collect(Mutex<Vec<(Level, String, String)>>);

    impl TelemetrySink for Collect {
        fn record(&self, level: Level, component: &str, message: fmt::Arguments<'_>) {
            self.0
                .lock()
                .unwrap()
                .push((level, component.to_string(), message.to_string()));
        }
    }

    #[test]
    fn test_component_tags_share_sink() {
        let sink = Arc::new(Collect::default());
        let root = Telemetry::new(sink.clone());
        let video = root.component("video");

        root.info(format_args!("setup {} channels", 2));
        video.debug(format_args!("composited frame {}", 40_000));

        let records = sink.0.lock().unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0], (Level::Info, "engine".to_string(), "setup 2 channels".to_string()));
        assert_eq!(records[1].1, "video");
        assert_eq!(video.name(), "video");
    }
}
