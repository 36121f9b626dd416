//! Status and log emission toward the embedding front-end.

pub type StatusCallback = std::sync::Arc<dyn Fn(&str, Option<u8>) + Send + Sync>;
pub type LogCallback = std::sync::Arc<dyn Fn(&str) + Send + Sync>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum Verbosity {
    #[default]
    Errors,
    Info,
    Debug,
}

impl Verbosity {
    pub fn from_occurrences(occurrences: u8) -> Self {
        match occurrences {
            0 => Verbosity::Errors,
            1 => Verbosity::Info,
            _ => Verbosity::Debug,
        }
    }
}

/// Fans engine messages out to the optional status/log callbacks and mirrors
/// them onto `tracing` so CLI users get them for free with `-v`.
#[derive(Clone, Default)]
pub struct Reporter {
    status: Option<StatusCallback>,
    log: Option<LogCallback>,
    verbosity: Verbosity,
}

impl Reporter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_status(mut self, callback: StatusCallback) -> Self {
        self.status = Some(callback);
        self
    }

    #[must_use]
    pub fn with_log(mut self, callback: LogCallback) -> Self {
        self.log = Some(callback);
        self
    }

    #[must_use]
    pub fn with_verbosity(mut self, verbosity: Verbosity) -> Self {
        self.verbosity = verbosity;
        self
    }

    pub fn status(&self, message: &str, percent: Option<u8>) {
        if let Some(callback) = &self.status {
            callback(message, percent);
        }
        match percent {
            Some(percent) => tracing::info!("[{percent:>3}%] {message}"),
            None => tracing::info!("{message}"),
        }
    }

    pub fn error(&self, message: &str) {
        tracing::error!("{message}");
        self.emit(Verbosity::Errors, message);
    }

    pub fn info(&self, message: &str) {
        tracing::info!("{message}");
        self.emit(Verbosity::Info, message);
    }

    pub fn debug(&self, message: &str) {
        tracing::debug!("{message}");
        self.emit(Verbosity::Debug, message);
    }

    fn emit(&self, level: Verbosity, message: &str) {
        if level > self.verbosity {
            return;
        }
        if let Some(callback) = &self.log {
            callback(message);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collecting_reporter(
        verbosity: Verbosity,
    ) -> (Reporter, std::sync::Arc<std::sync::Mutex<Vec<String>>>) {
        let lines = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = lines.clone();
        let reporter = Reporter::new()
            .with_verbosity(verbosity)
            .with_log(std::sync::Arc::new(move |line: &str| {
                sink.lock().unwrap().push(line.to_string());
            }));
        (reporter, lines)
    }

    #[test]
    fn default_verbosity_only_passes_errors() {
        let (reporter, lines) = collecting_reporter(Verbosity::Errors);
        reporter.error("bad");
        reporter.info("chatty");
        reporter.debug("noise");
        assert_eq!(*lines.lock().unwrap(), vec!["bad".to_string()]);
    }

    #[test]
    fn debug_verbosity_passes_everything() {
        let (reporter, lines) = collecting_reporter(Verbosity::Debug);
        reporter.error("bad");
        reporter.info("chatty");
        reporter.debug("noise");
        assert_eq!(lines.lock().unwrap().len(), 3);
    }

    #[test]
    fn verbosity_maps_from_flag_occurrences() {
        assert_eq!(Verbosity::from_occurrences(0), Verbosity::Errors);
        assert_eq!(Verbosity::from_occurrences(1), Verbosity::Info);
        assert_eq!(Verbosity::from_occurrences(2), Verbosity::Debug);
        assert_eq!(Verbosity::from_occurrences(7), Verbosity::Debug);
    }

    #[test]
    fn status_reaches_status_callback() {
        let seen = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = seen.clone();
        let reporter = Reporter::new().with_status(std::sync::Arc::new(
            move |message: &str, percent: Option<u8>| {
                sink.lock().unwrap().push((message.to_string(), percent));
            },
        ));
        reporter.status("halfway", Some(50));
        assert_eq!(
            *seen.lock().unwrap(),
            vec![("halfway".to_string(), Some(50))]
        );
    }
}
