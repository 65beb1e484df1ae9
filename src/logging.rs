use chrono::Local;
use log::{Level, LevelFilter, Metadata, Record, SetLoggerError};
use serde::Serialize;
use tokio::sync::broadcast;

/// Capacity of the live log channel
const LOG_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Serialize, Clone, PartialEq)]
pub struct LogMessage {
    pub level: String,
    pub message: String,
    pub timestamp: String,
}

/// Writes records to stderr and forwards them to live-log subscribers.
pub struct LogForwarder {
    sender: broadcast::Sender<LogMessage>,
    level: Level,
}

impl LogForwarder {
    pub fn new(level: Level) -> Self {
        let (sender, _) = broadcast::channel(LOG_CHANNEL_CAPACITY);
        Self { sender, level }
    }

    /// Subscribes to the records logged from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<LogMessage> {
        self.sender.subscribe()
    }

    fn to_message(record: &Record) -> LogMessage {
        LogMessage {
            level: record.level().to_string(),
            message: record.args().to_string(),
            timestamp: Local::now().to_rfc3339(),
        }
    }
}

impl log::Log for LogForwarder {
    fn enabled(&self, metadata: &Metadata) -> bool {
        metadata.level() <= self.level
    }

    fn log(&self, record: &Record) {
        if self.enabled(record.metadata()) {
            let message = Self::to_message(record);
            eprintln!("{} [{}] {}", message.timestamp, message.level, message.message);
            // no live viewer is fine
            let _ = self.sender.send(message);
        }
    }

    fn flush(&self) {}
}

/// Installs the forwarder as the global logger and returns a receiver for
/// the live log.
pub fn init(level: Level) -> Result<broadcast::Receiver<LogMessage>, SetLoggerError> {
    let forwarder = LogForwarder::new(level);
    let receiver = forwarder.subscribe();
    log::set_boxed_logger(Box::new(forwarder))?;
    log::set_max_level(level.to_level_filter());
    Ok(receiver)
}

/// Level filter matching a verbosity name, defaulting to Info
pub fn level_from_name(name: &str) -> LevelFilter {
    name.parse().unwrap_or(LevelFilter::Info)
}
