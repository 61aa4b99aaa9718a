use log::LevelFilter;
use log4rs::append::console::ConsoleAppender;
use log4rs::append::file::FileAppender;
use log4rs::config::{Appender, Config, Root};
use log4rs::encode::pattern::PatternEncoder;
use log4rs::Handle;
use thiserror::Error;

const LOG_PATTERN: &str = "{d(%Y-%m-%d %H:%M:%S%.3f)} {l:<5} [{M}] {m}{n}";

/// Sets up logging to file and optionally to stdout
///
/// # Arguments
///
/// * 'log_path' - path to the log file
/// * 'log_level' - the level to log on
/// * 'log_to_stdout' - whether to also log to stdout
pub fn setup_logger(log_path: &str, log_level: LevelFilter, log_to_stdout: bool) -> Result<Handle, LoggerError> {
    let file = FileAppender::builder()
        .encoder(Box::new(PatternEncoder::new(LOG_PATTERN)))
        .build(log_path)?;

    let mut builder = Config::builder()
        .appender(Appender::builder().build("file", Box::new(file)));
    let mut root = Root::builder().appender("file");

    if log_to_stdout {
        let stdout = ConsoleAppender::builder()
            .encoder(Box::new(PatternEncoder::new(LOG_PATTERN)))
            .build();
        builder = builder.appender(Appender::builder().build("stdout", Box::new(stdout)));
        root = root.appender("stdout");
    }

    let config = builder.build(root.build(log_level))?;

    Ok(log4rs::init_config(config)?)
}

/// Error depicting errors that occur while setting up logging
///
#[derive(Debug, Error)]
pub enum LoggerError {
    #[error("FileAppenderError: {0}")]
    FileAppenderError(#[from] std::io::Error),
    #[error("ConfigError: {0}")]
    ConfigError(#[from] log4rs::config::runtime::ConfigErrors),
    #[error("SetLoggerError: {0}")]
    SetLoggerError(#[from] log::SetLoggerError),
}
