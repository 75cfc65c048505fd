use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing_subscriber::{filter::LevelFilter, prelude::*, registry, EnvFilter, Layer};

#[derive(Error, Debug)]
pub enum LoggerError {
    #[error("the path `{0}` does not point to a file")]
    NotAFile(PathBuf),

    #[error("could not create log directory `{path}`: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Sets up logging to the console and to `file_path`, and adds a panic hook pointing at
/// the log file.
///
/// Console verbosity follows `RUST_LOG` and defaults to `info`. The file always records
/// `info` and above. Does nothing when a global subscriber is already installed.
pub fn install_logger(file_path: &Path) -> Result<(), LoggerError> {
    let file_name = file_path
        .file_name()
        .ok_or_else(|| LoggerError::NotAFile(file_path.to_path_buf()))?;
    let directory = match file_path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    std::fs::create_dir_all(directory).map_err(|source| LoggerError::Io {
        path: directory.to_path_buf(),
        source,
    })?;

    let file_layer = tracing_subscriber::fmt::layer()
        .with_ansi(false)
        .with_writer(tracing_appender::rolling::never(directory, file_name))
        .with_filter(LevelFilter::INFO);

    let console_filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();
    let console_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_filter(console_filter);

    if registry()
        .with(file_layer)
        .with(console_layer)
        .try_init()
        .is_ok()
    {
        update_panic_hook(file_path);
    }

    Ok(())
}

fn update_panic_hook(file_path: &Path) {
    let hook = std::panic::take_hook();
    let file_path = file_path.display().to_string();

    std::panic::set_hook(Box::new(move |info| {
        log::error!("PANIC => {info}");
        eprintln!(
            "=== PANIC ===\nA fatal error happened, you can check the experiment logs here => \
             '{file_path}'\n============="
        );
        hook(info);
    }));
}
