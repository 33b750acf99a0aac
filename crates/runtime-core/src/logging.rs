//! Tracing setup with a swappable file sink

use crate::Result;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;
use std::sync::{Arc, OnceLock};
use tracing::info;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Process wide file sink used by the file layer of `init_tracing`
static FILE_SINK: OnceLock<FileSink> = OnceLock::new();

fn global_sink() -> &'static FileSink {
    FILE_SINK.get_or_init(FileSink::default)
}

/// Writer target that can be pointed at a new file at any time
///
/// Output is discarded until a file is attached.
#[derive(Clone, Default)]
pub struct FileSink {
    file: Arc<Mutex<Option<File>>>,
}

impl FileSink {
    /// Route all further output to `path`, appending
    pub fn attach(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        *self.file.lock() = Some(file);
        Ok(())
    }

    /// Stop writing to the current file
    pub fn detach(&self) {
        *self.file.lock() = None;
    }

    pub fn is_attached(&self) -> bool {
        self.file.lock().is_some()
    }
}

/// Writer handed out per event by `FileSink`
pub struct FileSinkWriter {
    file: Arc<Mutex<Option<File>>>,
}

impl Write for FileSinkWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.file.lock().as_mut() {
            Some(file) => file.write(buf),
            None => Ok(buf.len()),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.file.lock().as_mut() {
            Some(file) => file.flush(),
            None => Ok(()),
        }
    }
}

impl<'a> MakeWriter<'a> for FileSink {
    type Writer = FileSinkWriter;

    fn make_writer(&'a self) -> Self::Writer {
        FileSinkWriter {
            file: Arc::clone(&self.file),
        }
    }
}

/// Install the global subscriber
///
/// Filter comes from `RUST_LOG`, falling back to `default_filter`. Calling
/// this more than once is harmless.
pub fn init_tracing(default_filter: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter.into());

    let _ = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::fmt::layer()
                .with_ansi(false)
                .with_writer(global_sink().clone()),
        )
        .try_init();
}

/// Send log output of this process to `path` as well
pub fn add_file_handler(path: impl AsRef<Path>) -> Result<()> {
    let path = path.as_ref();
    global_sink().attach(path)?;
    info!(path = %path.display(), "Attached log file");
    Ok(())
}
