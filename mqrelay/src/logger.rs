use std::fs::{File, OpenOptions};
use std::io::{self, Stdout};

use anyhow::Result;
use slog::{b, o, Drain, Level, Record};
use slog_logfmt::Logfmt;

use mqrelay_conf::logging::{Log, To};

pub use slog::Logger;

/// Installs the slog backend behind the `log` facade. Called once at
/// startup; everything else in the process logs through `log::...!`.
pub fn logger_init(cfg: &Log) -> Result<()> {
    let logger = config_logger(cfg.filename.clone(), cfg.to, cfg.level);
    log::set_boxed_logger(Box::new(LoggerEx(logger)))?;
    log::set_max_level(slog_log_to_level(cfg.level).to_level_filter());
    Ok(())
}

struct LoggerEx(Logger);

impl log::Log for LoggerEx {
    fn enabled(&self, _metadata: &log::Metadata) -> bool {
        true
    }

    fn log(&self, r: &log::Record) {
        let level = log_to_slog_level(r.metadata().level());
        let args = r.args();
        let target = r.target();
        let location = &record_as_location(r);
        let s = slog::RecordStatic { location, level, tag: target };

        self.0.log(&slog::Record::new(&s, args, b!()))
    }

    fn flush(&self) {}
}

fn log_to_slog_level(level: log::Level) -> Level {
    match level {
        log::Level::Trace => Level::Trace,
        log::Level::Debug => Level::Debug,
        log::Level::Info => Level::Info,
        log::Level::Warn => Level::Warning,
        log::Level::Error => Level::Error,
    }
}

fn slog_log_to_level(level: Level) -> log::Level {
    match level {
        Level::Trace => log::Level::Trace,
        Level::Debug => log::Level::Debug,
        Level::Info => log::Level::Info,
        Level::Warning => log::Level::Warn,
        Level::Error => log::Level::Error,
        Level::Critical => log::Level::Error,
    }
}

fn record_as_location(r: &log::Record) -> slog::RecordLocation {
    let module = r.module_path_static().unwrap_or("<unknown>");
    let file = r.file_static().unwrap_or("<unknown>");
    let line = r.line().unwrap_or_default();

    slog::RecordLocation { file, line, column: 0, function: "", module }
}

pub fn config_logger(filename: String, to: To, level: Level) -> Logger {
    let drain = Logfmt::new(WriteFilter::new(filename, to))
        .set_prefix(move |io: &mut dyn io::Write, rec: &Record| -> slog::Result {
            write!(
                io,
                "{date} {level_str} {module}.{line} | {msg}\t",
                date = chrono::Local::now().format("%Y-%m-%d %H:%M:%S%.3f"),
                level_str = rec.level().as_short_str(),
                msg = rec.msg(),
                line = rec.line(),
                module = rec.module(),
            )?;

            Ok(())
        })
        .build()
        .fuse();

    let drain = LevelFilter { drain, level }.fuse();

    let drain = slog_async::Async::new(drain)
        .chan_size(4096 * 4)
        .overflow_strategy(slog_async::OverflowStrategy::DropAndReport)
        .build()
        .fuse();

    Logger::root(drain, o!())
}

struct LevelFilter<D> {
    drain: D,
    level: Level,
}

impl<D> Drain for LevelFilter<D>
where
    D: Drain,
{
    type Ok = Option<D::Ok>;
    type Err = Option<D::Err>;

    fn log(
        &self,
        record: &slog::Record,
        values: &slog::OwnedKVList,
    ) -> std::result::Result<Self::Ok, Self::Err> {
        if record.level().is_at_least(self.level) {
            self.drain.log(record, values).map(Some).map_err(Some)
        } else {
            Ok(None)
        }
    }
}

struct WriteFilter {
    filename: String,
    to: To,

    file: Option<File>,
    console: Stdout,
}

impl WriteFilter {
    fn new(filename: String, to: To) -> Self {
        Self { filename, to, file: None, console: io::stdout() }
    }

    fn file(&mut self) -> io::Result<&File> {
        if self.file.is_none() {
            self.file = Some(open_file(&self.filename)?);
        }
        match self.file.as_ref() {
            Some(file) => Ok(file),
            None => Err(io::Error::other("log file unavailable")),
        }
    }
}

impl io::Write for WriteFilter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = match self.to {
            To::Console => self.console.write(buf)?,
            To::File => self.file()?.write(buf)?,
            To::Both => {
                let _ = self.console.write(buf)?;
                self.file()?.write(buf)?
            }
            To::Off => buf.len(),
        };
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.to {
            To::Console => self.console.flush()?,
            To::File => self.file()?.flush()?,
            To::Both => {
                self.console.flush()?;
                self.file()?.flush()?;
            }
            To::Off => {}
        };
        Ok(())
    }
}

fn open_file(filename: &str) -> io::Result<File> {
    OpenOptions::new().create(true).append(true).open(filename)
}
