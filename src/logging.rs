//! Logger set-up shared by the binaries.

use std::{
    fs::File,
    io::{self, Write},
};

/// Copies everything written to it to stdout and a file.
pub struct Tee<W: Write> {
    file: W,
}

impl<W: Write> Tee<W> {
    pub fn new(file: W) -> Tee<W> {
        Tee { file }
    }
}

impl<W: Write> Write for Tee<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        io::stdout().write_all(buf)?;
        self.file.write_all(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        io::stdout().flush()?;
        self.file.flush()
    }
}

/// Initialise the global logger. Messages go to stdout, and also to
/// `log_file` if one is given.
pub fn setup_logging(verbosity: u8, log_file: Option<File>) {
    let mut builder = env_logger::Builder::from_default_env();
    match log_file {
        Some(file) => builder.target(env_logger::Target::Pipe(Box::new(Tee::new(file)))),
        None => builder.target(env_logger::Target::Stdout),
    };
    builder.format_target(false);
    match verbosity {
        0 => builder.filter_level(log::LevelFilter::Info),
        1 => builder.filter_level(log::LevelFilter::Debug),
        2 => builder.filter_level(log::LevelFilter::Trace),
        _ => {
            builder.filter_level(log::LevelFilter::Trace);
            builder.format(|buf, record| {
                let timestamp = buf.timestamp();
                let level = record.level();
                let target = record.target();
                let line = record.line().unwrap_or(0);
                let message = record.args();

                writeln!(buf, "[{timestamp} {level} {target}:{line}] {message}")
            })
        }
    };
    builder.init();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tee_keeps_a_copy() {
        let mut tee = Tee::new(Vec::new());
        write!(tee, "hello {}", 42).unwrap();
        tee.flush().unwrap();
        assert_eq!(tee.file, b"hello 42");
    }
}
