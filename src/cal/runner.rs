//! Ways of carrying out a step's action.

use std::{
    fs::{File, OpenOptions},
    path::{Path, PathBuf},
    process::{Command, ExitStatus, Stdio},
};

use log::{info, trace};
use thiserror::Error;

use super::steps::{Action, ExternalCommand, LogSink};

#[derive(Error, Debug)]
pub enum RunError {
    #[error("Couldn't open the log file {}: {source}", .file.display())]
    Log {
        file: PathBuf,
        source: std::io::Error,
    },

    #[error("Couldn't run {program}: {source}")]
    Spawn {
        program: String,
        source: std::io::Error,
    },

    #[error("{program} exited with {status}")]
    Exit { program: String, status: ExitStatus },

    #[error("Couldn't remove {}: {source}", .file.display())]
    Remove {
        file: PathBuf,
        source: std::io::Error,
    },
}

/// Something that can carry out actions.
pub trait CommandRunner {
    fn execute(&mut self, action: &Action) -> Result<(), RunError>;
}

/// Runs external tools as child processes, one at a time.
pub struct SystemRunner {
    main_log: PathBuf,
}

impl SystemRunner {
    /// Tool output without its own log file is appended to `main_log`.
    pub fn new(main_log: &Path) -> SystemRunner {
        SystemRunner {
            main_log: main_log.to_path_buf(),
        }
    }

    /// The log file, opened twice: once for stdout and once for stderr.
    fn open_log(&self, sink: &LogSink, dir: Option<&Path>) -> Result<(File, File), RunError> {
        let resolve = |p: &Path| match dir {
            Some(d) if p.is_relative() => d.join(p),
            _ => p.to_path_buf(),
        };
        let (file, append) = match sink {
            LogSink::Main => (self.main_log.clone(), true),
            LogSink::NewFile(p) => (resolve(p), false),
            LogSink::AppendFile(p) => (resolve(p), true),
        };
        let opened = if append {
            OpenOptions::new().create(true).append(true).open(&file)
        } else {
            File::create(&file)
        };
        opened
            .and_then(|log| Ok((log.try_clone()?, log)))
            .map_err(|source| RunError::Log { file, source })
    }

    fn run(&self, command: &ExternalCommand) -> Result<(), RunError> {
        let (log, err_log) = self.open_log(&command.log, command.dir.as_deref())?;

        let mut process = Command::new(&command.program);
        process
            .args(&command.args)
            .stdin(Stdio::null())
            .stdout(Stdio::from(log))
            .stderr(Stdio::from(err_log));
        if let Some(dir) = &command.dir {
            process.current_dir(dir);
        }
        trace!("Running {command}");
        let status = process.status().map_err(|source| RunError::Spawn {
            program: command.program.clone(),
            source,
        })?;
        if status.success() {
            Ok(())
        } else {
            Err(RunError::Exit {
                program: command.program.clone(),
                status,
            })
        }
    }
}

impl CommandRunner for SystemRunner {
    fn execute(&mut self, action: &Action) -> Result<(), RunError> {
        match action {
            Action::Run(command) => self.run(command),
            Action::RemoveFile(file) => {
                std::fs::remove_file(file).map_err(|source| RunError::Remove {
                    file: file.clone(),
                    source,
                })
            }
        }
    }
}

/// Logs every action instead of carrying it out.
#[derive(Debug, Default)]
pub struct DryRunRunner;

impl CommandRunner for DryRunRunner {
    fn execute(&mut self, action: &Action) -> Result<(), RunError> {
        info!("Would run: {action}");
        Ok(())
    }
}

/// Records actions, failing the programs it's told to.
#[cfg(test)]
pub(crate) struct RecordingRunner {
    actions: Vec<Action>,
    failing: Vec<String>,
}

#[cfg(test)]
impl RecordingRunner {
    pub(crate) fn new() -> RecordingRunner {
        RecordingRunner::failing::<[&str; 0]>([])
    }

    pub(crate) fn failing<I: IntoIterator<Item = &'static str>>(programs: I) -> RecordingRunner {
        RecordingRunner {
            actions: vec![],
            failing: programs.into_iter().map(str::to_string).collect(),
        }
    }

    /// The programs run so far, with their arguments.
    pub(crate) fn commands(&self) -> Vec<String> {
        self.actions.iter().map(|a| a.to_string()).collect()
    }
}

#[cfg(test)]
impl CommandRunner for RecordingRunner {
    fn execute(&mut self, action: &Action) -> Result<(), RunError> {
        use std::os::unix::process::ExitStatusExt;

        self.actions.push(action.clone());
        match action {
            Action::Run(c) if self.failing.contains(&c.program) => Err(RunError::Exit {
                program: c.program.clone(),
                // A wait status for exit code 1.
                status: ExitStatus::from_raw(1 << 8),
            }),
            _ => Ok(()),
        }
    }
}
