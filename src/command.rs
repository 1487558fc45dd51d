// Copyright 2017, 2018 Pit Kleyersburg <pitkley@googlemail.com>
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified or distributed
// except according to those terms.

//! This module holds the [`CommandFactory`](trait.CommandFactory.html)
//! strategy through which [`Table`](../table/struct.Table.html) reaches the
//! host's save and restore utilities, allowing the subprocess boundary to be
//! shimmed in tests and replaced for dry-runs.

use errors::*;
use std::cell::RefCell;
use std::collections::{BTreeMap, VecDeque};
use std::io::Write;
use std::os::unix::process::ExitStatusExt;
use std::process;
use std::process::{ExitStatus, Output, Stdio};
use std::rc::Rc;

/// Enum identifying a IP protocol version, which selects the save and
/// restore utilities a table talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IPVersion {
    /// IP protocol version 4
    IPv4,

    /// IP protocol version 6
    IPv6,
}

impl IPVersion {
    /// Name of the bulk save utility for this protocol version.
    pub fn save_command(&self) -> &'static str {
        match *self {
            IPVersion::IPv4 => "iptables-save",
            IPVersion::IPv6 => "ip6tables-save",
        }
    }

    /// Name of the bulk restore utility for this protocol version.
    pub fn restore_command(&self) -> &'static str {
        match *self {
            IPVersion::IPv4 => "iptables-restore",
            IPVersion::IPv6 => "ip6tables-restore",
        }
    }
}

/// A runnable external command.
///
/// `run` and `output` block until the command exits; the exit of the
/// subprocess is the sole completion signal this layer offers.
pub trait Command {
    /// Provide data that will be piped to the command's stdin.
    fn set_stdin(&mut self, input: &str);

    /// Run the command to completion, returning its exit status.
    fn run(&mut self) -> Result<ExitStatus> {
        Ok(self.output()?.status)
    }

    /// Run the command to completion, capturing stdout and stderr.
    fn output(&mut self) -> Result<Output>;
}

/// Strategy creating [`Command`](trait.Command.html)s from a program name
/// and its arguments.
pub trait CommandFactory {
    /// Create a command invoking `program` with `args`.
    fn make_command(&self, program: &str, args: &[&str]) -> Box<dyn Command>;
}

/// [`CommandFactory`](trait.CommandFactory.html) implementation spawning
/// real subprocesses through [`std::process::Command`].
///
/// [`std::process::Command`]: https://doc.rust-lang.org/std/process/struct.Command.html
pub struct ProcessCommandFactory;

impl CommandFactory for ProcessCommandFactory {
    fn make_command(&self, program: &str, args: &[&str]) -> Box<dyn Command> {
        let mut command = process::Command::new(program);
        command.args(args);
        Box::new(ProcessCommand {
            program: program.to_owned(),
            command: command,
            stdin: None,
        })
    }
}

struct ProcessCommand {
    program: String,
    command: process::Command,
    stdin: Option<String>,
}

impl Command for ProcessCommand {
    fn set_stdin(&mut self, input: &str) {
        self.stdin = Some(input.to_owned());
    }

    fn output(&mut self) -> Result<Output> {
        self.command
            .stdin(if self.stdin.is_some() {
                Stdio::piped()
            } else {
                Stdio::null()
            })
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        let mut process = self.command.spawn()?;
        if let Some(ref input) = self.stdin {
            match process.stdin.as_mut() {
                Some(ref mut s) => s.write_all(input.as_bytes())?,
                None => Err(format_err!("cannot get stdin of {}", self.program))?,
            }
        }
        // Close stdin so the child sees EOF.
        process.stdin.take();

        Ok(process.wait_with_output()?)
    }
}

/// [`CommandFactory`](trait.CommandFactory.html) implementation whose
/// commands succeed with empty output without touching the host.
///
/// This is used when running with `--dry-run`.
pub struct DummyCommandFactory;

impl CommandFactory for DummyCommandFactory {
    fn make_command(&self, _program: &str, _args: &[&str]) -> Box<dyn Command> {
        Box::new(DummyCommand)
    }
}

struct DummyCommand;

impl Command for DummyCommand {
    fn set_stdin(&mut self, _input: &str) {}

    fn output(&mut self) -> Result<Output> {
        Ok(Output {
            status: ExitStatus::from_raw(0),
            stdout: vec![],
            stderr: vec![],
        })
    }
}

/// A single command invocation recorded by
/// [`LoggingCommandFactory`](struct.LoggingCommandFactory.html).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggedCommand {
    /// The program that was invoked.
    pub program: String,

    /// The arguments the program was invoked with.
    pub args: Vec<String>,

    /// The data piped to the program's stdin, if any.
    pub stdin: Option<String>,
}

#[derive(Default)]
struct LoggingState {
    log: Vec<LoggedCommand>,
    stdout: BTreeMap<String, String>,
    failures: BTreeMap<String, VecDeque<String>>,
}

/// [`CommandFactory`](trait.CommandFactory.html) implementation which does
/// not spawn any subprocesses. It keeps a log of every invocation and
/// replies with configurable canned output, which makes it the shim the
/// test-suite runs tables against.
///
/// ## Note
///
/// State is shared between the factory, its clones and the commands it
/// created through `Rc<RefCell<_>>`; like [`Table`](../table/struct.Table.html)
/// itself this type is confined to a single thread.
#[derive(Clone, Default)]
pub struct LoggingCommandFactory {
    state: Rc<RefCell<LoggingState>>,
}

impl LoggingCommandFactory {
    /// Create a new instance of `LoggingCommandFactory`.
    pub fn new() -> LoggingCommandFactory {
        Default::default()
    }

    /// Canned stdout returned by every invocation of `program`.
    pub fn set_stdout(&self, program: &str, stdout: &str) {
        self.state
            .borrow_mut()
            .stdout
            .insert(program.to_owned(), stdout.to_owned());
    }

    /// Make the next invocation of `program` exit non-zero with `stderr`.
    ///
    /// Queued failures are consumed in order before `program` starts
    /// succeeding again.
    pub fn queue_failure(&self, program: &str, stderr: &str) {
        self.state
            .borrow_mut()
            .failures
            .entry(program.to_owned())
            .or_insert_with(VecDeque::new)
            .push_back(stderr.to_owned());
    }

    /// Get the recorded invocations.
    pub fn logged_commands(&self) -> Vec<LoggedCommand> {
        self.state.borrow().log.clone()
    }

    /// Get the stdin payloads of all recorded invocations of `program`, in
    /// order, skipping invocations that had no stdin.
    pub fn stdin_for(&self, program: &str) -> Vec<String> {
        self.state
            .borrow()
            .log
            .iter()
            .filter(|logged| logged.program == program)
            .filter_map(|logged| logged.stdin.clone())
            .collect()
    }

    /// Number of recorded invocations of `program`.
    pub fn invocations_of(&self, program: &str) -> usize {
        self.state
            .borrow()
            .log
            .iter()
            .filter(|logged| logged.program == program)
            .count()
    }

    /// Forget all recorded invocations.
    pub fn clear_log(&self) {
        self.state.borrow_mut().log.clear();
    }
}

impl CommandFactory for LoggingCommandFactory {
    fn make_command(&self, program: &str, args: &[&str]) -> Box<dyn Command> {
        Box::new(LoggingCommand {
            program: program.to_owned(),
            args: args.iter().map(|e| e.to_string()).collect(),
            stdin: None,
            state: Rc::clone(&self.state),
        })
    }
}

struct LoggingCommand {
    program: String,
    args: Vec<String>,
    stdin: Option<String>,
    state: Rc<RefCell<LoggingState>>,
}

impl Command for LoggingCommand {
    fn set_stdin(&mut self, input: &str) {
        self.stdin = Some(input.to_owned());
    }

    fn output(&mut self) -> Result<Output> {
        let mut state = self.state.borrow_mut();
        state.log.push(LoggedCommand {
            program: self.program.clone(),
            args: self.args.clone(),
            stdin: self.stdin.clone(),
        });

        let failure = state
            .failures
            .get_mut(&self.program)
            .and_then(|queue| queue.pop_front());
        Ok(match failure {
            Some(stderr) => Output {
                // Raw wait status 256 encodes exit code 1.
                status: ExitStatus::from_raw(256),
                stdout: vec![],
                stderr: stderr.into_bytes(),
            },
            None => Output {
                status: ExitStatus::from_raw(0),
                stdout: state
                    .stdout
                    .get(&self.program)
                    .cloned()
                    .unwrap_or_default()
                    .into_bytes(),
                stderr: vec![],
            },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn process_command_pipes_stdin_through_cat() {
        let factory = ProcessCommandFactory;
        let mut command = factory.make_command("cat", &[]);
        command.set_stdin("*filter\nCOMMIT\n");

        let output = command.output().unwrap();
        assert!(output.status.success());
        assert_eq!(String::from_utf8_lossy(&output.stdout), "*filter\nCOMMIT\n");
    }

    #[test]
    fn process_command_reports_failure_status() {
        let factory = ProcessCommandFactory;
        let mut command = factory.make_command("false", &[]);
        assert!(!command.run().unwrap().success());
    }

    #[test]
    fn logging_factory_records_invocations() {
        let factory = LoggingCommandFactory::new();
        factory.set_stdout("iptables-save", "*filter\nCOMMIT\n");

        let mut command = factory.make_command("iptables-save", &["-t", "filter"]);
        let output = command.output().unwrap();
        assert!(output.status.success());
        assert_eq!(String::from_utf8_lossy(&output.stdout), "*filter\nCOMMIT\n");

        assert_eq!(
            factory.logged_commands(),
            vec![LoggedCommand {
                program: "iptables-save".to_owned(),
                args: vec!["-t".to_owned(), "filter".to_owned()],
                stdin: None,
            }]
        );
    }

    #[test]
    fn logging_factory_consumes_queued_failures_in_order() {
        let factory = LoggingCommandFactory::new();
        factory.queue_failure("iptables-restore", "resource busy");

        let mut command = factory.make_command("iptables-restore", &["--noflush", "--verbose"]);
        let output = command.output().unwrap();
        assert!(!output.status.success());
        assert_eq!(String::from_utf8_lossy(&output.stderr), "resource busy");

        let mut command = factory.make_command("iptables-restore", &["--noflush", "--verbose"]);
        assert!(command.output().unwrap().status.success());
    }

    #[cfg(feature = "iptables-tests")]
    #[test]
    fn iptables_save_is_invocable() {
        let factory = ProcessCommandFactory;
        let mut command = factory.make_command("iptables-save", &["-t", "filter"]);
        assert!(command.run().unwrap().success());
    }
}
