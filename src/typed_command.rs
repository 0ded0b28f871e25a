use std::ffi::{OsStr, OsString};
use std::marker::PhantomData;
use std::process::{Command, Stdio};

use anyhow::Context;
use shell_quote::QuoteInto;
use tracing::{debug, info};

use crate::zfs_types::{parse_listing, FromColumns};

/// Decodes what a tool wrote to stdout.
pub trait OutputType: Sized {
    fn parse(stdout: Vec<u8>) -> anyhow::Result<Self>;
}

pub struct IgnoreOutput;
impl OutputType for IgnoreOutput {
    fn parse(_: Vec<u8>) -> anyhow::Result<Self> {
        Ok(IgnoreOutput)
    }
}

pub struct StringOutput(pub String);
impl OutputType for StringOutput {
    fn parse(stdout: Vec<u8>) -> anyhow::Result<Self> {
        String::from_utf8(stdout)
            .map(StringOutput)
            .context("command output is not UTF-8")
    }
}

/// One item per line of `-H` style output. Undecodable output fails the whole command;
/// individual lines that don't parse are dropped.
pub struct TabularOutput<T>(pub Vec<T>);
impl<T: FromColumns> OutputType for TabularOutput<T> {
    fn parse(stdout: Vec<u8>) -> anyhow::Result<Self> {
        let StringOutput(text) = StringOutput::parse(stdout)?;
        Ok(TabularOutput(parse_listing(&text)))
    }
}

pub trait Runnable<Output: OutputType> {
    /// Run to completion and decode stdout.
    fn run(&self) -> anyhow::Result<Output>;
}
pub trait DryRunnable {
    /// Log the command instead of running it when `dry_run` is set.
    fn run_or_dry_run(&self, dry_run: bool) -> anyhow::Result<()>;
}
/// Only commands whose output is ignored can be skipped without the caller noticing.
impl<T: Runnable<IgnoreOutput> + std::fmt::Display> DryRunnable for T {
    fn run_or_dry_run(&self, dry_run: bool) -> anyhow::Result<()> {
        if dry_run {
            info!("DRY RUN: {}", self);
            return Ok(());
        }
        self.run().map(|IgnoreOutput| ())
    }
}

/// A program and its arguments, tagged with how its stdout is decoded. Each `run` spawns a
/// fresh process with stdin closed and the C locale, so output is stable to parse.
pub struct TypedCommand<Output> {
    program: OsString,
    args: Vec<OsString>,
    output: PhantomData<fn() -> Output>,
}
impl<Output> TypedCommand<Output> {
    pub fn new(program: impl AsRef<OsStr>) -> Self {
        TypedCommand {
            program: program.as_ref().to_owned(),
            args: Vec::new(),
            output: PhantomData,
        }
    }

    pub fn arg(&mut self, arg: impl AsRef<OsStr>) -> &mut Self {
        self.args.push(arg.as_ref().to_owned());
        self
    }
    pub fn args<I>(&mut self, args: I) -> &mut Self
    where
        I: IntoIterator,
        I::Item: AsRef<OsStr>,
    {
        self.args.extend(args.into_iter().map(|a| a.as_ref().to_owned()));
        self
    }

    pub fn get_program(&self) -> &OsStr {
        &self.program
    }
    pub fn get_args(&self) -> impl Iterator<Item = &OsStr> {
        self.args.iter().map(OsString::as_os_str)
    }
}
impl<Output: OutputType> Runnable<Output> for TypedCommand<Output> {
    fn run(&self) -> anyhow::Result<Output> {
        debug!("RUN: `{}`", self);

        let result = Command::new(&self.program)
            .args(&self.args)
            .env("LC_ALL", "C")
            .stdin(Stdio::null())
            .output()
            .with_context(|| format!("failed to start `{}`", self))?;
        if !result.status.success() {
            anyhow::bail!(
                "`{}` exited with {:?}\nStdout:\n{}\nStderr:\n{}",
                self,
                result.status.code(),
                String::from_utf8_lossy(&result.stdout),
                String::from_utf8_lossy(&result.stderr),
            );
        }
        Output::parse(result.stdout).with_context(|| format!("bad output from `{}`", self))
    }
}
impl<Output> std::fmt::Display for TypedCommand<Output> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut line = self.get_program().to_owned();
        for arg in self.get_args() {
            line.push(" ");
            shell_quote::Sh::quote_into(arg, &mut line);
        }
        f.write_str(&line.to_string_lossy())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::zfs_types::Pool;

    #[test]
    fn display_quotes_arguments() {
        let mut c = TypedCommand::<IgnoreOutput>::new("zfs");
        c.arg("snapshot").arg("tank/a b@x");
        let rendered = c.to_string();
        assert!(rendered.starts_with("zfs snapshot "));
        assert_ne!(rendered, "zfs snapshot tank/a b@x");
    }

    #[test]
    fn tabular_output_drops_bad_lines() {
        let TabularOutput(pools) =
            TabularOutput::<Pool>::parse(b"tank 2T 500G 1.5T - 10% 80% 1.20x ONLINE -\nnope\n".to_vec()).unwrap();
        assert_eq!(pools.len(), 1);
    }

    #[test]
    fn tabular_output_rejects_non_utf8() {
        assert!(TabularOutput::<Pool>::parse(vec![0xff, 0xfe, b'\n']).is_err());
    }

    #[cfg(unix)]
    #[test]
    fn run_surfaces_exit_status() {
        let mut ok = TypedCommand::<StringOutput>::new("sh");
        ok.args(["-c", "echo $LC_ALL"]);
        assert_eq!(ok.run().unwrap().0, "C\n");

        let mut failing = TypedCommand::<StringOutput>::new("sh");
        failing.args(["-c", "echo oops >&2; exit 3"]);
        let err = failing.run().err().unwrap();
        assert!(format!("{:#}", err).contains("oops"));
    }

    #[cfg(unix)]
    #[test]
    fn dry_run_does_not_execute() {
        let mut c = TypedCommand::<IgnoreOutput>::new("sh");
        c.args(["-c", "exit 1"]);
        assert!(c.run_or_dry_run(true).is_ok());
        assert!(c.run_or_dry_run(false).is_err());
    }
}
