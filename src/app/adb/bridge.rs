use std::time::Duration;

use crate::app::adb::runner::{run_command_with_timeout, stream_command_lines, CommandOutput};
use crate::app::config::BridgeSettings;
use crate::app::error::AppError;
use crate::app::registry::ForwardTarget;
use crate::app::worker::CancelToken;

/// Capabilities consumed from the device bridge. The engine never speaks the bridge protocol
/// itself; everything goes through this seam so sessions can run against a fake in tests.
pub trait DeviceBridge: Send + Sync {
    fn execute_shell(&self, serial: &str, command: &str) -> Result<String, AppError>;

    /// Runs a long-lived shell command, feeding each output line to `on_line` until the command
    /// exits or `cancel` fires.
    fn execute_shell_streaming(
        &self,
        serial: &str,
        command: &str,
        cancel: &CancelToken,
        on_line: &mut dyn FnMut(&str),
    ) -> Result<(), AppError>;

    fn install_package(&self, serial: &str, path: &str, flags: &[&str]) -> Result<(), AppError>;

    fn uninstall_package(&self, serial: &str, package: &str) -> Result<String, AppError>;

    fn create_forward(&self, serial: &str, local_port: u16, target: &ForwardTarget) -> Result<(), AppError>;

    fn remove_forward(&self, serial: &str, local_port: u16) -> Result<(), AppError>;

    fn push_file(&self, serial: &str, local: &str, remote: &str) -> Result<(), AppError>;

    fn get_property(&self, serial: &str, key: &str) -> Result<Option<String>, AppError>;
}

/// [`DeviceBridge`] over the `adb` command line.
pub struct AdbCli {
    program: String,
    shell_timeout: Duration,
    install_timeout: Duration,
}

impl AdbCli {
    pub fn new(program: impl Into<String>, settings: &BridgeSettings) -> Self {
        Self {
            program: program.into(),
            shell_timeout: settings.shell_timeout(),
            install_timeout: settings.install_timeout(),
        }
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    fn args(serial: &str, rest: &[&str]) -> Vec<String> {
        let mut args = vec!["-s".to_string(), serial.to_string()];
        args.extend(rest.iter().map(|item| item.to_string()));
        args
    }

    fn run(&self, serial: &str, rest: &[&str], timeout: Duration) -> Result<CommandOutput, AppError> {
        run_command_with_timeout(&self.program, &Self::args(serial, rest), timeout, serial)
    }

    fn run_checked(&self, serial: &str, rest: &[&str], action: &str) -> Result<CommandOutput, AppError> {
        let output = self.run(serial, rest, self.shell_timeout)?;
        if output.success() {
            Ok(output)
        } else {
            Err(AppError::transport(
                format!("{action} failed: {}", output.combined().trim()),
                serial,
            ))
        }
    }
}

pub fn forward_spec(target: &ForwardTarget) -> String {
    match target {
        ForwardTarget::Socket(name) => format!("localabstract:{name}"),
        ForwardTarget::Tcp(port) => format!("tcp:{port}"),
    }
}

impl DeviceBridge for AdbCli {
    fn execute_shell(&self, serial: &str, command: &str) -> Result<String, AppError> {
        Ok(self.run(serial, &["shell", command], self.shell_timeout)?.stdout)
    }

    fn execute_shell_streaming(
        &self,
        serial: &str,
        command: &str,
        cancel: &CancelToken,
        on_line: &mut dyn FnMut(&str),
    ) -> Result<(), AppError> {
        stream_command_lines(
            &self.program,
            &Self::args(serial, &["shell", command]),
            cancel,
            on_line,
            serial,
        )?;
        Ok(())
    }

    fn install_package(&self, serial: &str, path: &str, flags: &[&str]) -> Result<(), AppError> {
        let mut rest = vec!["install"];
        rest.extend_from_slice(flags);
        rest.push(path);
        let output = self.run(serial, &rest, self.install_timeout)?;
        let combined = output.combined();
        if output.success() && combined.contains("Success") {
            return Ok(());
        }
        let cause = combined
            .lines()
            .map(str::trim)
            .find(|line| line.contains("Failure") || line.contains("INSTALL_"))
            .unwrap_or_else(|| combined.trim())
            .to_string();
        Err(AppError::install(cause, serial))
    }

    fn uninstall_package(&self, serial: &str, package: &str) -> Result<String, AppError> {
        let output = self.run(serial, &["uninstall", package], self.install_timeout)?;
        if output.stdout.contains("Success") {
            Ok(output.stdout.trim().to_string())
        } else {
            Err(AppError::install(output.combined().trim().to_string(), serial))
        }
    }

    fn create_forward(&self, serial: &str, local_port: u16, target: &ForwardTarget) -> Result<(), AppError> {
        let local = format!("tcp:{local_port}");
        let remote = forward_spec(target);
        self.run_checked(serial, &["forward", &local, &remote], "forward")?;
        Ok(())
    }

    fn remove_forward(&self, serial: &str, local_port: u16) -> Result<(), AppError> {
        let local = format!("tcp:{local_port}");
        self.run_checked(serial, &["forward", "--remove", &local], "forward --remove")?;
        Ok(())
    }

    fn push_file(&self, serial: &str, local: &str, remote: &str) -> Result<(), AppError> {
        self.run_checked(serial, &["push", local, remote], "push")?;
        Ok(())
    }

    fn get_property(&self, serial: &str, key: &str) -> Result<Option<String>, AppError> {
        let value = self.execute_shell(serial, &format!("getprop {key}"))?;
        let value = value.trim();
        Ok(if value.is_empty() {
            None
        } else {
            Some(value.to_string())
        })
    }
}
