//! Test doubles shared by the unit tests of every session type.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use crate::app::adb::bridge::DeviceBridge;
use crate::app::error::AppError;
use crate::app::registry::ForwardTarget;
use crate::app::viewer::ViewerChannel;
use crate::app::worker::CancelToken;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BridgeCall {
    Shell(String),
    Streaming(String),
    Install(String, Vec<String>),
    Uninstall(String),
    Forward(u16, ForwardTarget),
    Unforward(u16),
    Push(String, String),
}

struct StreamScript {
    needle: String,
    lines: Vec<String>,
    hold_until_cancel: bool,
}

#[derive(Default)]
pub struct FakeBridge {
    calls: Mutex<Vec<BridgeCall>>,
    shell_responses: Mutex<Vec<(String, String)>>,
    properties: Mutex<HashMap<String, String>>,
    scripts: Mutex<Vec<StreamScript>>,
    install_failures: Mutex<usize>,
    shell_broken: Mutex<bool>,
}

impl FakeBridge {
    pub fn new() -> Self {
        Self::default()
    }

    /// Shell commands starting with `prefix` answer `output`. First registered match wins.
    pub fn respond(&self, prefix: &str, output: &str) -> &Self {
        self.shell_responses
            .lock()
            .unwrap()
            .push((prefix.to_string(), output.to_string()));
        self
    }

    pub fn property(&self, key: &str, value: &str) -> &Self {
        self.properties
            .lock()
            .unwrap()
            .insert(key.to_string(), value.to_string());
        self
    }

    /// Streaming commands containing `needle` print `lines`, then either exit or stay up until
    /// cancelled. Scripts sharing a needle are used once each in registration order, the last one
    /// repeats.
    pub fn stream(&self, needle: &str, lines: &[&str], hold_until_cancel: bool) -> &Self {
        self.scripts.lock().unwrap().push(StreamScript {
            needle: needle.to_string(),
            lines: lines.iter().map(|line| line.to_string()).collect(),
            hold_until_cancel,
        });
        self
    }

    pub fn fail_installs(&self, count: usize) -> &Self {
        *self.install_failures.lock().unwrap() = count;
        self
    }

    pub fn break_shell(&self) -> &Self {
        *self.shell_broken.lock().unwrap() = true;
        self
    }

    pub fn calls(&self) -> Vec<BridgeCall> {
        self.calls.lock().unwrap().clone()
    }

    pub fn shell_commands(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                BridgeCall::Shell(command) => Some(command),
                _ => None,
            })
            .collect()
    }

    pub fn streaming_commands(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                BridgeCall::Streaming(command) => Some(command),
                _ => None,
            })
            .collect()
    }

    fn record(&self, call: BridgeCall) {
        self.calls.lock().unwrap().push(call);
    }
}

impl DeviceBridge for FakeBridge {
    fn execute_shell(&self, serial: &str, command: &str) -> Result<String, AppError> {
        self.record(BridgeCall::Shell(command.to_string()));
        if *self.shell_broken.lock().unwrap() {
            return Err(AppError::transport("device offline", serial));
        }
        let responses = self.shell_responses.lock().unwrap();
        Ok(responses
            .iter()
            .find(|(prefix, _)| command.starts_with(prefix.as_str()))
            .map(|(_, output)| output.clone())
            .unwrap_or_default())
    }

    fn execute_shell_streaming(
        &self,
        _serial: &str,
        command: &str,
        cancel: &CancelToken,
        on_line: &mut dyn FnMut(&str),
    ) -> Result<(), AppError> {
        self.record(BridgeCall::Streaming(command.to_string()));
        let (lines, hold) = {
            let mut scripts = self.scripts.lock().unwrap();
            let matching = scripts
                .iter()
                .enumerate()
                .filter(|(_, script)| command.contains(&script.needle))
                .map(|(index, _)| index)
                .collect::<Vec<_>>();
            match matching.as_slice() {
                [] => (Vec::new(), false),
                [only] => (scripts[*only].lines.clone(), scripts[*only].hold_until_cancel),
                [first, ..] => {
                    let script = scripts.remove(*first);
                    (script.lines, script.hold_until_cancel)
                }
            }
        };
        for line in lines {
            on_line(&line);
        }
        if hold {
            while cancel.sleep(Duration::from_millis(10)) {}
        }
        Ok(())
    }

    fn install_package(&self, serial: &str, path: &str, flags: &[&str]) -> Result<(), AppError> {
        self.record(BridgeCall::Install(
            path.to_string(),
            flags.iter().map(|flag| flag.to_string()).collect(),
        ));
        let mut remaining = self.install_failures.lock().unwrap();
        if *remaining > 0 {
            *remaining -= 1;
            return Err(AppError::install(
                format!("INSTALL_FAILED_TEST_ONLY ({} left)", *remaining),
                serial,
            ));
        }
        Ok(())
    }

    fn uninstall_package(&self, _serial: &str, package: &str) -> Result<String, AppError> {
        self.record(BridgeCall::Uninstall(package.to_string()));
        Ok("Success".to_string())
    }

    fn create_forward(&self, _serial: &str, local_port: u16, target: &ForwardTarget) -> Result<(), AppError> {
        self.record(BridgeCall::Forward(local_port, target.clone()));
        Ok(())
    }

    fn remove_forward(&self, _serial: &str, local_port: u16) -> Result<(), AppError> {
        self.record(BridgeCall::Unforward(local_port));
        Ok(())
    }

    fn push_file(&self, _serial: &str, local: &str, remote: &str) -> Result<(), AppError> {
        self.record(BridgeCall::Push(local.to_string(), remote.to_string()));
        Ok(())
    }

    fn get_property(&self, _serial: &str, key: &str) -> Result<Option<String>, AppError> {
        Ok(self.properties.lock().unwrap().get(key).cloned())
    }
}

#[derive(Default)]
pub struct RecordingChannel {
    texts: Mutex<Vec<String>>,
    broken: bool,
}

impl RecordingChannel {
    pub fn failing() -> Self {
        Self {
            texts: Mutex::new(Vec::new()),
            broken: true,
        }
    }

    pub fn texts(&self) -> Vec<String> {
        self.texts.lock().unwrap().clone()
    }

    pub fn messages(&self) -> Vec<serde_json::Value> {
        self.texts()
            .iter()
            .filter_map(|text| serde_json::from_str(text).ok())
            .collect()
    }
}

impl ViewerChannel for RecordingChannel {
    fn send_text(&self, text: &str) -> Result<(), AppError> {
        if self.broken {
            return Err(AppError::transport("viewer closed", ""));
        }
        self.texts.lock().unwrap().push(text.to_string());
        Ok(())
    }
}
