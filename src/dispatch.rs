// src/dispatch.rs - Gesture to actuator mapping and GPIO backends
use std::io::{Read, Write};
use std::net::TcpStream;
use std::time::Duration;

use anyhow::Context;
use thiserror::Error;

use crate::config::{ActuatorBackend, ActuatorConfig};
use crate::gesture::Gesture;

/// The two digital outputs the rig drives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OutputLine {
    /// Power switch (Lumos / Nox).
    Switch,
    /// Trinket trigger (Colovaria).
    Trinket,
}

#[derive(Debug, Error)]
pub enum ActuatorError {
    #[error("actuator I/O failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("pigpio rejected command {command} with code {code}")]
    Rejected { command: u32, code: i32 },
}

pub trait Actuator: Send {
    fn set_level(&mut self, line: OutputLine, high: bool) -> Result<(), ActuatorError>;

    /// Drives `line` low, holds, then drives it high again.
    fn pulse(&mut self, line: OutputLine, hold: Duration) -> Result<(), ActuatorError> {
        self.set_level(line, false)?;
        std::thread::sleep(hold);
        self.set_level(line, true)
    }
}

/// Logs the levels it would set; used when no GPIO daemon is configured.
#[derive(Debug, Default)]
pub struct DryRunActuator;

impl Actuator for DryRunActuator {
    fn set_level(&mut self, line: OutputLine, high: bool) -> Result<(), ActuatorError> {
        tracing::debug!("GPIO {:?} -> {}", line, if high { "HIGH" } else { "LOW" });
        Ok(())
    }
}

const PI_CMD_MODES: u32 = 0;
const PI_CMD_WRITE: u32 = 4;
const PI_OUTPUT: u32 = 1;

/// Talks to a running pigpio daemon over its socket interface.
pub struct PigpioActuator {
    stream: TcpStream,
    switch_pin: u32,
    trinket_pin: u32,
}

impl PigpioActuator {
    pub fn connect(config: &ActuatorConfig) -> anyhow::Result<Self> {
        let stream = TcpStream::connect(&config.address)
            .with_context(|| format!("Cannot reach pigpio daemon at {}", config.address))?;
        stream.set_nodelay(true)?;

        let mut actuator = Self {
            stream,
            switch_pin: config.switch_pin,
            trinket_pin: config.trinket_pin,
        };
        for pin in [config.switch_pin, config.trinket_pin] {
            actuator
                .command(PI_CMD_MODES, pin, PI_OUTPUT)
                .with_context(|| format!("Cannot set GPIO {} to output", pin))?;
        }
        tracing::debug!(
            "pigpio connected at {} (switch GPIO {}, trinket GPIO {})",
            config.address,
            config.switch_pin,
            config.trinket_pin
        );
        Ok(actuator)
    }

    fn pin(&self, line: OutputLine) -> u32 {
        match line {
            OutputLine::Switch => self.switch_pin,
            OutputLine::Trinket => self.trinket_pin,
        }
    }

    /// Sends one 16-byte request and reads the 16-byte reply; the last word
    /// of the reply is the signed result.
    fn command(&mut self, command: u32, p1: u32, p2: u32) -> Result<i32, ActuatorError> {
        let mut request = [0u8; 16];
        request[0..4].copy_from_slice(&command.to_le_bytes());
        request[4..8].copy_from_slice(&p1.to_le_bytes());
        request[8..12].copy_from_slice(&p2.to_le_bytes());
        self.stream.write_all(&request)?;

        let mut reply = [0u8; 16];
        self.stream.read_exact(&mut reply)?;
        let code = i32::from_le_bytes([reply[12], reply[13], reply[14], reply[15]]);
        if code < 0 {
            return Err(ActuatorError::Rejected { command, code });
        }
        Ok(code)
    }
}

impl Actuator for PigpioActuator {
    fn set_level(&mut self, line: OutputLine, high: bool) -> Result<(), ActuatorError> {
        let pin = self.pin(line);
        self.command(PI_CMD_WRITE, pin, high as u32).map(|_| ())
    }
}

pub struct ActionDispatcher {
    actuator: Box<dyn Actuator>,
    pulse_hold: Duration,
}

impl ActionDispatcher {
    pub fn new(actuator: Box<dyn Actuator>, pulse_hold: Duration) -> Self {
        Self { actuator, pulse_hold }
    }

    pub fn from_config(config: &ActuatorConfig) -> anyhow::Result<Self> {
        let actuator: Box<dyn Actuator> = match config.backend {
            ActuatorBackend::DryRun => Box::new(DryRunActuator),
            ActuatorBackend::Pigpio => Box::new(PigpioActuator::connect(config)?),
        };
        Ok(Self::new(actuator, config.pulse_hold()))
    }

    /// Fires the action bound to `gesture`. Blocks for the pulse hold on
    /// Colovaria. Actuator failures are logged and otherwise ignored.
    pub fn dispatch(&mut self, gesture: Gesture) {
        tracing::info!("CAST: {}", gesture);
        let result = match gesture {
            Gesture::Lumos => self.actuator.set_level(OutputLine::Switch, true),
            Gesture::Nox => self.actuator.set_level(OutputLine::Switch, false),
            Gesture::Colovaria => self.actuator.pulse(OutputLine::Trinket, self.pulse_hold),
        };
        if let Err(e) = result {
            tracing::warn!("{} could not drive its actuator: {}", gesture, e);
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::sync::{Arc, Mutex};

    /// Records every level change; shared with the test through the Arc.
    #[derive(Clone, Default)]
    pub(crate) struct RecordingActuator {
        pub(crate) levels: Arc<Mutex<Vec<(OutputLine, bool)>>>,
    }

    impl Actuator for RecordingActuator {
        fn set_level(&mut self, line: OutputLine, high: bool) -> Result<(), ActuatorError> {
            self.levels.lock().unwrap().push((line, high));
            Ok(())
        }
    }

    struct BrokenActuator;

    impl Actuator for BrokenActuator {
        fn set_level(&mut self, _line: OutputLine, _high: bool) -> Result<(), ActuatorError> {
            Err(ActuatorError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "daemon went away",
            )))
        }
    }

    #[test]
    fn gestures_map_to_lines() {
        let recorder = RecordingActuator::default();
        let mut dispatcher = ActionDispatcher::new(Box::new(recorder.clone()), Duration::ZERO);

        dispatcher.dispatch(Gesture::Lumos);
        dispatcher.dispatch(Gesture::Nox);
        dispatcher.dispatch(Gesture::Colovaria);

        assert_eq!(
            *recorder.levels.lock().unwrap(),
            vec![
                (OutputLine::Switch, true),
                (OutputLine::Switch, false),
                (OutputLine::Trinket, false),
                (OutputLine::Trinket, true),
            ]
        );
    }

    #[test]
    fn actuator_failures_do_not_escape() {
        let mut dispatcher = ActionDispatcher::new(Box::new(BrokenActuator), Duration::ZERO);
        dispatcher.dispatch(Gesture::Lumos);
        dispatcher.dispatch(Gesture::Colovaria);
    }

    /// Accepts one client and answers each request, echoing the header and
    /// returning `result`; every request is forwarded to the test.
    fn fake_daemon(result: i32, replies: usize) -> (String, std::thread::JoinHandle<Vec<[u32; 3]>>) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let address = listener.local_addr().unwrap().to_string();
        let handle = std::thread::spawn(move || {
            let (mut socket, _) = listener.accept().unwrap();
            let mut seen = Vec::new();
            for _ in 0..replies {
                let mut request = [0u8; 16];
                if socket.read_exact(&mut request).is_err() {
                    break;
                }
                let word = |i: usize| u32::from_le_bytes(request[i..i + 4].try_into().unwrap());
                seen.push([word(0), word(4), word(8)]);
                let mut reply = request;
                reply[12..16].copy_from_slice(&result.to_le_bytes());
                socket.write_all(&reply).unwrap();
            }
            seen
        });
        (address, handle)
    }

    #[test]
    fn pigpio_sets_modes_then_writes_levels() {
        let (address, daemon) = fake_daemon(0, 3);
        let config = ActuatorConfig {
            backend: ActuatorBackend::Pigpio,
            address,
            ..Default::default()
        };

        let mut actuator = PigpioActuator::connect(&config).unwrap();
        actuator.set_level(OutputLine::Switch, true).unwrap();
        drop(actuator);

        let seen = daemon.join().unwrap();
        assert_eq!(
            seen,
            vec![
                [PI_CMD_MODES, 16, PI_OUTPUT],
                [PI_CMD_MODES, 12, PI_OUTPUT],
                [PI_CMD_WRITE, 16, 1],
            ]
        );
    }

    #[test]
    fn pigpio_negative_result_is_a_rejection() {
        let (address, daemon) = fake_daemon(-3, 1);
        let config = ActuatorConfig {
            backend: ActuatorBackend::Pigpio,
            address,
            ..Default::default()
        };

        assert!(PigpioActuator::connect(&config).is_err());
        daemon.join().unwrap();
    }
}
