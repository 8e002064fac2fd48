#![allow(dead_code)]

use std::{
    collections::VecDeque,
    io::{self, ErrorKind, Read},
    sync::Mutex,
    thread,
    time::Duration,
};

use pulsar_relay::device::{DeviceOpener, DeviceStream};

pub const EXAMPLE_LINE: &str = r#"{"timestamp":1000,"position":{"x":1.0,"y":2.0,"accuracy":0.5},"wifi":{},"ble":{},"fusion":{"wifi_weight":0.6,"ble_weight":0.4}}"#;

pub fn sample_line(x: f64) -> String {
    format!(
        r#"{{"timestamp":1000,"position":{{"x":{x:?},"y":0.0,"accuracy":0.5}},"wifi":{{}},"ble":{{}},"fusion":{{"wifi_weight":0.5,"ble_weight":0.5}}}}"#
    )
}

pub enum Step {
    Data(Vec<u8>),
    Fail,
}

impl Step {
    pub fn line(line: &str) -> Self {
        Step::Data(format!("{line}\n").into_bytes())
    }
}

/// Plays back a fixed script, then idles with read timeouts like a quiet port.
pub struct ScriptedDevice {
    steps: VecDeque<Step>,
}

impl Read for ScriptedDevice {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.steps.pop_front() {
            Some(Step::Data(mut data)) => {
                let n = buf.len().min(data.len());
                buf[..n].copy_from_slice(&data[..n]);
                if n < data.len() {
                    self.steps.push_front(Step::Data(data.split_off(n)));
                }
                Ok(n)
            }
            Some(Step::Fail) => Err(io::Error::new(ErrorKind::BrokenPipe, "device unplugged")),
            None => {
                thread::sleep(Duration::from_millis(5));
                Err(io::Error::new(ErrorKind::TimedOut, "no data"))
            }
        }
    }
}

/// Hands out one scripted session per successful open. `None` sessions, and
/// every open after the script runs out, fail.
#[derive(Default)]
pub struct ScriptedOpener {
    sessions: Mutex<VecDeque<Option<Vec<Step>>>>,
    opened: Mutex<Vec<String>>,
}

impl ScriptedOpener {
    pub fn new(sessions: Vec<Option<Vec<Step>>>) -> Self {
        Self {
            sessions: Mutex::new(sessions.into()),
            opened: Mutex::new(Vec::new()),
        }
    }

    pub fn attempts(&self) -> Vec<String> {
        self.opened.lock().unwrap().clone()
    }
}

impl DeviceOpener for ScriptedOpener {
    fn open(&self, address: &str) -> io::Result<DeviceStream> {
        self.opened.lock().unwrap().push(address.to_string());
        match self.sessions.lock().unwrap().pop_front() {
            Some(Some(steps)) => Ok(Box::new(ScriptedDevice {
                steps: steps.into(),
            })),
            _ => Err(io::Error::new(ErrorKind::NotFound, "no such device")),
        }
    }
}
