//! Opening the telemetry device.
//!
//! Opens are blocking calls and run on the blocking pool. The returned stream
//! must time out its reads periodically so the reader can notice a stop
//! request between reads.

use std::{
    collections::BTreeMap,
    io::{self, Read},
    thread,
    time::{Duration, Instant},
};

use serialport::{DataBits, Parity, StopBits};

use crate::codec::{self, Beacon, Fusion, Position, Sample};

/// Address prefix selecting the built-in simulated device.
pub const SIMULATED_SCHEME: &str = "sim://";

/// Cadence of the simulated device.
const SIMULATED_PERIOD: Duration = Duration::from_secs(2);

pub type DeviceStream = Box<dyn Read + Send>;

/// Seam between the source reader and whatever produces device bytes.
pub trait DeviceOpener: Send + Sync + 'static {
    fn open(&self, address: &str) -> io::Result<DeviceStream>;
}

/// Opens serial ports at 8N1, or the simulated device for `sim://` addresses.
#[derive(Debug, Clone)]
pub struct PortOpener {
    baud_rate: u32,
    read_timeout: Duration,
}

impl PortOpener {
    pub fn new(baud_rate: u32, read_timeout: Duration) -> Self {
        Self {
            baud_rate,
            read_timeout,
        }
    }
}

impl DeviceOpener for PortOpener {
    fn open(&self, address: &str) -> io::Result<DeviceStream> {
        if address.starts_with(SIMULATED_SCHEME) {
            return Ok(Box::new(SimulatedDevice::new(
                SIMULATED_PERIOD,
                self.read_timeout,
            )));
        }

        let port = serialport::new(address, self.baud_rate)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .timeout(self.read_timeout)
            .open()?;
        Ok(Box::new(port))
    }
}

/// Synthetic device that walks a position back and forth.
///
/// Every period it prints a debug line followed by one JSON sample, the same
/// mix a real board produces.
pub struct SimulatedDevice {
    period: Duration,
    poll: Duration,
    next_at: Instant,
    pending: Vec<u8>,
    tick: u64,
    x: f64,
    y: f64,
    direction: f64,
}

impl SimulatedDevice {
    pub fn new(period: Duration, poll: Duration) -> Self {
        Self {
            period,
            poll,
            next_at: Instant::now(),
            pending: Vec::new(),
            tick: 0,
            x: 1.0,
            y: 1.0,
            direction: 1.0,
        }
    }

    fn step(&mut self) -> Sample {
        self.x += 0.1 * self.direction;
        self.y += 0.05 * self.direction;
        if self.x > 4.0 || self.x < 0.5 {
            self.direction = -self.direction;
        }

        let beacons = |readings: [(i32, f64); 3]| -> BTreeMap<String, Beacon> {
            readings
                .iter()
                .enumerate()
                .map(|(idx, &(rssi, distance))| {
                    let beacon = Beacon {
                        rssi,
                        distance,
                        found: true,
                    };
                    (format!("beacon{}", idx + 1), beacon)
                })
                .collect()
        };

        Sample {
            timestamp: codec::now_millis(),
            position: Position {
                x: self.x,
                y: self.y,
                accuracy: 0.5 + self.x / 10.0,
            },
            wifi: beacons([(-45, 2.1), (-52, 3.4), (-48, 2.8)]),
            ble: beacons([(-65, 2.3), (-72, 3.6), (-68, 3.0)]),
            fusion: Fusion {
                wifi_weight: 0.6,
                ble_weight: 0.4,
            },
            environment: None,
        }
    }

    fn emit(&mut self) -> io::Result<()> {
        self.tick += 1;
        let sample = self.step();
        self.pending
            .extend_from_slice(format!("sim: tick {}\r\n", self.tick).as_bytes());
        serde_json::to_writer(&mut self.pending, &sample)?;
        self.pending.push(b'\n');
        Ok(())
    }
}

impl Read for SimulatedDevice {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.pending.is_empty() {
            let now = Instant::now();
            if now < self.next_at {
                thread::sleep((self.next_at - now).min(self.poll));
                return Err(io::Error::new(io::ErrorKind::TimedOut, "no data yet"));
            }
            self.next_at = now + self.period;
            self.emit()?;
        }

        let n = buf.len().min(self.pending.len());
        buf[..n].copy_from_slice(&self.pending[..n]);
        self.pending.drain(..n);
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::framer::LineFramer;

    #[test]
    fn simulated_device_interleaves_noise_and_samples() {
        let mut device = SimulatedDevice::new(Duration::from_millis(1), Duration::from_millis(1));
        let mut framer = LineFramer::new(4096);
        let mut lines = Vec::new();
        let mut buf = [0u8; 64];

        while lines.len() < 4 {
            match device.read(&mut buf) {
                Ok(n) => lines.extend(framer.feed(&buf[..n])),
                Err(err) => assert_eq!(err.kind(), io::ErrorKind::TimedOut),
            }
        }

        assert_eq!(lines[0], "sim: tick 1");
        assert!(!codec::is_data_line(&lines[0]));
        let first = codec::decode(&lines[1]).expect("sample decodes");
        let second = codec::decode(&lines[3]).expect("sample decodes");
        assert!((first.position.x - 1.1).abs() < 1e-9);
        assert!(second.position.x > first.position.x);
        assert_eq!(first.wifi.len(), 3);
        assert_eq!(first.ble["beacon2"].rssi, -72);
    }

    #[test]
    fn port_opener_routes_simulated_addresses() {
        let opener = PortOpener::new(115_200, Duration::from_millis(10));
        assert!(opener.open("sim://demo").is_ok());
    }
}
