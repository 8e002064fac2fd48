use clap::Parser;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Serial device carrying telemetry. Use `sim://` for a simulated device.
    pub device: Option<String>,
}
