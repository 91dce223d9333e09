use std::{
    io::Write,
    ops::ControlFlow,
    path::PathBuf,
    sync::Arc,
    thread,
    time::{Duration, Instant},
};

use anyhow::Result;
use clap::Args;
use hidpp_dispatch::{
    dispatcher::{Dispatcher, DispatcherThread, ListenerKey, SimpleDispatcher},
    driver::Driver,
    protocol::v10::MessageType,
    report::{DeviceIndex, Report, ReportType},
};
use itertools::Itertools;
use owo_colors::OwoColorize;
use serde::Serialize;
use tracing::{debug, warn};

use super::{Cli, open};

/// How often the threaded monitor checks whether it should end.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Print incoming HID++ reports.
///
/// Without any key, the connection and disconnection notifications of every
/// device index are printed.
#[derive(Args)]
pub struct MonitorCommand {
    /// The hidraw node to open, e.g. /dev/hidraw0
    path: PathBuf,

    /// Print reports matching DEVICE:SUB_ID, e.g. 1:0x41 or default:0x8f
    #[arg(short, long = "key", value_parser = parse_key)]
    keys: Vec<ListenerKey>,

    /// Stop after this many milliseconds instead of running until killed
    #[arg(long)]
    duration_ms: Option<u64>,

    /// Read on a background thread and print from a worker thread
    #[arg(long)]
    threaded: bool,
}

impl MonitorCommand {
    pub fn execute(&self, root: &Cli) -> Result<()> {
        let keys = if self.keys.is_empty() {
            default_keys()
        } else {
            self.keys.clone()
        };
        let duration = self.duration_ms.map(Duration::from_millis);
        let json = root.json;

        debug!(keys = keys.len(), threaded = self.threaded, "starting monitor");

        if self.threaded {
            self.monitor_threaded(&keys, duration, json)
        } else {
            self.monitor_simple(&keys, duration, json)
        }
    }

    fn monitor_simple(
        &self,
        keys: &[ListenerKey],
        duration: Option<Duration>,
        json: bool,
    ) -> Result<()> {
        let dispatcher = SimpleDispatcher::new(open(&self.path)?)?;

        for &(device_index, sub_id) in keys {
            dispatcher.register_event_handler(
                device_index,
                sub_id,
                Box::new(move |report: &Report| {
                    print(report, json);
                    ControlFlow::Continue(())
                }),
            );
        }

        if let Some(duration) = duration {
            let stop = dispatcher.stop_handle();
            thread::spawn(move || {
                thread::sleep(duration);
                if let Err(err) = stop.stop() {
                    warn!(error = %err, "could not stop the monitor");
                }
            });
        }

        dispatcher.listen()?;
        Ok(())
    }

    fn monitor_threaded(
        &self,
        keys: &[ListenerKey],
        duration: Option<Duration>,
        json: bool,
    ) -> Result<()> {
        let dispatcher = Arc::new(DispatcherThread::new(open(&self.path)?)?);
        let driver = Driver::spawn(Arc::clone(&dispatcher), keys, move |report| {
            print(&report, json);
        })?;

        let deadline = duration.map(|duration| Instant::now() + duration);
        while dispatcher.is_running() && deadline.is_none_or(|deadline| Instant::now() < deadline) {
            thread::sleep(POLL_INTERVAL);
        }

        let unplugged = !dispatcher.is_running();
        driver.shutdown();
        dispatcher.stop();

        if unplugged {
            anyhow::bail!("the device was closed");
        }

        Ok(())
    }
}

/// The HID++1.0 connection notifications of every device index.
fn default_keys() -> Vec<ListenerKey> {
    DeviceIndex::ALL
        .into_iter()
        .cartesian_product([
            u8::from(MessageType::DeviceDisconnection),
            u8::from(MessageType::DeviceConnection),
        ])
        .collect()
}

/// Parses `DEVICE:SUB_ID`. The device is `default`, `receiver`, `corded` or a
/// number, the sub ID a decimal or `0x`-prefixed hexadecimal byte.
fn parse_key(s: &str) -> Result<ListenerKey, String> {
    let (device, sub_id) = s
        .split_once(':')
        .ok_or_else(|| format!("expected DEVICE:SUB_ID, got `{s}`"))?;

    let device_index = match device.to_ascii_lowercase().as_str() {
        "default" | "receiver" => DeviceIndex::Default,
        "corded" => DeviceIndex::Corded,
        other => {
            let raw = parse_byte(other)?;
            DeviceIndex::try_from(raw).map_err(|_| format!("unknown device index {raw:#04x}"))?
        },
    };

    Ok((device_index, parse_byte(sub_id)?))
}

fn parse_byte(s: &str) -> Result<u8, String> {
    let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => u8::from_str_radix(hex, 16),
        None => s.parse(),
    };

    parsed.map_err(|err| format!("invalid byte `{s}`: {err}"))
}

fn print(report: &Report, json: bool) {
    if let Err(err) = write_report(&mut anstream::stdout(), report, json) {
        warn!(error = %err, "could not print report");
    }
}

fn write_report(out: &mut impl Write, report: &Report, json: bool) -> Result<()> {
    if json {
        let monitored = MonitoredReport {
            report_type: report.report_type(),
            device_index: report.device_index(),
            sub_id: report.sub_id(),
            address: report.address(),
            parameters: report.parameters(),
        };
        writeln!(out, "{}", serde_json::to_string(&monitored)?)?;
        return Ok(());
    }

    let report_type = match report.report_type() {
        ReportType::Short => "short",
        ReportType::Long => "long ",
    };

    writeln!(
        out,
        "{} {} {:#04x} {:#04x} {}",
        report_type.bright_black(),
        report.device_index().bright_blue(),
        report.sub_id().green(),
        report.address().yellow(),
        report
            .parameters()
            .iter()
            .map(|byte| format!("{byte:02x}"))
            .join(" ")
    )?;

    Ok(())
}

#[derive(Serialize)]
struct MonitoredReport<'a> {
    report_type: ReportType,
    device_index: DeviceIndex,
    sub_id: u8,
    address: u8,
    parameters: &'a [u8],
}
