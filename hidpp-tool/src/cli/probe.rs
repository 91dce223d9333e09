use std::{
    io::{BufWriter, Write},
    path::PathBuf,
    time::Duration,
};

use anyhow::Result;
use clap::Args;
use hidpp_dispatch::{
    dispatcher::{DispatchError, Dispatcher, SimpleDispatcher},
    nibble::{self, U4},
    protocol::{ProtocolError, v10, v20},
    report::{DeviceIndex, Report, ReportType},
    transport::RawTransport,
};
use owo_colors::OwoColorize;
use serde::Serialize;
use serde_json::json;
use tracing::debug;

use super::{Cli, open};

/// The root feature function returning the protocol version.
const GET_PROTOCOL_VERSION: U4 = U4::from_lo(0x1);

/// Echoed back by HID++2.0 devices.
const PING_DATA: u8 = 0x5a;

/// Detect which device indices answer on a hidraw node and which protocol
/// version they speak.
#[derive(Args)]
pub struct ProbeCommand {
    /// The hidraw node to open, e.g. /dev/hidraw0
    path: PathBuf,

    /// How long to wait for every device index to answer
    #[arg(long, default_value_t = 500)]
    timeout_ms: u64,
}

impl ProbeCommand {
    pub fn execute(&self, root: &Cli) -> Result<()> {
        let mut stdout = BufWriter::new(anstream::stdout());

        let dispatcher = SimpleDispatcher::new(open(&self.path)?)?;
        let timeout = Duration::from_millis(self.timeout_ms);

        let mut indices = Vec::with_capacity(DeviceIndex::ALL.len());
        for device_index in DeviceIndex::ALL {
            let status = probe_index(&dispatcher, device_index, timeout)?;
            debug!(%device_index, ?status, "probed device index");
            indices.push(ProbedIndex {
                device_index,
                status,
            });
        }

        if root.json {
            writeln!(
                stdout,
                "{}",
                json!({
                    "name": dispatcher.name(),
                    "vendor_id": dispatcher.vendor_id(),
                    "product_id": dispatcher.product_id(),
                    "indices": indices,
                })
            )?;
            stdout.flush()?;
            return Ok(());
        }

        writeln!(
            stdout,
            "{} ({:#06x}:{:#06x})",
            dispatcher.name(),
            dispatcher.vendor_id().bright_black(),
            dispatcher.product_id().bright_black()
        )?;
        writeln!(stdout, " │")?;

        let indices_len = indices.len();
        for (i, probed) in indices.into_iter().enumerate() {
            let status = match probed.status {
                ProbeStatus::Hidpp20 {
                    protocol_number,
                    target_software,
                } => format!(
                    "{} {}",
                    "HID++2.0".green(),
                    format!("(protocol {protocol_number}, target software {target_software:#04x})")
                        .bright_black()
                ),
                ProbeStatus::Hidpp10 => "HID++1.0".blue().to_string(),
                ProbeStatus::NotPaired => "not paired".bright_black().italic().to_string(),
                ProbeStatus::Offline => "offline".yellow().to_string(),
                ProbeStatus::Silent => "no answer".bright_black().italic().to_string(),
                ProbeStatus::Rejected { error } => error.red().to_string(),
            };

            writeln!(
                stdout,
                "{} {}: {}",
                if i == indices_len - 1 { " ╰─" } else { " ├─" },
                probed.device_index.bright_blue(),
                status
            )?;
        }

        stdout.flush()?;

        Ok(())
    }
}

/// Pings the root feature of one device index.
fn probe_index<T: RawTransport>(
    dispatcher: &SimpleDispatcher<T>,
    device_index: DeviceIndex,
    timeout: Duration,
) -> Result<ProbeStatus> {
    let request = ping(
        device_index,
        dispatcher.software_ids().get_sw_id(),
        dispatcher.supports_short(),
    )?;

    let response = dispatcher
        .send_command(request)
        .and_then(|response| response.get_timeout(timeout));

    Ok(match response {
        Ok(report) => {
            let params = report.parameters();
            ProbeStatus::Hidpp20 {
                protocol_number: params[0],
                target_software: params[1],
            }
        },
        Err(DispatchError::Protocol(ProtocolError::V10(v10::ErrorType::InvalidSubId))) => {
            ProbeStatus::Hidpp10
        },
        Err(DispatchError::Protocol(ProtocolError::V10(v10::ErrorType::UnknownDevice))) => {
            ProbeStatus::NotPaired
        },
        Err(DispatchError::Protocol(ProtocolError::V10(v10::ErrorType::ResourceError))) => {
            ProbeStatus::Offline
        },
        Err(DispatchError::Protocol(err)) => ProbeStatus::Rejected {
            error: err.to_string(),
        },
        Err(DispatchError::Timeout) => ProbeStatus::Silent,
        Err(err) => return Err(err.into()),
    })
}

/// Builds the root feature ping, as a long report on nodes that do not
/// declare short ones.
fn ping(device_index: DeviceIndex, sw_id: U4, supports_short: bool) -> Result<Report> {
    let params = [0x00, 0x00, PING_DATA];

    let report = if supports_short {
        Report::new_v20(
            device_index,
            v20::ROOT_FEATURE_INDEX,
            GET_PROTOCOL_VERSION,
            sw_id,
            &params,
        )?
    } else {
        Report::new(
            ReportType::Long,
            device_index,
            v20::ROOT_FEATURE_INDEX,
            nibble::combine(GET_PROTOCOL_VERSION, sw_id),
            &params,
        )?
    };

    Ok(report)
}

#[derive(Clone, PartialEq, Eq, Hash, Debug, Serialize)]
struct ProbedIndex {
    device_index: DeviceIndex,

    #[serde(flatten)]
    status: ProbeStatus,
}

#[derive(Clone, PartialEq, Eq, Hash, Debug, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
enum ProbeStatus {
    Hidpp20 {
        protocol_number: u8,
        target_software: u8,
    },
    Hidpp10,
    NotPaired,
    Offline,
    Silent,
    Rejected {
        error: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ping_follows_supported_report_type() {
        let sw_id = U4::from_lo(0x3);

        let short = ping(DeviceIndex::Wireless2, sw_id, true).unwrap();
        assert_eq!(short.report_type(), ReportType::Short);

        let long = ping(DeviceIndex::Wireless2, sw_id, false).unwrap();
        assert_eq!(long.report_type(), ReportType::Long);

        for report in [short, long] {
            assert_eq!(report.device_index(), DeviceIndex::Wireless2);
            assert_eq!(report.feature_index(), v20::ROOT_FEATURE_INDEX);
            assert_eq!(report.function_id(), GET_PROTOCOL_VERSION);
            assert_eq!(report.software_id(), sw_id);
            assert_eq!(&report.parameters()[..3], &[0x00, 0x00, PING_DATA]);
        }
    }
}
