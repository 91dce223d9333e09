use std::{
    io::{BufWriter, Write},
    path::PathBuf,
};

use anyhow::Result;
use clap::Args;
use hidpp_dispatch::{dispatcher, transport::RawTransport};
use owo_colors::OwoColorize;
use serde::Serialize;
use serde_json::json;

use super::{Cli, open};

/// Show the identity of a hidraw node and the HID++ reports it declares.
#[derive(Args)]
pub struct InfoCommand {
    /// The hidraw node to open, e.g. /dev/hidraw0
    path: PathBuf,
}

impl InfoCommand {
    pub fn execute(&self, root: &Cli) -> Result<()> {
        let mut stdout = BufWriter::new(anstream::stdout());

        let transport = open(&self.path)?;
        let (supports_short, supports_long) = dispatcher::supports_short_long_hidpp(&transport)?;

        let info = NodeInfo {
            path: self.path.display().to_string(),
            name: transport.name().to_string(),
            vendor_id: transport.vendor_id(),
            product_id: transport.product_id(),
            supports_short,
            supports_long,
        };

        if root.json {
            writeln!(stdout, "{}", json!(info))?;
            stdout.flush()?;
            return Ok(());
        }

        writeln!(
            stdout,
            "{}: {} ({:#06x}:{:#06x})",
            info.path.bright_black(),
            info.name,
            info.vendor_id.bright_black(),
            info.product_id.bright_black()
        )?;
        writeln!(stdout, " ├─ SHORT REPORTS: {}", support(info.supports_short))?;
        writeln!(stdout, " ╰─ LONG REPORTS: {}", support(info.supports_long))?;

        if !info.supports_short && !info.supports_long {
            writeln!(stdout)?;
            writeln!(
                stdout,
                "{}",
                "This node does not speak HID++.".bright_black().italic()
            )?;
        }

        stdout.flush()?;

        Ok(())
    }
}

fn support(supported: bool) -> String {
    if supported {
        "yes".green().to_string()
    } else {
        "no".red().to_string()
    }
}

#[derive(Clone, PartialEq, Eq, Hash, Debug, Serialize)]
struct NodeInfo {
    path: String,
    name: String,
    vendor_id: u16,
    product_id: u16,
    supports_short: bool,
    supports_long: bool,
}
