use std::io::{BufWriter, Write};

use anyhow::{Context, Result};
use clap::Args;
use hidapi::HidApi;
use itertools::Itertools;
use owo_colors::OwoColorize;
use serde_json::json;
use testbox::settings::Settings;

use super::Cli;
use crate::hidapi_impl;

/// List the HID interfaces matching the configured vendor and product ID.
///
/// HID++ capable interfaces are numbered the way `port_index` selects them.
#[derive(Args)]
pub struct ListCommand {
    /// Also list interfaces declaring no HID++ or VLP reports
    #[arg(short, long)]
    all: bool,
}

impl ListCommand {
    pub fn execute(&self, root: &Cli, settings: &Settings) -> Result<()> {
        let api = HidApi::new().context("could not initialize hidapi")?;
        let interfaces = hidapi_impl::enumerate(&api, settings)
            .into_iter()
            .filter(|interface| self.all || interface.is_hidpp())
            .collect_vec();

        let mut stdout = BufWriter::new(anstream::stdout());

        if root.json {
            writeln!(stdout, "{}", json!(interfaces))?;
            stdout.flush()?;
            return Ok(());
        }

        if interfaces.is_empty() {
            writeln!(
                stdout,
                "{}",
                "No matching HID interfaces were found.".bright_black()
            )?;
            stdout.flush()?;
            return Ok(());
        }

        let mut port_index = 0;
        for (interface_i, interface) in interfaces.into_iter().enumerate() {
            if interface_i != 0 {
                writeln!(stdout)?;
            }

            let label = if interface.is_hidpp() {
                port_index += 1;
                format!("#{}", port_index - 1).bright_blue().to_string()
            } else {
                "-".bright_black().to_string()
            };
            writeln!(
                stdout,
                "{label} {} ({:#06x}:{:#06x}, interface {})",
                interface.product.as_deref().unwrap_or("Unknown device"),
                interface.vendor_id.bright_black(),
                interface.product_id.bright_black(),
                interface.interface_number,
            )?;

            writeln!(stdout, " ├─ PATH: {}", interface.path_display.bright_black())?;
            if let Some(serial_number) = &interface.serial_number {
                writeln!(stdout, " ├─ SERIAL NUMBER: {}", serial_number.bright_black())?;
            }
            writeln!(
                stdout,
                " ╰─ REPORTS: {}",
                if interface.reports.is_empty() {
                    "none".red().to_string()
                } else {
                    interface
                        .reports
                        .iter()
                        .map(|report| format!("{report:?}"))
                        .join(", ")
                        .green()
                        .to_string()
                }
            )?;
        }

        stdout.flush()?;

        Ok(())
    }
}
