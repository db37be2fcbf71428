use std::{
    io::{BufWriter, Write},
    thread,
    time::{Duration, Instant},
};

use anyhow::{Result, bail};
use clap::Args;
use owo_colors::OwoColorize;
use serde::Serialize;
use serde_json::json;
use testbox::{
    dispatcher::{QueueKind, QueuedMessage, ReceivedMessage},
    hexlist::HexList,
    settings::Settings,
};

use super::{Cli, open_channel};

const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Print the messages the configured device sends, sorted by queue.
#[derive(Args)]
pub struct ListenCommand {
    /// How many seconds to listen
    #[arg(short, long, default_value_t = 10)]
    duration: u64,

    /// Only print these queues (e.g. EVENT, ERROR, PAIRING)
    #[arg(short, long = "queue", value_parser = parse_queue)]
    queues: Vec<QueueKind>,
}

impl ListenCommand {
    pub fn execute(&self, root: &Cli, settings: &Settings) -> Result<()> {
        let chan = open_channel(settings)?;
        let dispatcher = chan.dispatcher();
        let kinds = if self.queues.is_empty() {
            QueueKind::ALL.to_vec()
        } else {
            self.queues.clone()
        };

        let mut stdout = BufWriter::new(anstream::stdout());
        let deadline = Instant::now() + Duration::from_secs(self.duration);

        while Instant::now() < deadline {
            let mut idle = true;
            for &kind in &kinds {
                while let Some(entry) = dispatcher.queue(kind).try_get() {
                    idle = false;
                    let listened = ListenedMessage::new(kind, &entry);
                    if root.json {
                        writeln!(stdout, "{}", json!(listened))?;
                    } else {
                        listened.write_to(&mut stdout)?;
                    }
                }
            }
            stdout.flush()?;

            if !chan.is_connected() {
                bail!("the device was disconnected");
            }
            if idle {
                thread::sleep(POLL_INTERVAL);
            }
        }

        if !root.json {
            let stats = dispatcher.stats();
            writeln!(
                stdout,
                "{}",
                format!(
                    "{} orphans, {} unknown reports, {} unparsed, {} VLP sequence errors",
                    stats.orphans,
                    stats.unknown_reports,
                    stats.unparsed,
                    stats.vlp_sequence_errors
                )
                .bright_black()
            )?;
            stdout.flush()?;
        }
        chan.close();

        Ok(())
    }
}

/// Finds a queue by its upper-case name, ignoring case.
fn parse_queue(src: &str) -> Result<QueueKind, String> {
    QueueKind::ALL
        .into_iter()
        .find(|kind| kind.name().eq_ignore_ascii_case(src))
        .ok_or_else(|| {
            let names = QueueKind::ALL.map(QueueKind::name).join(", ");
            format!("unknown queue {src:?}, expected one of {names}")
        })
}

#[derive(Clone, PartialEq, Eq, Debug, Serialize)]
struct ListenedMessage {
    timestamp_ns: u64,
    queue: QueueKind,
    kind: &'static str,
    report: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<String>,
}

impl ListenedMessage {
    fn new(queue: QueueKind, entry: &QueuedMessage) -> Self {
        let (kind, report, details) = describe(&entry.message);

        Self {
            timestamp_ns: entry.timestamp_ns,
            queue,
            kind,
            report: report.to_string(),
            details,
        }
    }

    fn write_to(&self, out: &mut impl Write) -> Result<()> {
        writeln!(
            out,
            "{} {} {} {}",
            format!("{:>12.3}", self.timestamp_ns as f64 / 1e6).bright_black(),
            format!("{:<12}", self.queue.name()).bright_blue(),
            self.report,
            self.details.as_deref().unwrap_or_default().green(),
        )?;

        Ok(())
    }
}

fn describe(message: &ReceivedMessage) -> (&'static str, HexList, Option<String>) {
    match message {
        ReceivedMessage::Hidpp(message) => {
            ("hidpp", message.to_report(), Some(message.to_string()))
        },
        ReceivedMessage::Vlp(message) => ("vlp", message.to_report(), Some(message.to_string())),
        ReceivedMessage::Hidpp1(message) => (
            "hidpp1",
            message.to_report(),
            Some(format!("register {:#04x}", message.address)),
        ),
        ReceivedMessage::VlpAck(report) => ("vlp_ack", report.clone(), None),
        ReceivedMessage::Error(error) => {
            ("error", error.report.clone(), Some(error.error.to_string()))
        },
        ReceivedMessage::Input(input) => ("input", input.report.clone(), None),
        ReceivedMessage::Pairing(notification) => {
            let header = HexList::from([
                notification.report_id,
                notification.device_index,
                notification.event_type,
            ]);
            let details = match notification.connection() {
                Some(connection) => format!("{connection:?}"),
                None => format!("{:?}", notification.notification_type()),
            };
            ("pairing", header + &notification.parameters, Some(details))
        },
        ReceivedMessage::Raw { diagnostic, report } => {
            ("raw", report.clone(), Some(format!("{diagnostic:?}")))
        },
        other => ("other", HexList::new(), Some(format!("{other:?}"))),
    }
}

#[cfg(test)]
mod tests {
    use testbox::error::Diagnostic;

    use super::*;

    #[test]
    fn parses_queue_names() {
        assert_eq!(parse_queue("event"), Ok(QueueKind::Event));
        assert_eq!(parse_queue("VLP_EVENT"), Ok(QueueKind::VlpEvent));
        assert!(parse_queue("events").is_err());
    }

    #[test]
    fn describes_raw_entries() {
        let report = HexList::from([0x20, 0x01, 0x02]);
        let (kind, described, details) = describe(&ReceivedMessage::Raw {
            diagnostic: Diagnostic::UnknownReport,
            report: report.clone(),
        });

        assert_eq!(kind, "raw");
        assert_eq!(described, report);
        assert_eq!(details.as_deref(), Some("UnknownReport"));
    }
}
