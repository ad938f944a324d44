use std::io::IsTerminal;

use clap::ValueEnum;
use comfy_table::{presets::UTF8_FULL, ContentArrangement, Table};
use probelink_session::{DecodeStats, DecodedFrame, SessionCommand};
use serde::Serialize;

#[derive(Clone, Debug, Copy, ValueEnum)]
pub enum OutputFormat {
    Json,
    Table,
    Pretty,
}

impl OutputFormat {
    pub fn default_for_stdout() -> Self {
        if std::io::stdout().is_terminal() {
            Self::Table
        } else {
            Self::Json
        }
    }
}

#[derive(Serialize)]
struct FrameOutput {
    seq: usize,
    width: u32,
    height: u32,
    timestamp_nanos: i64,
    pixel_bytes: usize,
}

pub fn print_frame(seq: usize, frame: &DecodedFrame, format: OutputFormat) {
    let out = FrameOutput {
        seq,
        width: frame.width,
        height: frame.height,
        timestamp_nanos: frame.timestamp_nanos,
        pixel_bytes: frame.pixels.data.len(),
    };
    match format {
        OutputFormat::Json => println!("{}", to_json(&out)),
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["SEQ", "SIZE", "TIMESTAMP", "BYTES"])
                .add_row(vec![
                    out.seq.to_string(),
                    format!("{}x{}", out.width, out.height),
                    out.timestamp_nanos.to_string(),
                    out.pixel_bytes.to_string(),
                ]);
            println!("{table}");
        }
        OutputFormat::Pretty => {
            println!(
                "frame #{} {}x{} ts={} bytes={}",
                out.seq, out.width, out.height, out.timestamp_nanos, out.pixel_bytes
            );
        }
    }
}

#[derive(Serialize)]
struct StatsOutput {
    frames: usize,
    decoded: u64,
    failed: u64,
    dropped: u64,
    discarded: u64,
}

pub fn print_stats(frames: usize, stats: DecodeStats, format: OutputFormat) {
    let out = StatsOutput {
        frames,
        decoded: stats.decoded,
        failed: stats.failed,
        dropped: stats.dropped,
        discarded: stats.discarded,
    };
    match format {
        OutputFormat::Json => println!("{}", to_json(&out)),
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["FRAMES", "DECODED", "FAILED", "DROPPED", "DISCARDED"])
                .add_row(vec![
                    out.frames.to_string(),
                    out.decoded.to_string(),
                    out.failed.to_string(),
                    out.dropped.to_string(),
                    out.discarded.to_string(),
                ]);
            println!("{table}");
        }
        OutputFormat::Pretty => println!(
            "frames={} decoded={} failed={} dropped={} discarded={}",
            out.frames, out.decoded, out.failed, out.dropped, out.discarded
        ),
    }
}

#[derive(Serialize)]
struct CommandOutput<'a> {
    input: &'a str,
    command: &'a str,
}

pub fn print_command(input: &str, command: SessionCommand, format: OutputFormat) {
    let name = match command {
        SessionCommand::StartSession => "start_session",
        SessionCommand::StopSession => "stop_session",
    };
    match format {
        OutputFormat::Json => println!(
            "{}",
            to_json(&CommandOutput {
                input,
                command: name
            })
        ),
        OutputFormat::Table | OutputFormat::Pretty => println!("{input} -> {name}"),
    }
}

#[derive(Serialize)]
pub struct ClientSummary {
    pub client: String,
    pub requests: usize,
    pub frames_sent: usize,
    pub corrupt_sent: usize,
}

pub fn print_client_summary(summary: &ClientSummary, format: OutputFormat) {
    match format {
        OutputFormat::Json => println!("{}", to_json(summary)),
        OutputFormat::Table => {
            let mut table = Table::new();
            table
                .load_preset(UTF8_FULL)
                .set_content_arrangement(ContentArrangement::Dynamic)
                .set_header(vec!["CLIENT", "REQUESTS", "FRAMES", "CORRUPT"])
                .add_row(vec![
                    summary.client.clone(),
                    summary.requests.to_string(),
                    summary.frames_sent.to_string(),
                    summary.corrupt_sent.to_string(),
                ]);
            println!("{table}");
        }
        OutputFormat::Pretty => println!(
            "client={} requests={} frames={} corrupt={}",
            summary.client, summary.requests, summary.frames_sent, summary.corrupt_sent
        ),
    }
}

fn to_json<T: Serialize>(value: &T) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| "{}".to_string())
}
