// Copyright 2025 jonefeewang@gmail.com
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use chrono::DateTime;
use clap::Parser;
use dotenv::dotenv;
use tokio::runtime;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use stoneconsole::consume::ALL_PARTITIONS;
use stoneconsole::service::setup_tracing;
use stoneconsole::{
    decode_page_token, global_config, AppError, AppResult, ConsoleConfig, ConsumedRecord,
    ListMessageRequest, ListMessagesProgress, MemoryCluster, MessageService, RecordFilter,
    StartOffset,
    GLOBAL_CONFIG,
};

#[derive(Parser)]
#[command(version)]
pub struct CommandLine {
    /// path to config file
    #[arg(short, long)]
    pub conf: Option<String>,
    #[command(subcommand)]
    pub command: Command,
    /// log level (v: info, vv: debug, vvv: trace)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count)]
    pub verbose: u8,
}

#[derive(Parser)]
pub enum Command {
    /// List messages of a demo topic
    Browse {
        topic: String,
        /// partition id, -1 for all partitions
        #[arg(short, long, default_value_t = ALL_PARTITIONS, allow_negative_numbers = true)]
        partition: i32,
        /// recent, oldest, newest (live tail), timestamp or a literal offset
        #[arg(short, long, default_value = "recent")]
        start: String,
        /// RFC 3339 time, required with `--start timestamp`
        #[arg(long)]
        timestamp: Option<String>,
        #[arg(short = 'n', long, default_value_t = 20)]
        count: i64,
        /// only deliver records whose value contains this text
        #[arg(short, long)]
        filter: Option<String>,
    },
    /// Page backwards through a demo topic, newest records first
    Page {
        topic: String,
        /// token printed by the previous page
        #[arg(short = 't', long)]
        page_token: Option<String>,
        #[arg(long)]
        page_size: Option<usize>,
    },
    /// Print the cursor state carried by a page token
    DecodeToken { token: String },
    PrintConfig,
}

/// Prints delivered records to stdout, one line each.
#[derive(Debug, Default)]
struct StdoutProgress {
    consumed_bytes: usize,
    errors: usize,
}

fn lossy(bytes: &Option<Bytes>) -> String {
    bytes
        .as_ref()
        .map_or_else(|| "<null>".to_string(), |b| String::from_utf8_lossy(b).into_owned())
}

impl ListMessagesProgress for StdoutProgress {
    fn on_phase(&mut self, phase: &str) {
        info!("{}", phase);
    }

    fn on_message(&mut self, record: &ConsumedRecord) {
        println!(
            "p{} @{} ts={} key={} value={}",
            record.partition_id,
            record.offset,
            record.timestamp_ms,
            lossy(&record.key),
            lossy(&record.value)
        );
    }

    fn on_message_consumed(&mut self, size_bytes: usize) {
        self.consumed_bytes += size_bytes;
    }

    fn on_complete(&mut self, elapsed_ms: u64, is_cancelled: bool) {
        info!(
            "done in {} ms, {} bytes consumed, cancelled: {}",
            elapsed_ms, self.consumed_bytes, is_cancelled
        );
    }

    fn on_error(&mut self, msg: &str) {
        self.errors += 1;
        warn!("{}", msg);
    }
}

fn parse_start(start: &str, timestamp: Option<&str>) -> AppResult<(StartOffset, i64)> {
    let start_offset = match start {
        "recent" => StartOffset::Recent,
        "oldest" => StartOffset::Oldest,
        "newest" => StartOffset::Newest,
        "timestamp" => StartOffset::Timestamp,
        other => StartOffset::Custom(other.parse().map_err(|_| {
            AppError::InvalidArgument(format!("start offset: {}", other))
        })?),
    };
    let start_timestamp = match (start_offset, timestamp) {
        (StartOffset::Timestamp, Some(ts)) => DateTime::parse_from_rfc3339(ts)
            .map_err(|e| AppError::InvalidArgument(format!("timestamp {}: {}", ts, e)))?
            .timestamp_millis(),
        (StartOffset::Timestamp, None) => {
            return Err(AppError::InvalidArgument(
                "--timestamp is required with --start timestamp".to_string(),
            ))
        }
        _ => 0,
    };
    Ok((start_offset, start_timestamp))
}

fn demo_cluster() -> AppResult<MemoryCluster> {
    let config = global_config();
    let cluster = MemoryCluster::from_config(&config.kafka);
    // the newest seeded record is one second old
    let now_ms = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|e| AppError::IllegalState(e.to_string()))?
        .as_millis() as i64;
    let longest = config
        .demo
        .topics
        .iter()
        .map(|t| t.messages_per_partition)
        .max()
        .unwrap_or(0);
    cluster.seed(&config.demo, now_ms - longest * 1000)?;
    Ok(cluster)
}

async fn run(command: Command, cancel: CancellationToken) -> AppResult<()> {
    match command {
        Command::Browse {
            topic,
            partition,
            start,
            timestamp,
            count,
            filter,
        } => {
            let (start_offset, start_timestamp) = parse_start(&start, timestamp.as_deref())?;
            let mut request = ListMessageRequest::new(topic, start_offset, count)
                .with_partition(partition)
                .with_start_timestamp(start_timestamp);
            if let Some(needle) = &filter {
                request = request.with_filter_code(needle.clone());
            }
            let predicate = filter.map(|needle| {
                move |record: &ConsumedRecord| -> Result<bool, String> {
                    Ok(record
                        .value
                        .as_ref()
                        .is_some_and(|v| String::from_utf8_lossy(v).contains(&needle)))
                }
            });

            let service = MessageService::from_global_config(demo_cluster()?);
            let mut progress = StdoutProgress::default();
            let outcome = service
                .list_messages(
                    &request,
                    predicate
                        .as_ref()
                        .map(|p| p as &dyn RecordFilter),
                    &cancel,
                    &mut progress,
                )
                .await?;
            info!(
                "{} messages delivered, {} consumed",
                outcome.delivered, outcome.consumed
            );
        }
        Command::Page {
            topic,
            page_token,
            page_size,
        } => {
            let mut request = ListMessageRequest::new(topic, StartOffset::Recent, 0);
            if let Some(page_size) = page_size {
                request = request.with_page_size(page_size);
            }
            let service = MessageService::from_global_config(demo_cluster()?);
            let mut progress = StdoutProgress::default();
            let page = service
                .list_messages_paged(&request, page_token.as_deref(), &cancel, &mut progress)
                .await?;
            match page.next_page_token {
                Some(token) => println!("next page token: {}", token),
                None => println!("no more pages"),
            }
        }
        Command::DecodeToken { token } => {
            let token = decode_page_token(&token)?;
            println!("{}", serde_json::to_string_pretty(&token)?);
        }
        Command::PrintConfig => {
            println!("{}", serde_json::to_string_pretty(global_config())?);
        }
    }
    Ok(())
}

fn main() -> AppResult<()> {
    dotenv().ok();

    let commandline: CommandLine = CommandLine::parse();
    if commandline.verbose > 0 && std::env::var("RUST_LOG").is_err() {
        let level = match commandline.verbose {
            1 => "info",
            2 => "debug",
            _ => "trace",
        };
        std::env::set_var("RUST_LOG", level);
    }

    let config_path = commandline
        .conf
        .as_ref()
        .map_or_else(|| PathBuf::from("./conf.toml"), PathBuf::from);
    let console_config = ConsoleConfig::set_up_config(config_path)?;
    GLOBAL_CONFIG
        .set(console_config)
        .map_err(|_| AppError::IllegalState("config already set".to_string()))?;

    // startup tokio runtime
    let rt = runtime::Builder::new_multi_thread().enable_all().build()?;
    rt.block_on(async move {
        let _otel_guard = setup_tracing(&global_config().tracing).await?;

        let cancel = CancellationToken::new();
        let ctrl_c_cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("received ctrl-c, cancelling");
                ctrl_c_cancel.cancel();
            }
        });

        run(commandline.command, cancel).await
    })
}
