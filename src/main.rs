use std::{path::PathBuf, sync::Arc};

use anyhow::{Context, anyhow};
use clap::{Parser, Subcommand};
use netcapture::{
    capture::{CaptureManager, CaptureReport},
    classify::ContentTypeTag,
    config::Config,
    event::CaptureLog,
    export::{self, ExportOptions},
    filter::{ExchangeFilter, StatusClass, TypeStats, describe_status, format_size},
    logging, save_files, session,
    storage::{SessionSummary, Storage},
};

#[derive(Debug, Parser)]
#[command(name = "netcapture")]
struct Cli {
    /// Optional path to config TOML. If omitted, default discovery is used.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Override log level (trace, debug, info, warn, error, off).
    #[arg(long, global = true)]
    log_level: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand, Clone, PartialEq, Eq)]
enum Command {
    /// Capture a session from a JSON Lines log of CDP messages.
    Ingest {
        #[arg(long)]
        session: String,
        file: PathBuf,
    },
    /// List captured sessions.
    Sessions,
    /// List captured exchanges of a session.
    List {
        #[arg(long)]
        session: String,
        /// Case-insensitive URL substring.
        #[arg(long)]
        search: Option<String>,
        #[arg(long = "type")]
        content_type: Option<ContentTypeTag>,
        /// Status class: 2xx, 3xx, 4xx or 5xx.
        #[arg(long)]
        status: Option<StatusClass>,
        #[arg(long)]
        method: Option<String>,
    },
    /// Show per-type counts for a session.
    Stats {
        #[arg(long)]
        session: String,
    },
    /// Export a session as a ZIP archive, or as JSON with `--json`.
    Export {
        #[arg(long)]
        session: String,
        #[arg(long)]
        out: Option<PathBuf>,
        #[arg(long)]
        json: bool,
    },
    /// Save HTML, CSS and JavaScript bodies of a session as individual files.
    SaveFiles {
        #[arg(long)]
        session: String,
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Delete every record of a session.
    Clear {
        #[arg(long)]
        session: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct ListedExchange {
    method: String,
    status: Option<u16>,
    content_type: ContentTypeTag,
    size: Option<u64>,
    url: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum CommandOutcome {
    Ingested {
        session: String,
        ignored: usize,
        report: CaptureReport,
    },
    Sessions(Vec<SessionSummary>),
    Listed(Vec<ListedExchange>),
    Stats {
        session: String,
        stats: TypeStats,
    },
    Exported {
        path: PathBuf,
        processed: usize,
        skipped: usize,
        total_requests: usize,
        size: u64,
    },
    ExportedJson {
        path: PathBuf,
        total_requests: usize,
    },
    SavedFiles {
        out_dir: PathBuf,
        saved: usize,
        skipped: usize,
    },
    Cleared {
        session: String,
        deleted: usize,
    },
}

fn require_session_id(session_id: &str) -> anyhow::Result<()> {
    session::validate_session_id(session_id)
        .map_err(|err| anyhow!("invalid session id `{session_id}`: {err}"))
}

async fn run_command(config: &Config, command: Command) -> anyhow::Result<CommandOutcome> {
    let storage = Storage::from_config(config)?;
    tracing::debug!(database = %storage.db_path().display(), "opened capture database");

    match command {
        Command::Ingest { session, file } => {
            require_session_id(&session)?;
            let log = tokio::task::spawn_blocking(move || CaptureLog::from_path(&file))
                .await
                .context("join capture log read task")??;
            let CaptureLog {
                events,
                bodies,
                ignored,
            } = log;

            let mut manager = CaptureManager::new(Arc::new(storage));
            manager.start(&session, Arc::new(bodies))?;
            for event in events {
                manager.handle_event(&session, event);
            }
            let report = manager.stop().await?.unwrap_or_default();
            Ok(CommandOutcome::Ingested {
                session,
                ignored,
                report,
            })
        }
        Command::Sessions => Ok(CommandOutcome::Sessions(storage.list_sessions().await?)),
        Command::List {
            session,
            search,
            content_type,
            status,
            method,
        } => {
            require_session_id(&session)?;
            let filter = ExchangeFilter {
                search,
                content_type,
                status,
                method,
            };
            let exchanges = storage.get_exchanges_by_session(&session).await?;
            let listed = filter
                .apply(&exchanges)
                .into_iter()
                .map(|exchange| ListedExchange {
                    method: exchange.method.clone(),
                    status: exchange.response_status,
                    content_type: exchange.content_type,
                    size: exchange.encoded_body_size,
                    url: exchange.url.clone(),
                })
                .collect();
            Ok(CommandOutcome::Listed(listed))
        }
        Command::Stats { session } => {
            require_session_id(&session)?;
            let exchanges = storage.get_exchanges_by_session(&session).await?;
            Ok(CommandOutcome::Stats {
                stats: TypeStats::collect(&exchanges),
                session,
            })
        }
        Command::Export { session, out, json } => {
            let out_dir = config.export_dir(out.as_deref());
            if json {
                let exported = export::export_json(&storage, &session).await?;
                let path = export::write_json(&out_dir, &exported)?;
                return Ok(CommandOutcome::ExportedJson {
                    path,
                    total_requests: exported.total_requests,
                });
            }

            let options = ExportOptions::from_config(&config.export);
            let archive = export::export_session(&storage, &session, &options).await?;
            let path = export::write_archive(&out_dir, &archive)?;
            Ok(CommandOutcome::Exported {
                path,
                processed: archive.processed,
                skipped: archive.skipped,
                total_requests: archive.total_requests,
                size: archive.archive_size,
            })
        }
        Command::SaveFiles { session, out } => {
            require_session_id(&session)?;
            let out_dir = config.save_dir(out.as_deref());
            let summary = save_files::save_session_files(
                &storage,
                &session,
                &out_dir,
                &config.save.content_types,
            )
            .await?;
            Ok(CommandOutcome::SavedFiles {
                out_dir,
                saved: summary.saved,
                skipped: summary.skipped,
            })
        }
        Command::Clear { session } => {
            require_session_id(&session)?;
            let deleted = storage.delete_session(&session).await?;
            Ok(CommandOutcome::Cleared { session, deleted })
        }
    }
}

fn print_command_outcome(outcome: CommandOutcome) {
    match outcome {
        CommandOutcome::Ingested {
            session,
            ignored,
            report,
        } => {
            println!(
                "captured session `{session}`: events={}, records_written={}, bodies_retrieved={}, bodies_missing={}, ignored={ignored}",
                report.events_processed,
                report.records_written,
                report.bodies_retrieved,
                report.bodies_missing
            );
        }
        CommandOutcome::Sessions(sessions) => {
            for summary in sessions {
                println!("{}\t{}", summary.session_id, summary.exchange_count);
            }
        }
        CommandOutcome::Listed(exchanges) => {
            for exchange in exchanges {
                let status = exchange
                    .status
                    .map(|status| status.to_string())
                    .unwrap_or_else(|| "-".to_owned());
                let size = exchange
                    .size
                    .map(format_size)
                    .unwrap_or_else(|| "-".to_owned());
                println!(
                    "{:<7} {status:>3} {:<12} {:<11} {size:>9}  {}",
                    exchange.method,
                    describe_status(exchange.status),
                    exchange.content_type,
                    exchange.url
                );
            }
        }
        CommandOutcome::Stats { session, stats } => {
            println!(
                "{session}: total={}, html={}, css={}, javascript={}, image={}, other={}",
                stats.total, stats.html, stats.css, stats.javascript, stats.image, stats.other
            );
        }
        CommandOutcome::Exported {
            path,
            processed,
            skipped,
            total_requests,
            size,
        } => {
            println!(
                "exported {processed}/{total_requests} exchanges ({skipped} skipped, {}) to {}",
                format_size(size),
                path.display()
            );
        }
        CommandOutcome::ExportedJson {
            path,
            total_requests,
        } => {
            println!(
                "exported {total_requests} exchanges as JSON to {}",
                path.display()
            );
        }
        CommandOutcome::SavedFiles {
            out_dir,
            saved,
            skipped,
        } => {
            println!(
                "saved {saved} files to {} ({skipped} skipped)",
                out_dir.display()
            );
        }
        CommandOutcome::Cleared { session, deleted } => {
            println!("cleared session `{session}` ({deleted} exchanges)");
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = Config::load(cli.config.as_deref())?;
    logging::init(&config, cli.log_level.as_deref())?;
    let outcome = run_command(&config, cli.command).await?;
    print_command_outcome(outcome);

    Ok(())
}

#[cfg(test)]
mod tests {
    use std::path::{Path, PathBuf};

    use super::{Cli, Command, CommandOutcome, ListedExchange, run_command};
    use clap::Parser;
    use netcapture::{
        capture::CaptureReport, classify::ContentTypeTag, config::Config, filter::StatusClass,
    };
    use tempfile::tempdir;

    const CAPTURE_LOG: &str = r#"{"method":"Network.requestWillBeSent","params":{"requestId":"1","timestamp":1.0,"type":"Document","request":{"method":"GET","url":"https://example.com/","headers":{}}}}
{"method":"Network.responseReceived","params":{"requestId":"1","timestamp":1.1,"response":{"status":200,"statusText":"OK","headers":{},"mimeType":"text/html"}}}
{"method":"Network.loadingFinished","params":{"requestId":"1","timestamp":1.2,"encodedDataLength":13}}
{"method":"Network.getResponseBody","params":{"requestId":"1","body":"<h1>hi</h1>","base64Encoded":false}}
{"method":"Network.responseReceived","params":{"requestId":"2","timestamp":1.3,"response":{"status":404,"statusText":"Not Found","headers":{},"mimeType":"application/javascript"}}}
{"method":"Page.frameNavigated","params":{}}
"#;

    fn config_with_storage(base_path: &Path) -> Config {
        Config::from_toml_str(&format!(
            r#"
[storage]
path = "{}"

[export]
out_dir = "{}"
"#,
            base_path.join("capture.db").display(),
            base_path.join("exports").display()
        ))
        .expect("config should parse")
    }

    fn ingest(base_path: &Path, session: &str) -> Command {
        let file = base_path.join("capture.jsonl");
        std::fs::write(&file, CAPTURE_LOG).expect("capture log should be written");
        Command::Ingest {
            session: session.to_owned(),
            file,
        }
    }

    #[test]
    fn global_flags_parse_before_and_after_the_command() {
        let cli = Cli::try_parse_from([
            "netcapture",
            "--config",
            "custom.toml",
            "sessions",
            "--log-level",
            "debug",
        ])
        .expect("cli parse should succeed");
        assert_eq!(cli.config, Some(PathBuf::from("custom.toml")));
        assert_eq!(cli.log_level.as_deref(), Some("debug"));
        assert_eq!(cli.command, Command::Sessions);

        let cli = Cli::try_parse_from(["netcapture", "sessions"]).expect("cli parse should work");
        assert_eq!(cli.config, None);
        assert_eq!(cli.log_level, None);
    }

    #[test]
    fn list_parses_every_filter() {
        let cli = Cli::try_parse_from([
            "netcapture",
            "list",
            "--session",
            "tab-1",
            "--search",
            "api",
            "--type",
            "javascript",
            "--status",
            "4xx",
            "--method",
            "POST",
        ])
        .expect("cli parse should succeed");
        assert_eq!(
            cli.command,
            Command::List {
                session: "tab-1".to_owned(),
                search: Some("api".to_owned()),
                content_type: Some(ContentTypeTag::Javascript),
                status: Some(StatusClass::ClientError),
                method: Some("POST".to_owned()),
            }
        );
    }

    #[test]
    fn invalid_filters_and_missing_sessions_are_rejected() {
        assert!(
            Cli::try_parse_from(["netcapture", "list", "--session", "t", "--status", "9xx"])
                .is_err()
        );
        assert!(
            Cli::try_parse_from(["netcapture", "list", "--session", "t", "--type", "pdf"])
                .is_err()
        );
        assert!(Cli::try_parse_from(["netcapture", "export"]).is_err());
    }

    #[test]
    fn export_parses_json_flag() {
        let cli = Cli::try_parse_from([
            "netcapture",
            "export",
            "--session",
            "tab-1",
            "--out",
            "out",
            "--json",
        ])
        .expect("cli parse should succeed");
        assert_eq!(
            cli.command,
            Command::Export {
                session: "tab-1".to_owned(),
                out: Some(PathBuf::from("out")),
                json: true,
            }
        );
    }

    #[tokio::test]
    async fn ingest_then_list_stats_export_and_clear() {
        let temp_dir = tempdir().expect("tempdir should be created");
        let config = config_with_storage(temp_dir.path());

        let ingested = run_command(&config, ingest(temp_dir.path(), "tab-1"))
            .await
            .expect("ingest should succeed");
        assert_eq!(
            ingested,
            CommandOutcome::Ingested {
                session: "tab-1".to_owned(),
                ignored: 1,
                report: CaptureReport {
                    events_processed: 4,
                    records_written: 4,
                    write_failures: 0,
                    bodies_retrieved: 1,
                    bodies_missing: 0,
                },
            }
        );

        let listed = run_command(
            &config,
            Command::List {
                session: "tab-1".to_owned(),
                search: None,
                content_type: None,
                status: Some(StatusClass::ClientError),
                method: None,
            },
        )
        .await
        .expect("list should succeed");
        assert_eq!(
            listed,
            CommandOutcome::Listed(vec![ListedExchange {
                method: "GET".to_owned(),
                status: Some(404),
                content_type: ContentTypeTag::Javascript,
                size: None,
                url: "Unknown".to_owned(),
            }])
        );

        let stats = run_command(
            &config,
            Command::Stats {
                session: "tab-1".to_owned(),
            },
        )
        .await
        .expect("stats should succeed");
        let CommandOutcome::Stats { stats, .. } = stats else {
            panic!("expected stats outcome, got {stats:?}");
        };
        assert_eq!((stats.total, stats.html, stats.javascript), (2, 1, 1));

        let exported = run_command(
            &config,
            Command::Export {
                session: "tab-1".to_owned(),
                out: None,
                json: false,
            },
        )
        .await
        .expect("export should succeed");
        let CommandOutcome::Exported {
            path,
            processed,
            skipped,
            total_requests,
            ..
        } = exported
        else {
            panic!("expected export outcome, got {exported:?}");
        };
        assert_eq!((processed, skipped, total_requests), (1, 1, 2));
        assert!(path.starts_with(temp_dir.path().join("exports")));
        assert!(path.is_file());

        let cleared = run_command(
            &config,
            Command::Clear {
                session: "tab-1".to_owned(),
            },
        )
        .await
        .expect("clear should succeed");
        assert_eq!(
            cleared,
            CommandOutcome::Cleared {
                session: "tab-1".to_owned(),
                deleted: 2,
            }
        );

        let sessions = run_command(&config, Command::Sessions)
            .await
            .expect("sessions should succeed");
        assert_eq!(sessions, CommandOutcome::Sessions(Vec::new()));
    }

    #[tokio::test]
    async fn export_of_an_empty_session_fails() {
        let temp_dir = tempdir().expect("tempdir should be created");
        let config = config_with_storage(temp_dir.path());

        let err = run_command(
            &config,
            Command::Export {
                session: "nothing".to_owned(),
                out: None,
                json: false,
            },
        )
        .await
        .unwrap_err();
        assert!(
            err.to_string().contains("no captured exchanges"),
            "unexpected error: {err}"
        );
    }

    #[tokio::test]
    async fn ingest_rejects_unsafe_session_ids() {
        let temp_dir = tempdir().expect("tempdir should be created");
        let config = config_with_storage(temp_dir.path());

        let err = run_command(&config, ingest(temp_dir.path(), "../escape"))
            .await
            .unwrap_err();
        assert!(
            err.to_string().contains("invalid session id"),
            "unexpected error: {err}"
        );
    }
}
