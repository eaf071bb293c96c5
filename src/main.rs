use clap::{Arg, ArgAction, ArgMatches, Command};
use colored::*;
use hybridscan::{
    config::{EngineSettings, ScanConfig},
    output::{ProgressDisplay, ScanResponse},
    plugins::{decode_plugin_names, PluginConfig, PluginFilter, PluginKind},
    scanner::HybridScanner,
    storage::{ScanTaskRecord, TaskStatus},
    targets::{decode_targets, TargetInput},
    task::ScanCommand,
    ScanError,
};
use std::fs;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

fn build_cli() -> Command {
    Command::new("hybridscan")
        .version(env!("CARGO_PKG_VERSION"))
        .author("ibrahimsql")
        .about("Hybridscan: resumable target x plugin scan orchestration")
        .subcommand_required(true)
        .arg(
            Arg::new("config")
                .long("config")
                .value_name("FILE")
                .help("Engine settings file (default ~/.hybridscan.toml)")
                .global(true),
        )
        .arg(
            Arg::new("storage-dir")
                .long("storage-dir")
                .value_name("DIR")
                .help("Directory holding task records")
                .global(true),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .help("Verbose output")
                .action(ArgAction::SetTrue)
                .global(true),
        )
        .arg(
            Arg::new("no-color")
                .long("no-color")
                .help("Disable colored output")
                .action(ArgAction::SetTrue)
                .global(true),
        )
        .subcommand(
            Command::new("scan")
                .about("Start a new scan")
                .arg(
                    Arg::new("targets")
                        .value_name("TARGET")
                        .help("URLs or host[:port] entries")
                        .num_args(0..)
                        .index(1),
                )
                .arg(
                    Arg::new("target-file")
                        .short('i')
                        .long("target-file")
                        .value_name("FILE")
                        .help("Read targets from file, one per line")
                        .action(ArgAction::Append),
                )
                .arg(
                    Arg::new("request-template")
                        .long("request-template")
                        .value_name("FILE")
                        .help("Raw request template with {{method}}, {{path}}, {{host}}"),
                )
                .arg(
                    Arg::new("plugin")
                        .short('p')
                        .long("plugin")
                        .value_name("NAME")
                        .help("Plugin to run (repeatable, comma separated)")
                        .value_delimiter(',')
                        .action(ArgAction::Append),
                )
                .arg(
                    Arg::new("plugin-type")
                        .long("plugin-type")
                        .value_name("TYPE")
                        .help("Select catalog plugins by type (mitm, port-scan, yak, nuclei)")
                        .value_delimiter(',')
                        .action(ArgAction::Append),
                )
                .arg(
                    Arg::new("tag")
                        .long("tag")
                        .value_name("TAG")
                        .help("Select catalog plugins by tag")
                        .value_delimiter(',')
                        .action(ArgAction::Append),
                )
                .arg(
                    Arg::new("keyword")
                        .long("keyword")
                        .value_name("TEXT")
                        .help("Select catalog plugins whose name contains TEXT"),
                )
                .arg(
                    Arg::new("catalog")
                        .long("catalog")
                        .value_name("FILE")
                        .help("Plugin catalog (TOML with [[plugin]] tables)"),
                )
                .arg(
                    Arg::new("concurrency")
                        .short('c')
                        .long("concurrency")
                        .value_name("COUNT")
                        .help("Maximum concurrently running plugins")
                        .value_parser(clap::value_parser!(usize))
                        .default_value("20"),
                )
                .arg(
                    Arg::new("timeout")
                        .long("timeout")
                        .value_name("SECONDS")
                        .help("Total scan timeout")
                        .value_parser(clap::value_parser!(u64))
                        .default_value("72000"),
                )
                .arg(
                    Arg::new("proxy")
                        .long("proxy")
                        .value_name("URL")
                        .help("Proxy for probes and plugins"),
                )
                .arg(
                    Arg::new("source")
                        .long("source")
                        .value_name("TAG")
                        .help("Scan source tag stored with the task")
                        .default_value("cli"),
                ),
        )
        .subcommand(
            Command::new("resume")
                .about("Resume a paused scan")
                .arg(Arg::new("task-id").value_name("TASK_ID").required(true).index(1))
                .arg(
                    Arg::new("catalog")
                        .long("catalog")
                        .value_name("FILE")
                        .help("Plugin catalog (TOML with [[plugin]] tables)"),
                ),
        )
        .subcommand(Command::new("list").about("List stored scan tasks"))
        .subcommand(
            Command::new("show")
                .about("Show one stored scan task")
                .arg(Arg::new("task-id").value_name("TASK_ID").required(true).index(1)),
        )
        .subcommand(
            Command::new("delete")
                .about("Delete a stored scan task")
                .arg(Arg::new("task-id").value_name("TASK_ID").required(true).index(1)),
        )
}

fn load_settings(matches: &ArgMatches) -> anyhow::Result<EngineSettings> {
    let mut settings = match matches.get_one::<String>("config") {
        Some(path) => EngineSettings::from_toml_file(path)?,
        None => EngineSettings::load_default_config(),
    };
    if let Some(dir) = matches.get_one::<String>("storage-dir") {
        settings.storage_dir = Some(PathBuf::from(dir));
    }
    Ok(settings)
}

fn strings(matches: &ArgMatches, id: &str) -> Vec<String> {
    matches
        .get_many::<String>(id)
        .map(|values| values.map(|v| v.trim().to_string()).filter(|v| !v.is_empty()).collect())
        .unwrap_or_default()
}

fn scan_config_from(matches: &ArgMatches) -> anyhow::Result<ScanConfig> {
    let request_template = match matches.get_one::<String>("request-template") {
        Some(path) => Some(fs::read_to_string(path)?),
        None => None,
    };
    let targets = TargetInput {
        raw: strings(matches, "targets").join("\n"),
        files: strings(matches, "target-file").into_iter().map(PathBuf::from).collect(),
        request_template,
    };

    let kinds: Vec<PluginKind> = strings(matches, "plugin-type")
        .into_iter()
        .map(PluginKind::from)
        .collect();
    let tags = strings(matches, "tag");
    let keyword = matches.get_one::<String>("keyword").cloned();
    let filter = if kinds.is_empty() && tags.is_empty() && keyword.is_none() {
        None
    } else {
        Some(PluginFilter { kinds, tags, keyword })
    };
    let plugins = PluginConfig {
        names: strings(matches, "plugin"),
        filter,
    };

    let config = ScanConfig::new(targets, plugins)
        .with_concurrency(*matches.get_one::<usize>("concurrency").unwrap_or(&20))
        .with_total_timeout(*matches.get_one::<u64>("timeout").unwrap_or(&72_000))
        .with_proxy(matches.get_one::<String>("proxy").cloned())
        .with_source(
            matches
                .get_one::<String>("source")
                .cloned()
                .unwrap_or_else(|| "cli".to_string()),
        );
    config.validate()?;
    Ok(config)
}

/// Drive one command stream: first Ctrl-C pauses, the second stops
async fn run_stream(scanner: Arc<HybridScanner>, opening: ScanCommand, verbose: bool) -> anyhow::Result<()> {
    let (command_tx, command_rx) = mpsc::unbounded_channel();
    let (response_tx, mut response_rx) = mpsc::unbounded_channel::<ScanResponse>();
    command_tx.send(opening)?;

    let interrupts = command_tx.clone();
    let signals = tokio::spawn(async move {
        let mut presses = 0;
        while tokio::signal::ctrl_c().await.is_ok() {
            presses += 1;
            let command = if presses == 1 {
                eprintln!("{}", "\n[~] Pausing at the next checkpoint, press Ctrl-C again to stop".bright_yellow());
                ScanCommand::Pause
            } else {
                eprintln!("{}", "\n[!] Stopping".bright_red());
                ScanCommand::Stop
            };
            if interrupts.send(command).is_err() {
                break;
            }
        }
    });

    let render = tokio::spawn(async move {
        let display = ProgressDisplay::new(verbose);
        let mut last = None;
        while let Some(response) = response_rx.recv().await {
            display.update(&response);
            last = Some(response);
        }
        display.finish(last.as_ref());
        last
    });

    let result = scanner.run(command_rx, response_tx, CancellationToken::new()).await;
    signals.abort();
    drop(command_tx);
    let last = render.await?;

    match result {
        Ok(record) => {
            print_outcome(&record);
            Ok(())
        }
        Err(ScanError::UnreachableTargets(urls)) => {
            if let Some(last) = last {
                println!(
                    "{} task {} {}",
                    "[✓]".bright_green(),
                    last.status.task_id.bright_cyan(),
                    last.status.status
                );
            }
            for url in &urls {
                println!("{} unreachable: {}", "[!]".bright_yellow(), url);
            }
            Err(ScanError::UnreachableTargets(urls).into())
        }
        Err(e) => Err(e.into()),
    }
}

fn print_outcome(record: &ScanTaskRecord) {
    match record.status {
        TaskStatus::Paused => {
            println!(
                "{} task {} paused, resume with: hybridscan resume {}",
                "[~]".bright_blue(),
                record.task_id.bright_cyan(),
                record.task_id
            );
        }
        TaskStatus::Error => {
            println!(
                "{} task {} failed: {}",
                "[!]".bright_red(),
                record.task_id.bright_cyan(),
                record.reason
            );
        }
        TaskStatus::Done | TaskStatus::Executing => {
            println!("{} task {} {}", "[✓]".bright_green(), record.task_id.bright_cyan(), record.status);
        }
    }
}

fn colored_status(status: TaskStatus) -> ColoredString {
    match status {
        TaskStatus::Executing => status.as_str().bright_blue(),
        TaskStatus::Paused => status.as_str().bright_yellow(),
        TaskStatus::Done => status.as_str().bright_green(),
        TaskStatus::Error => status.as_str().bright_red(),
    }
}

fn print_task_list(records: &[ScanTaskRecord]) {
    if records.is_empty() {
        println!("{}", "No scan tasks stored".dimmed());
        return;
    }
    println!(
        "{:<38} {:<10} {:>8} {:>8}  {}",
        "TASK".bold(),
        "STATUS".bold(),
        "TARGETS".bold(),
        "PLUGINS".bold(),
        "UPDATED".bold()
    );
    for record in records {
        let targets = decode_targets(&record.targets).map(|t| t.len()).unwrap_or(0);
        let plugins = decode_plugin_names(&record.plugins).map(|p| p.len()).unwrap_or(0);
        println!(
            "{:<38} {:<10} {:>8} {:>8}  {}",
            record.task_id,
            colored_status(record.status),
            targets,
            plugins,
            record.updated_at.format("%Y-%m-%d %H:%M:%S")
        );
    }
}

fn print_task(record: &ScanTaskRecord) -> anyhow::Result<()> {
    let targets = decode_targets(&record.targets)?;
    let plugins = decode_plugin_names(&record.plugins)?;
    let config = ScanConfig::from_json(&record.scan_config)?;

    println!("{} {}", "Task:".bold(), record.task_id.bright_cyan());
    println!("{} {}", "Status:".bold(), colored_status(record.status));
    if !record.reason.is_empty() {
        println!("{} {}", "Reason:".bold(), record.reason.bright_red());
    }
    println!("{} {}", "Created:".bold(), record.created_at.to_rfc3339());
    println!("{} {}", "Updated:".bold(), record.updated_at.to_rfc3339());
    println!(
        "{} concurrency {}, timeout {}s, proxy {}, source {}",
        "Config:".bold(),
        config.concurrency,
        config.total_timeout_secs,
        config.proxy.as_deref().unwrap_or("-"),
        config.source
    );
    println!("{} {}", "Plugins:".bold(), plugins.join(", "));
    println!("{} {}", "Targets:".bold(), targets.len());
    for target in &targets {
        println!("    {}", target.url);
    }
    if record.status == TaskStatus::Paused {
        println!(
            "{} cursor {}, in flight [{}]",
            "Checkpoint:".bold(),
            record.dispatch_cursor,
            record.survival_task_indexes
        );
        for url in &record.unreachable_targets {
            println!("    {} unreachable: {}", "[!]".bright_yellow(), url);
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let matches = build_cli().get_matches();
    let verbose = matches.get_flag("verbose");
    if matches.get_flag("no-color") {
        colored::control::set_override(false);
    }

    let mut settings = load_settings(&matches)?;
    let level = if verbose { "debug".to_string() } else { settings.log_level.clone() };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    match matches.subcommand() {
        Some(("scan", sub)) => {
            if let Some(catalog) = sub.get_one::<String>("catalog") {
                settings.catalog = Some(PathBuf::from(catalog));
            }
            let config = scan_config_from(sub)?;
            let scanner = Arc::new(HybridScanner::from_settings(settings)?);
            run_stream(scanner, ScanCommand::New(config), verbose).await
        }
        Some(("resume", sub)) => {
            if let Some(catalog) = sub.get_one::<String>("catalog") {
                settings.catalog = Some(PathBuf::from(catalog));
            }
            let task_id = sub
                .get_one::<String>("task-id")
                .cloned()
                .unwrap_or_default();
            let scanner = Arc::new(HybridScanner::from_settings(settings)?);
            run_stream(scanner, ScanCommand::Resume { task_id }, verbose).await
        }
        Some(("list", _)) => {
            let scanner = HybridScanner::from_settings(settings)?;
            print_task_list(&scanner.list_tasks()?);
            Ok(())
        }
        Some(("show", sub)) => {
            let scanner = HybridScanner::from_settings(settings)?;
            let task_id = sub.get_one::<String>("task-id").map(String::as_str).unwrap_or_default();
            print_task(&scanner.get_task(task_id)?)
        }
        Some(("delete", sub)) => {
            let scanner = HybridScanner::from_settings(settings)?;
            let task_id = sub.get_one::<String>("task-id").map(String::as_str).unwrap_or_default();
            scanner.delete_task(task_id)?;
            println!("{} deleted task {}", "[✓]".bright_green(), task_id.bright_cyan());
            Ok(())
        }
        _ => {
            build_cli().print_help()?;
            Ok(())
        }
    }
}
