use clap::{Arg, Command};
use csem_scanner::config::PipelineConfig;
use csem_scanner::local_host::{LocalHost, ScanFixture};
use csem_scanner::pipeline::{DeliveryMode, InterceptionPipeline, QuarantineAction, ScanState};
use csem_scanner::statistics::StatisticsCollector;
use log::LevelFilter;
use std::process;
use std::sync::Arc;

#[tokio::main]
async fn main() {
    let matches = Command::new("csem-scanner")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Scans chat image attachments against a perceptual-hash matching service")
        .arg(
            Arg::new("config")
                .short('c')
                .long("config")
                .value_name("FILE")
                .help("Configuration file path")
                .default_value("/etc/csem-scanner.yaml"),
        )
        .arg(
            Arg::new("generate-config")
                .long("generate-config")
                .value_name("FILE")
                .help("Generate a default configuration file")
                .action(clap::ArgAction::Set),
        )
        .arg(
            Arg::new("test-config")
                .long("test-config")
                .help("Print the effective configuration (secrets redacted)")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("stats")
                .long("stats")
                .help("Show scan statistics")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("stats-reset")
                .long("stats-reset")
                .help("Reset all statistics and exit")
                .action(clap::ArgAction::SetTrue),
        )
        .arg(
            Arg::new("scan")
                .long("scan")
                .value_name("FIXTURE")
                .help("Run a message fixture through the configured delivery mode")
                .action(clap::ArgAction::Set),
        )
        .arg(
            Arg::new("verbose")
                .short('v')
                .long("verbose")
                .help("Enable verbose logging")
                .action(clap::ArgAction::SetTrue),
        )
        .get_matches();

    let log_level = if matches.get_flag("verbose") {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };

    env_logger::Builder::from_default_env()
        .filter_level(log_level)
        .init();

    if let Some(generate_path) = matches.get_one::<String>("generate-config") {
        generate_default_config(generate_path);
        return;
    }

    let config_path = matches
        .get_one::<String>("config")
        .map(String::as_str)
        .unwrap_or("/etc/csem-scanner.yaml");

    let config = match load_config(config_path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error loading configuration: {e}");
            process::exit(1);
        }
    };

    if matches.get_flag("test-config") {
        println!("Configuration: {config_path}");
        println!("{config:#?}");
        println!("Delivery mode: {:?}", DeliveryMode::from_config(&config));
        if config.api_key().is_none() {
            println!("⚠️  No api-key set: images will not be scanned");
        }
        if config.enable_automated_report && config.reporting_credentials().is_none() {
            println!("⚠️  Automated reports enabled but reporting credentials are incomplete");
        }
        return;
    }

    if matches.get_flag("stats") || matches.get_flag("stats-reset") {
        show_or_reset_stats(&config, matches.get_flag("stats-reset"));
        return;
    }

    if let Some(fixture_path) = matches.get_one::<String>("scan") {
        if let Err(e) = scan_fixture(config, fixture_path).await {
            eprintln!("❌ Scan failed: {e:#}");
            process::exit(1);
        }
        return;
    }

    eprintln!("Nothing to do. Use --scan, --test-config, --stats or --generate-config.");
    process::exit(2);
}

fn load_config(path: &str) -> anyhow::Result<PipelineConfig> {
    if std::path::Path::new(path).exists() {
        Ok(PipelineConfig::from_file(path)?)
    } else {
        log::warn!("Configuration file '{path}' not found, using default configuration");
        Ok(PipelineConfig::default())
    }
}

fn generate_default_config(path: &str) {
    let config = PipelineConfig::default();
    match config.to_file(path) {
        Ok(()) => {
            println!("Default configuration written to: {path}");
            println!("Set api-key before scanning.");
        }
        Err(e) => {
            eprintln!("Error writing configuration file: {e}");
            process::exit(1);
        }
    }
}

fn show_or_reset_stats(config: &PipelineConfig, reset: bool) {
    let Some(stats_config) = config.statistics.as_ref().filter(|s| s.enabled) else {
        println!("❌ Statistics are not enabled in configuration");
        process::exit(1);
    };

    let collector = match StatisticsCollector::new(stats_config.database_path.clone(), 60) {
        Ok(collector) => collector,
        Err(e) => {
            println!("❌ Failed to access statistics database: {e}");
            process::exit(1);
        }
    };

    if reset {
        match collector.reset_stats() {
            Ok(()) => println!("✅ Statistics reset successfully"),
            Err(e) => {
                println!("❌ Failed to reset statistics: {e}");
                process::exit(1);
            }
        }
        return;
    }

    match collector.get_stats() {
        Ok((global, outcomes)) => {
            println!("📊 CSEM Scanner Statistics");
            println!("═══════════════════════════════════════");
            println!("  Messages seen:    {}", global.total_messages);
            println!("  Images scanned:   {}", global.total_scanned);
            println!("  Matches:          {}", global.total_matches);
            println!("  Reports filed:    {}", global.total_reports);
            println!("  Reports failed:   {}", global.total_report_failures);
            println!();
            println!(
                "  Started: {}",
                global.start_time.format("%Y-%m-%d %H:%M:%S UTC")
            );
            println!(
                "  Last Updated: {}",
                global.last_updated.format("%Y-%m-%d %H:%M:%S UTC")
            );
            println!();

            if outcomes.is_empty() {
                println!("📭 No outcomes recorded yet");
            } else {
                println!("┌──────────────────────────────────────┬─────────┐");
                println!("│ Outcome                              │   Count │");
                println!("├──────────────────────────────────────┼─────────┤");
                for stats in &outcomes {
                    println!("│ {:<36} │ {:>7} │", stats.outcome, stats.count);
                }
                println!("└──────────────────────────────────────┴─────────┘");
            }
        }
        Err(e) => {
            println!("❌ Failed to get statistics: {e}");
            process::exit(1);
        }
    }
}

async fn scan_fixture(config: PipelineConfig, fixture_path: &str) -> anyhow::Result<()> {
    let fixture = ScanFixture::from_file(fixture_path)?;
    let host = Arc::new(LocalHost::from_fixture(&fixture));

    let collector = match config.statistics.as_ref().filter(|s| s.enabled) {
        Some(stats) => Some(Arc::new(StatisticsCollector::new(
            stats.database_path.clone(),
            stats.flush_interval_seconds.unwrap_or(60),
        )?)),
        None => None,
    };

    let mut pipeline = InterceptionPipeline::with_http_clients(config, host.services());
    if let Some(collector) = &collector {
        pipeline = pipeline.with_statistics(collector.clone());
    }
    pipeline.on_enable().await;

    let mode = pipeline.delivery_mode();
    println!("🧪 Scanning message {} ({:?})", fixture.message.id, mode);

    let disposition = match mode {
        DeliveryMode::PreSendGate if !pipeline.check_pre_message_sent_modify(&fixture.message) => {
            None
        }
        DeliveryMode::PostSendNotify if !pipeline.check_post_message_sent(&fixture.message) => {
            None
        }
        _ => Some(pipeline.process(&fixture.message, mode).await),
    };

    match disposition {
        None => println!("⏭️  Not eligible for scanning (no image or room not watched)"),
        Some(disposition) => {
            match &disposition.state {
                ScanState::Ineligible(reason) => println!("⏭️  Skipped: {}", reason.as_str()),
                ScanState::Unmatched => println!("✅ Result: NO MATCH"),
                ScanState::Matched(verdict) => {
                    println!("🚨 Result: MATCH (tracking id {})", verdict.tracking_id);
                    for flag in verdict.match_flags() {
                        println!(
                            "   Source: {} Violations: {:?}",
                            flag.source.as_deref().unwrap_or("-"),
                            flag.violation_set()
                        );
                    }
                }
            }
            match &disposition.action {
                QuarantineAction::None => {}
                QuarantineAction::Redirected(room) => {
                    println!("   Action: redirected to #{}", room.name)
                }
                other => println!("   Action: {}", other.as_str()),
            }
            if let Some(report) = &disposition.report {
                println!("   Report: HTTP {} {}", report.status, report.body);
            }
        }
    }

    drop(pipeline);
    if let Some(collector) = collector.and_then(|c| Arc::try_unwrap(c).ok()) {
        collector.shutdown().await;
    }
    Ok(())
}
