use anyhow::{Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use colored::Colorize;
use std::path::PathBuf;
use tabled::{Table, Tabled};

use peregrine::config::Config;
use peregrine::eval::{write_eval_csv, EvalSummary};
use peregrine::pipeline::RunReport;
use peregrine::run_offline;

#[derive(Parser)]
#[command(name = "peregrine")]
#[command(author, version, about = "Control plane for hybrid switch/ML intrusion detection")]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub debug: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Replay a statistics trace through the detection pipeline
    Run,

    /// Generate default configuration file
    GenConfig {
        /// Output path (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

#[derive(Tabled)]
struct MetricRow {
    metric: &'static str,
    value: String,
}

pub fn run_command(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Run => {
            let config_path = cli
                .config
                .context("run requires a configuration file (--config)")?;
            let config = Config::load(&config_path)?;
            let report = run_offline(config.clone())?;
            write_outputs(&config, &report)?;
            Ok(())
        }
        Commands::GenConfig { output } => {
            let config = Config::default();
            match output {
                Some(path) => {
                    config.save(&path)?;
                    println!("Wrote default configuration to {}", path.display());
                }
                None => print!("{}", toml::to_string_pretty(&config)?),
            }
            Ok(())
        }
    }
}

fn write_outputs(config: &Config, report: &RunReport) -> Result<()> {
    let summary = EvalSummary::compute(
        &report.records,
        report.threshold,
        config.train_grace(),
        report.train_skip,
        report.state.detection_init_time,
        report.state.detection_init_pkt_count,
        report.state.detection_init_pkt_count_dp,
    );

    let stamp = Utc::now().format("%Y-%m-%d-%H-%M-%S");
    let base = format!(
        "{}-m-{}-{}-r-{}-o-{}",
        config.attack,
        config.max_ensemble_size,
        config.sampling_rate,
        config.train_exact_ratio,
        config.exec_sample_offset
    );

    let csv_path = config.output.eval_dir.join(format!("{}-rmse-{}.csv", base, stamp));
    write_eval_csv(&report.records, &csv_path)?;

    let report_path = config
        .output
        .eval_dir
        .join(format!("{}-metrics-{}.txt", base, stamp));
    summary.write_report(&report_path)?;

    println!("{}", "Run complete".green().bold());
    let rows = vec![
        MetricRow {
            metric: "Packets scored",
            value: report.processed_count().to_string(),
        },
        MetricRow {
            metric: "Threshold",
            value: format!("{:.6}", summary.threshold),
        },
        MetricRow {
            metric: "Detection latency (trace time)",
            value: summary.detection_init_time.to_string(),
        },
        MetricRow {
            metric: "Attack packets to detection (CP)",
            value: summary.detection_init_pkt_count.to_string(),
        },
        MetricRow {
            metric: "Attack packets to detection (DP)",
            value: summary.detection_init_pkt_count_dp.to_string(),
        },
        MetricRow {
            metric: "TP / FP / TN / FN",
            value: format!(
                "{} / {} / {} / {}",
                summary.tp, summary.fp, summary.tn, summary.fn_
            ),
        },
        MetricRow {
            metric: "Accuracy",
            value: format!("{:.4}", summary.accuracy),
        },
        MetricRow {
            metric: "Precision",
            value: format!("{:.4}", summary.precision),
        },
        MetricRow {
            metric: "Recall",
            value: format!("{:.4}", summary.recall),
        },
        MetricRow {
            metric: "F1 score",
            value: format!("{:.4}", summary.f1_score),
        },
    ];
    println!("{}", Table::new(rows));
    println!("Evaluation records: {}", csv_path.display());
    println!("Metrics report:     {}", report_path.display());

    Ok(())
}
