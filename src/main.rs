//! Cuantizar CLI
//!
//! # Usage
//!
//! ```bash
//! # Validate config
//! cuantizar validate config.yaml
//!
//! # Show the resolved quantization plan
//! cuantizar info config.yaml --format yaml
//!
//! # Compare methods on synthetic tensors
//! cuantizar bench config.yaml --rows 128 --cols 512
//! ```

use clap::Parser;
use cuantizar::config::{
    bench_plan, load_config, summarize, BenchArgs, Cli, Command, InfoArgs, OutputFormat, PlanSummary,
    QuantizerSummary, ValidateArgs,
};
use cuantizar::quant::{compare_methods, BenchInputs};
use serde::Serialize;
use std::process::ExitCode;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

fn main() -> ExitCode {
    let cli = Cli::parse();

    let log_level = if cli.quiet {
        "error"
    } else if cli.verbose {
        "debug"
    } else {
        "info"
    };
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| log_level.into()))
        .with(tracing_subscriber::fmt::layer().with_target(false).with_writer(std::io::stderr))
        .init();

    let result = match cli.command {
        Command::Validate(args) => run_validate(args),
        Command::Info(args) => run_info(args),
        Command::Bench(args) => run_bench(args),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run_validate(args: ValidateArgs) -> Result<(), String> {
    info!(config = %args.config.display(), "validating config");

    let config = load_config(&args.config).map_err(|e| format!("Config error: {e}"))?;
    println!("Configuration is valid");

    if args.detailed {
        let plan = summarize(&config).map_err(|e| e.to_string())?;
        println!();
        print_plan(&plan);
    }

    Ok(())
}

fn run_info(args: InfoArgs) -> Result<(), String> {
    let config = load_config(&args.config).map_err(|e| format!("Config error: {e}"))?;
    let plan = summarize(&config).map_err(|e| e.to_string())?;

    match args.format {
        OutputFormat::Text => print_plan(&plan),
        format => println!("{}", render(&plan, format)?),
    }

    Ok(())
}

fn run_bench(args: BenchArgs) -> Result<(), String> {
    let config = load_config(&args.config).map_err(|e| format!("Config error: {e}"))?;
    info!(
        method = %config.method,
        rows = args.rows,
        cols = args.cols,
        seed = args.seed,
        "running benchmark"
    );

    let inputs = BenchInputs::synthetic(args.rows, args.cols, args.seed);
    let suite = compare_methods(&bench_plan(&config), &inputs).map_err(|e| format!("Benchmark failed: {e}"))?;

    match args.format {
        OutputFormat::Text => {
            println!(
                "{:<12} {:>14} {:>12} {:>14} {:>12} {:>8}",
                "method", "weight_mse", "weight_sqnr", "output_mse", "output_sqnr", "rounds"
            );
            for report in &suite.results {
                let rounds = report.rounds.map_or_else(|| "-".to_string(), |r| r.to_string());
                println!(
                    "{:<12} {:>14.6e} {:>12.2} {:>14.6e} {:>12.2} {:>8}",
                    report.name,
                    report.weight.mse,
                    report.weight.sqnr_db,
                    report.output.mse,
                    report.output.sqnr_db,
                    rounds
                );
            }
            if let Some(best) = suite.best_by_output_mse() {
                println!();
                println!("Best by output MSE: {}", best.name);
            }
        }
        format => println!("{}", render(&suite, format)?),
    }

    Ok(())
}

fn render<T: Serialize>(value: &T, format: OutputFormat) -> Result<String, String> {
    match format {
        OutputFormat::Json => {
            serde_json::to_string_pretty(value).map_err(|e| format!("JSON serialization error: {e}"))
        }
        OutputFormat::Yaml => serde_yaml::to_string(value).map_err(|e| format!("YAML serialization error: {e}")),
        OutputFormat::Text => Err("text output is not a serialization format".to_string()),
    }
}

fn print_plan(plan: &PlanSummary) {
    println!("Method: {}", plan.method);
    print_quantizer("Weight", &plan.weight);
    if let Some(act) = &plan.act {
        print_quantizer("Activation", act);
    }
    if let Some(hqq) = &plan.hqq {
        println!(
            "HQQ: lp_norm={} beta={} kappa={} iters={} axis={}",
            hqq.lp_norm, hqq.beta, hqq.kappa, hqq.iters, hqq.axis
        );
    }
    if let Some(int8) = &plan.llm_int8 {
        println!("LLM.int8: threshold={}", int8.threshold);
    }
}

fn print_quantizer(role: &str, q: &QuantizerSummary) {
    println!("{role}:");
    println!(
        "  {}-bit {} [{}, {}]",
        q.bit,
        if q.symmetric { "symmetric" } else { "asymmetric" },
        q.min_int,
        q.max_int
    );
    println!("  Granularity: {}", q.granularity);
    println!("  Calibration: {}", q.calib_algo);
    if !q.symmetric {
        println!("  Round zero-point: {}", q.round_zp);
    }
    if q.ste {
        println!("  STE: enabled");
    }
}
