//! Deep Shrink CLI
//!
//! Prints the scale factor a deep shrink node applies at each sampling step,
//! or the node registry as JSON.

use std::ops::RangeInclusive;
use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use tracing::{info, warn};

use deep_shrink::config::{DeepShrinkConfig, ModelSamplingConfig, NodeConfig};
use deep_shrink::nodes::{
    BLOCK_NUMBER_RANGE, DEFAULT_CURVE_CONFIG, DOWNSCALE_FACTOR_RANGE,
    GradientPatchModelAddDownscale, GradientPatchModelAddDownscaleAdvanced, PERCENT_RANGE,
    node_definitions,
};
use deep_shrink::resize::scaled_size;
use deep_shrink::scale_curve::{ScaleCurve, SigmaScaleResolver};
use deep_shrink::schedule::DiscreteModelSampling;

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "Inspect Kohya Deep Shrink scale curves over a sampling schedule"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Linear ramp node (GradientPatchModelAddDownscale)
    Basic {
        #[command(flatten)]
        common: CommonArgs,

        /// Downscale factor at start_percent
        #[arg(long, default_value_t = 2.0, value_parser = parse_downscale_factor)]
        downscale_factor: f64,

        /// Progress at which the ramp starts
        #[arg(long, default_value_t = 0.0, value_parser = parse_percent)]
        start_percent: f64,

        /// Progress at which full resolution is restored
        #[arg(long, default_value_t = 0.35, value_parser = parse_percent)]
        end_percent: f64,

        #[command(flatten)]
        table: TableArgs,
    },
    /// Curve node (GradientPatchModelAddDownscaleAdvanced)
    Advanced {
        #[command(flatten)]
        common: CommonArgs,

        /// Curve points, `<percent> <scale>` separated by newlines or `;`
        #[arg(long, default_value = DEFAULT_CURVE_CONFIG)]
        curve: String,

        /// Hold each point's scale until the next point instead of interpolating
        #[arg(long)]
        step_hold: bool,

        #[command(flatten)]
        table: TableArgs,
    },
    /// Node and sampling schedule from a JSON config file
    File {
        /// Config file path
        path: PathBuf,

        #[command(flatten)]
        table: TableArgs,
    },
    /// Print the node definitions as JSON
    Nodes,
}

#[derive(Args, Debug)]
struct CommonArgs {
    /// Input block to downscale
    #[arg(long, default_value_t = 3, value_parser = clap::value_parser!(u32).range(
        *BLOCK_NUMBER_RANGE.start() as i64..=*BLOCK_NUMBER_RANGE.end() as i64
    ))]
    block_number: u32,

    /// Downscale before the skip connection is captured
    #[arg(long)]
    before_skip: bool,
}

#[derive(Args, Debug)]
struct TableArgs {
    /// Number of sampling steps to tabulate
    #[arg(long, default_value_t = 20)]
    steps: usize,

    /// Explicit sigmas to resolve instead of a step schedule
    #[arg(long = "sigma")]
    sigmas: Vec<f64>,

    /// Latent height/width entering the patched block
    #[arg(long, default_value_t = 32)]
    feature_size: usize,
}

fn parse_in_range(value: &str, range: &RangeInclusive<f64>) -> Result<f64, String> {
    let value: f64 = value.parse().map_err(|e| format!("{e}"))?;
    if range.contains(&value) {
        Ok(value)
    } else {
        Err(format!(
            "{value} is not in {}..={}",
            range.start(),
            range.end()
        ))
    }
}

fn parse_percent(value: &str) -> Result<f64, String> {
    parse_in_range(value, &PERCENT_RANGE)
}

fn parse_downscale_factor(value: &str) -> Result<f64, String> {
    parse_in_range(value, &DOWNSCALE_FACTOR_RANGE)
}

fn print_table<C: ScaleCurve>(
    resolver: &SigmaScaleResolver<C>,
    sigmas: &[f64],
    feature_size: usize,
) {
    println!("{:>5}  {:>12}  {:>8}  {:>7}  {:>9}", "step", "sigma", "percent", "scale", "size");
    for (step, &sigma) in sigmas.iter().enumerate() {
        let scale = resolver.resolve(sigma);
        let percent = resolver
            .samples()
            .last_percent_above(sigma)
            .map_or_else(|| "-".to_string(), |p| format!("{p:.2}"));
        let size = scaled_size(feature_size, scale)
            .map_or_else(|| "-".to_string(), |size| format!("{size}x{size}"));
        println!(
            "{:>5}  {:>12.6}  {:>8}  {:>7.4}  {:>9}",
            step, sigma, percent, scale, size
        );
    }
}

fn run_table<C: ScaleCurve>(
    curve: C,
    sampling_config: &ModelSamplingConfig,
    table: &TableArgs,
) -> Result<()> {
    let sampling = DiscreteModelSampling::new(sampling_config);
    info!(
        "Sigma range: {:.4} .. {:.4}",
        sampling.sigma_min(),
        sampling.sigma_max()
    );
    let sigmas = if table.sigmas.is_empty() {
        let mut sigmas = sampling.step_sigmas(table.steps);
        // terminal sigma is never evaluated by the model
        sigmas.pop();
        sigmas
    } else {
        table.sigmas.clone()
    };
    if sigmas.is_empty() {
        warn!("No sigmas to tabulate");
    }

    let resolver = SigmaScaleResolver::new(curve, &sampling);
    print_table(&resolver, &sigmas, table.feature_size);
    Ok(())
}

fn run_node(node: NodeConfig, sampling: &ModelSamplingConfig, table: &TableArgs) -> Result<()> {
    match node {
        NodeConfig::Basic(node) => {
            info!(
                "{} block={} factor={} window={}..{} after_skip={}",
                GradientPatchModelAddDownscale::CLASS_NAME,
                node.block_number,
                node.downscale_factor,
                node.start_percent,
                node.end_percent,
                node.downscale_after_skip
            );
            run_table(node.curve(), sampling, table)
        }
        NodeConfig::Advanced(node) => {
            info!(
                "{} block={} interpolate={} after_skip={}",
                GradientPatchModelAddDownscaleAdvanced::CLASS_NAME,
                node.block_number,
                node.interpolate,
                node.downscale_after_skip
            );
            let curve = node.curve().context("Failed to parse curve")?;
            run_table(curve, sampling, table)
        }
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("deep_shrink=info".parse()?),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let default_sampling = ModelSamplingConfig::default();

    match cli.command {
        Command::Basic {
            common,
            downscale_factor,
            start_percent,
            end_percent,
            table,
        } => {
            let node = GradientPatchModelAddDownscale {
                block_number: common.block_number,
                downscale_factor,
                start_percent,
                end_percent,
                downscale_after_skip: !common.before_skip,
            };
            run_node(NodeConfig::Basic(node), &default_sampling, &table)
        }
        Command::Advanced {
            common,
            curve,
            step_hold,
            table,
        } => {
            let node = GradientPatchModelAddDownscaleAdvanced {
                block_number: common.block_number,
                downscale_after_skip: !common.before_skip,
                interpolate: !step_hold,
                config: curve.replace(';', "\n"),
            };
            run_node(NodeConfig::Advanced(node), &default_sampling, &table)
        }
        Command::File { path, table } => {
            let config = DeepShrinkConfig::load(&path)
                .with_context(|| format!("Failed to load {}", path.display()))?;
            run_node(config.node, &config.sampling, &table)
        }
        Command::Nodes => {
            let json = serde_json::to_string_pretty(&node_definitions())?;
            println!("{json}");
            Ok(())
        }
    }
}
