//! Condition number estimate of a synthetic LU factored matrix, over a group of thread ranks.
//!
//! Every rank generates the same factors `L` (unit lower) and `U` (upper, dominant diagonal),
//! keeps the tiles it owns in a 2D block cyclic layout, measures `||L U||` with `norm` and
//! estimates the reciprocal condition number with `gecondest`.

use std::sync::Arc;
use std::time::Instant;

use anyhow::{ensure, Context, Result};
use clap::Parser;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use tracing::info;
use tracing_subscriber::EnvFilter;

use tessel::{gecondest, norm, spawn_group, Communicator, Matrix, Norm, Options, Target};

// —————————————————————————————— Entry Point ——————————————————————————————— //

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();
    let args = Args::parse();
    ensure!(args.n > 0 && args.nb > 0, "sizes must be positive");
    ensure!(args.p * args.q > 0, "the process grid must not be empty");
    let target: Target = args.target.parse().context("parsing --target")?;
    let norm_kind = match args.norm.as_str() {
        "1" | "o" | "one" => Norm::One,
        "i" | "inf" => Norm::Inf,
        other => anyhow::bail!("unknown norm '{}', expected one or inf", other),
    };

    let (l, u) = factors(args.n, args.seed);
    let opts = Options::new().with_target(target);

    let start = Instant::now();
    let results = spawn_group(args.p * args.q, |comm| {
        run_rank(&args, norm_kind, &l, &u, &opts, comm)
    })?;
    let elapsed = start.elapsed();

    let mut outcomes = Vec::with_capacity(results.len());
    for (rank, result) in results.into_iter().enumerate() {
        outcomes.push(result.with_context(|| format!("rank {}", rank))?);
    }
    let (anorm, rcond, collectives) = outcomes[0];
    ensure!(
        outcomes.iter().all(|&(a, r, _)| a == anorm && r == rcond),
        "ranks returned different estimates"
    );
    info!(anorm, rcond, collectives, "estimate agreed on every rank");

    let report = Report {
        n: args.n,
        nb: args.nb,
        ranks: args.p * args.q,
        target: target.to_string(),
        norm: format!("{:?}", norm_kind),
        anorm,
        rcond,
        collectives,
        seconds: elapsed.as_secs_f64(),
    };
    if args.json {
        println!("{}", serde_json::to_string(&report)?);
    } else {
        println!(
            "n = {}, {} ranks: Anorm = {:.6e}, rcond = {:.6e} ({} collectives, {:.3} ms)",
            report.n,
            report.ranks,
            anorm,
            rcond,
            collectives,
            report.seconds * 1e3
        );
    }
    Ok(())
}

fn run_rank(
    args: &Args,
    norm_kind: Norm,
    l: &[f64],
    u: &[f64],
    opts: &Options,
    comm: Arc<dyn Communicator>,
) -> tessel::Result<(f64, f64, usize)> {
    let n = args.n;

    // A = L U, to measure its norm.
    let mut a: Matrix<f64> = Matrix::uniform(n, n, args.nb, args.p, args.q, comm.clone())?;
    a.fill_with(|i, j| (0..=i.min(j)).map(|k| l[i + k * n] * u[k + j * n]).sum());
    let anorm = norm(norm_kind, &a)?;

    // L and U packed in one matrix, as a factorization leaves them.
    let mut lu = Matrix::uniform(n, n, args.nb, args.p, args.q, comm.clone())?;
    lu.fill_with(|i, j| if i > j { l[i + j * n] } else { u[i + j * n] });
    let rcond = gecondest(norm_kind, &lu, anorm, opts)?;
    Ok((anorm, rcond, comm.collective_calls()))
}

/// Column-major `(L, U)`: unit lower with small entries, upper with a dominant diagonal.
fn factors(n: usize, seed: u64) -> (Vec<f64>, Vec<f64>) {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut l = vec![0.0; n * n];
    let mut u = vec![0.0; n * n];
    for j in 0..n {
        for i in 0..n {
            if i > j {
                l[i + j * n] = rng.gen_range(-0.5..0.5) / n as f64;
            } else if i == j {
                l[i + j * n] = 1.0;
                u[i + j * n] = rng.gen_range(1.0..10.0);
            } else {
                u[i + j * n] = rng.gen_range(-1.0..1.0);
            }
        }
    }
    (l, u)
}

// ——————————————————————————————— Arguments ———————————————————————————————— //

#[derive(Parser)]
#[clap(version = "0.1", author = "CharlyCst")]
struct Args {
    /// Matrix order
    #[clap(short, default_value = "1024")]
    n: usize,

    /// Tile size
    #[clap(long, default_value = "128")]
    nb: usize,

    /// Rows of the process grid
    #[clap(short, default_value = "2")]
    p: usize,

    /// Columns of the process grid
    #[clap(short, default_value = "2")]
    q: usize,

    /// Execution target: task, nest, batch or devices
    #[clap(short, long, default_value = "task")]
    target: String,

    /// Norm to estimate the condition number in: one or inf
    #[clap(long, default_value = "one")]
    norm: String,

    #[clap(long, default_value = "42")]
    seed: u64,

    /// Print the report as JSON
    #[clap(long)]
    json: bool,
}

#[derive(Serialize)]
struct Report {
    n: usize,
    nb: usize,
    ranks: usize,
    target: String,
    norm: String,
    anorm: f64,
    rcond: f64,
    collectives: usize,
    seconds: f64,
}
