//! LU factorization without pivoting followed by a condition number estimate, on one process.
//!
//! The matrix is random with a dominant diagonal so that no pivoting is needed. With `--exact`
//! the estimate is compared with the condition number of the dense inverse.

use std::time::Instant;

use anyhow::{ensure, Context, Result};
use clap::Parser;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use tessel::{gecondest, getrf_nopiv, norm, Matrix, Norm, Options, SelfComm, Target};

// —————————————————————————————— Entry Point ——————————————————————————————— //

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();
    let args = Args::parse();
    ensure!(args.n > 0 && args.nb > 0, "sizes must be positive");
    let target: Target = args.target.parse().context("parsing --target")?;
    let opts = Options::new().with_target(target);
    let n = args.n;

    let mut rng = StdRng::seed_from_u64(args.seed);
    let dense: Vec<f64> = (0..n * n)
        .map(|k| {
            let value = rng.gen_range(-1.0..1.0);
            if k % n == k / n {
                value + args.dominance * n as f64
            } else {
                value
            }
        })
        .collect();

    let mut a = Matrix::uniform(n, n, args.nb, 1, 1, SelfComm::shared())?;
    a.fill_with(|i, j| dense[i + j * n]);
    let anorm = norm(Norm::One, &a)?;

    let start = Instant::now();
    getrf_nopiv(&mut a, &opts).context("factoring A")?;
    let factored = start.elapsed();
    let rcond = gecondest(Norm::One, &a, anorm, &opts)?;
    let total = start.elapsed();
    info!(n, anorm, rcond, "rcond estimated");

    let exact = if args.exact {
        let exact = exact_rcond(&dense, n).context("A is singular")?;
        if rcond > exact * (1.0 + 1e-8) {
            warn!(rcond, exact, "estimate above the exact value");
        }
        Some(exact)
    } else {
        None
    };

    let report = Report {
        n,
        nb: args.nb,
        target: target.to_string(),
        anorm,
        rcond,
        exact,
        getrf_seconds: factored.as_secs_f64(),
        total_seconds: total.as_secs_f64(),
    };
    if args.json {
        println!("{}", serde_json::to_string(&report)?);
    } else {
        println!(
            "n = {}: rcond = {:.6e}{} (getrf {:.3} ms, total {:.3} ms)",
            n,
            rcond,
            exact
                .map(|e| format!(", exact {:.6e}", e))
                .unwrap_or_default(),
            report.getrf_seconds * 1e3,
            report.total_seconds * 1e3
        );
    }
    Ok(())
}

/// `1 / (||A||_1 ||A^-1||_1)` through a Gauss-Jordan inverse with partial pivoting.
fn exact_rcond(a: &[f64], n: usize) -> Option<f64> {
    let mut work = a.to_vec();
    let mut inv: Vec<f64> = (0..n * n)
        .map(|k| if k % n == k / n { 1.0 } else { 0.0 })
        .collect();
    for col in 0..n {
        let pivot = (col..n).max_by(|&x, &y| {
            work[x + col * n]
                .abs()
                .total_cmp(&work[y + col * n].abs())
        })?;
        if work[pivot + col * n] == 0.0 {
            return None;
        }
        for j in 0..n {
            work.swap(col + j * n, pivot + j * n);
            inv.swap(col + j * n, pivot + j * n);
        }
        let d = work[col + col * n];
        for j in 0..n {
            work[col + j * n] /= d;
            inv[col + j * n] /= d;
        }
        for i in (0..n).filter(|&i| i != col) {
            let f = work[i + col * n];
            if f != 0.0 {
                for j in 0..n {
                    work[i + j * n] -= f * work[col + j * n];
                    inv[i + j * n] -= f * inv[col + j * n];
                }
            }
        }
    }
    let norm1 = |m: &[f64]| {
        (0..n)
            .map(|j| (0..n).map(|i| m[i + j * n].abs()).sum::<f64>())
            .fold(0.0, f64::max)
    };
    Some(1.0 / (norm1(a) * norm1(&inv)))
}

// ——————————————————————————————— Arguments ———————————————————————————————— //

#[derive(Parser)]
#[clap(version = "0.1", author = "CharlyCst")]
struct Args {
    /// Matrix order
    #[clap(short, default_value = "512")]
    n: usize,

    /// Tile size
    #[clap(long, default_value = "64")]
    nb: usize,

    /// Diagonal shift, as a multiple of n
    #[clap(long, default_value = "1.0")]
    dominance: f64,

    /// Execution target: task, nest, batch or devices
    #[clap(short, long, default_value = "task")]
    target: String,

    /// Also compute the exact value from the dense inverse
    #[clap(long)]
    exact: bool,

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
    target: String,
    anorm: f64,
    rcond: f64,
    exact: Option<f64>,
    getrf_seconds: f64,
    total_seconds: f64,
}
