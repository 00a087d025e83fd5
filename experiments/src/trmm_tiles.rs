//! Trailing-block triangular multiply over tiles, timed and checked against a dense product.
//!
//! A is one block row of `k` columns cut in `nb` wide tiles, its last tile being the triangular
//! diagonal block; B is `k x n`. Only the last block row of B changes.

use std::time::Instant;

use anyhow::{ensure, Context, Result};
use clap::Parser;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use tracing::info;
use tracing_subscriber::EnvFilter;

use tessel::layout::{device_round_robin, single_process, uniform_blocksize};
use tessel::{trmm, Diag, Matrix, SelfComm, Side, Target, TriangularMatrix, Uplo};

// —————————————————————————————— Entry Point ——————————————————————————————— //

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();
    let args = Args::parse();
    ensure!(
        args.k > 0 && args.nb > 0 && args.n > 0 && args.devices > 0,
        "sizes must be positive"
    );
    let target: Target = args.target.parse().context("parsing --target")?;

    let uplo = if args.upper { Uplo::Upper } else { Uplo::Lower };
    let diag = if args.unit { Diag::Unit } else { Diag::NonUnit };
    let (k, n, nb) = (args.k, args.n, args.nb);
    let r = uniform_blocksize(k, nb)((k + nb - 1) / nb - 1);

    let mut rng = StdRng::seed_from_u64(args.seed);
    let a_dense: Vec<f64> = (0..r * k).map(|_| rng.gen_range(-1.0..1.0)).collect();
    let b_dense: Vec<f64> = (0..k * n).map(|_| rng.gen_range(-1.0..1.0)).collect();

    let comm = SelfComm::shared();
    let mut a = Matrix::new(
        r,
        k,
        uniform_blocksize(r, r),
        uniform_blocksize(k, nb),
        single_process(),
        device_round_robin(args.devices),
        comm.clone(),
    );
    a.insert_local_tiles();
    a.fill_with(|i, j| a_dense[i + j * r]);
    let mut b = Matrix::new(
        k,
        n,
        uniform_blocksize(k, nb),
        uniform_blocksize(n, nb),
        single_process(),
        device_round_robin(args.devices),
        comm,
    );
    b.insert_local_tiles();
    b.fill_with(|i, j| b_dense[i + j * k]);

    let start = Instant::now();
    let tri = TriangularMatrix::new(uplo, diag, a);
    trmm(Side::Left, diag, args.alpha, tri, b.clone(), 0, target)?;
    let elapsed = start.elapsed();

    let got = b.to_dense()?;
    let want = reference(&a_dense, &b_dense, (k, n, r), uplo, diag, args.alpha);
    let max_error = got
        .iter()
        .zip(&want)
        .map(|(g, w)| (g - w).abs())
        .fold(0.0, f64::max);
    info!(%target, ?uplo, ?diag, k, n, nb, max_error, "trmm done");

    let report = Report {
        target: target.to_string(),
        uplo: format!("{:?}", uplo),
        diag: format!("{:?}", diag),
        k,
        n,
        nb,
        seconds: elapsed.as_secs_f64(),
        max_error,
    };
    if args.json {
        println!("{}", serde_json::to_string(&report)?);
    } else {
        println!(
            "{} {:?} {:?}: {:.3} ms, max error {:.2e}",
            report.target,
            uplo,
            diag,
            report.seconds * 1e3,
            max_error
        );
    }
    ensure!(max_error < 1e-10, "result differs from the dense product");
    Ok(())
}

/// Dense `alpha A B` on the last `r` rows of B.
fn reference(
    a: &[f64],
    b: &[f64],
    (k, n, r): (usize, usize, usize),
    uplo: Uplo,
    diag: Diag,
    alpha: f64,
) -> Vec<f64> {
    let mut out = b.to_vec();
    for j in 0..n {
        for i in 0..r {
            let mut sum = 0.0;
            for l in 0..k {
                let jj = l as isize - (k - r) as isize;
                let aij = if jj < 0 {
                    a[i + l * r]
                } else {
                    let jj = jj as usize;
                    let kept = match uplo {
                        Uplo::Lower => i > jj,
                        Uplo::Upper => i < jj,
                    };
                    if i == jj && diag == Diag::Unit {
                        1.0
                    } else if i == jj || kept {
                        a[i + l * r]
                    } else {
                        0.0
                    }
                };
                sum += aij * b[l + j * k];
            }
            out[(k - r + i) + j * k] = alpha * sum;
        }
    }
    out
}

// ——————————————————————————————— Arguments ———————————————————————————————— //

#[derive(Parser)]
#[clap(version = "0.1", author = "CharlyCst")]
struct Args {
    /// Execution target: task, nest, batch or devices
    #[clap(short, long, default_value = "task")]
    target: String,

    /// Columns of A, rows of B
    #[clap(short, default_value = "512")]
    k: usize,

    /// Columns of B
    #[clap(short, default_value = "256")]
    n: usize,

    /// Tile size
    #[clap(long, default_value = "64")]
    nb: usize,

    /// Number of simulated devices
    #[clap(short, long, default_value = "2")]
    devices: usize,

    #[clap(long, default_value = "1.0")]
    alpha: f64,

    /// Use the upper triangle of the diagonal block
    #[clap(long)]
    upper: bool,

    /// Assume a unit diagonal
    #[clap(long)]
    unit: bool,

    #[clap(long, default_value = "42")]
    seed: u64,

    /// Print the report as JSON
    #[clap(long)]
    json: bool,
}

#[derive(Serialize)]
struct Report {
    target: String,
    uplo: String,
    diag: String,
    k: usize,
    n: usize,
    nb: usize,
    seconds: f64,
    max_error: f64,
}
