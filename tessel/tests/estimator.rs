use proptest::prelude::*;

use tessel::norm1est::ITMAX;
use tessel::{norm1est, Element, EstimatorState, Matrix, SelfComm, Step};

/// Drive the estimator on a dense column-major operator. Returns the estimate and the number of
/// operator applications.
fn run(n: usize, nb: usize, op: &[f64]) -> (f64, usize) {
    let a = Matrix::<f64>::uniform(n, n, nb, 1, 1, SelfComm::shared()).unwrap();
    let mut x: Matrix<f64> = a.column_like();
    let mut v: Matrix<f64> = a.column_like();
    let mut isgn: Matrix<i64> = a.column_like();
    let mut state = EstimatorState::new();
    let mut applications = 0;
    loop {
        let transpose = match norm1est(&mut x, &mut v, &mut isgn, &mut state).unwrap() {
            Step::Done(est) => return (est, applications),
            Step::Apply => false,
            Step::ApplyConjTrans => true,
        };
        applications += 1;
        let xs = x.to_dense().unwrap();
        let ys: Vec<f64> = (0..n)
            .map(|i| {
                (0..n)
                    .map(|l| (if transpose { op[l + i * n] } else { op[i + l * n] }) * xs[l])
                    .sum()
            })
            .collect();
        x.fill_with(|i, _| ys[i]);
    }
}

fn exact_norm1(n: usize, op: &[f64]) -> f64 {
    (0..n)
        .map(|j| (0..n).map(|i| op[i + j * n].abs()).sum::<f64>())
        .fold(0.0, f64::max)
}

fn operator() -> impl Strategy<Value = (usize, usize, Vec<f64>)> {
    (2_usize..12).prop_flat_map(|n| {
        (
            Just(n),
            1..=n,
            prop::collection::vec(-10.0_f64..10.0, n * n),
        )
    })
}

proptest! {
    #[test]
    fn terminates_with_a_lower_bound((n, nb, op) in operator()) {
        let (est, applications) = run(n, nb, &op);
        prop_assert!(applications <= 2 * ITMAX as usize + 1);
        prop_assert!(est >= 0.0);
        prop_assert!(est <= exact_norm1(n, &op) * (1.0 + 1e-12));
    }

    #[test]
    fn near_singular_operators_terminate((n, nb, mut op) in operator(), scale in 1e6_f64..1e12) {
        // A huge rank-one component, as the inverse of a nearly singular matrix has.
        for j in 0..n {
            for i in 0..n {
                op[i + j * n] += scale * (1.0 + i as f64) * (2.0 - j as f64);
            }
        }
        let (est, applications) = run(n, nb, &op);
        prop_assert!(applications <= 2 * ITMAX as usize + 1);
        prop_assert!(est > 0.0);
        prop_assert!(est <= exact_norm1(n, &op) * (1.0 + 1e-9));
    }
}

/// A copy of a work vector with its own tiles.
fn duplicate<T: Element>(m: &Matrix<T>) -> Matrix<T> {
    let copy: Matrix<T> = m.column_like();
    for ((i, j), handle) in m.local_tiles() {
        *copy.tile(i, j).unwrap().lock() = handle.lock().clone();
    }
    copy
}

#[test]
fn state_can_be_resumed_from_a_copy() {
    // The estimator holds nothing besides the state and the vectors.
    let n = 4;
    let op: Vec<f64> = (0..n * n).map(|k| ((k * 5 + 1) % 7) as f64 - 3.0).collect();
    let (want, _) = run(n, 2, &op);

    let a = Matrix::<f64>::uniform(n, n, 2, 1, 1, SelfComm::shared()).unwrap();
    let mut x: Matrix<f64> = a.column_like();
    let mut v: Matrix<f64> = a.column_like();
    let mut isgn: Matrix<i64> = a.column_like();
    let mut state = EstimatorState::new();
    let got = loop {
        let step = norm1est(&mut x, &mut v, &mut isgn, &mut state).unwrap();
        // Hand everything over to fresh copies before resuming.
        let saved = state;
        x = duplicate(&x);
        v = duplicate(&v);
        isgn = duplicate(&isgn);
        state = saved;

        let transpose = match step {
            Step::Done(est) => break est,
            Step::Apply => false,
            Step::ApplyConjTrans => true,
        };
        let xs = x.to_dense().unwrap();
        let ys: Vec<f64> = (0..n)
            .map(|i| {
                (0..n)
                    .map(|l| (if transpose { op[l + i * n] } else { op[i + l * n] }) * xs[l])
                    .sum()
            })
            .collect();
        x.fill_with(|i, _| ys[i]);
    };
    assert_eq!(got, want);
}
