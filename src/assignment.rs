//! Exact minimum-cost assignment on a square cost matrix.
//!
//! This is the combinatorial core of the exact transport solver: with uniform marginals, the
//! extreme points of the transportation polytope are (scaled) assignments, so an assignment
//! solver is all the exact OT path needs.

use crate::{Error, Result};
use ndarray::ArrayView2;

/// Solve `min_perm sum_i cost[i, perm[i]]` exactly.
///
/// Potential-based Hungarian / Kuhn–Munkres, O(n³): each row is inserted by a
/// Dijkstra-style shortest augmenting path over reduced costs `c_ij - u_i - v_j`.
/// Ties are broken by the lowest column index, so the result is deterministic.
///
/// Returns `perm` with `perm[i]` the column assigned to row `i`.
pub fn min_cost_assignment(cost: &ArrayView2<f64>) -> Result<Vec<usize>> {
    let n = cost.nrows();
    if cost.ncols() != n {
        return Err(Error::Shape("assignment cost matrix must be square"));
    }
    if n == 0 {
        return Ok(Vec::new());
    }
    if cost.iter().any(|c| !c.is_finite()) {
        return Err(Error::Domain("assignment cost matrix contains NaN/Inf"));
    }

    let inf = f64::INFINITY;
    // 1-indexed; index 0 is the virtual source row/column.
    let mut u = vec![0.0f64; n + 1];
    let mut v = vec![0.0f64; n + 1];
    // p[j]: row assigned to column j (0 = free).
    let mut p = vec![0usize; n + 1];
    let mut way = vec![0usize; n + 1];

    for i in 1..=n {
        p[0] = i;
        let mut j0 = 0usize;
        let mut min_val = vec![inf; n + 1];
        let mut used = vec![false; n + 1];

        loop {
            used[j0] = true;
            let i0 = p[j0];
            let mut delta = inf;
            let mut j1 = 0usize;

            for j in 1..=n {
                if used[j] {
                    continue;
                }
                let reduced = cost[[i0 - 1, j - 1]] - u[i0] - v[j];
                if reduced < min_val[j] {
                    min_val[j] = reduced;
                    way[j] = j0;
                }
                if min_val[j] < delta {
                    delta = min_val[j];
                    j1 = j;
                }
            }
            if j1 == 0 {
                return Err(Error::Numerical(
                    "assignment: no augmenting path (non-finite reduced costs)".to_string(),
                ));
            }

            for j in 0..=n {
                if used[j] {
                    u[p[j]] += delta;
                    v[j] -= delta;
                } else {
                    min_val[j] -= delta;
                }
            }

            j0 = j1;
            if p[j0] == 0 {
                break;
            }
        }

        // Augment along the recorded path.
        loop {
            let j1 = way[j0];
            p[j0] = p[j1];
            j0 = j1;
            if j0 == 0 {
                break;
            }
        }
    }

    let mut perm = vec![usize::MAX; n];
    for j in 1..=n {
        if p[j] != 0 {
            perm[p[j] - 1] = j - 1;
        }
    }
    if perm.iter().any(|&j| j == usize::MAX) {
        return Err(Error::Numerical(
            "assignment: failed to construct a full matching".to_string(),
        ));
    }
    Ok(perm)
}

/// Total cost of a permutation of the columns of a square `cost`.
pub fn assignment_cost(cost: &ArrayView2<f64>, perm: &[usize]) -> Result<f64> {
    let (n, m) = cost.dim();
    if n != m || perm.len() != n {
        return Err(Error::Shape("perm length must match a square cost matrix"));
    }
    let mut seen = vec![false; n];
    for &j in perm {
        if j >= n || seen[j] {
            return Err(Error::Domain("perm is not a permutation"));
        }
        seen[j] = true;
    }
    Ok(perm.iter().enumerate().map(|(i, &j)| cost[[i, j]]).sum())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{array, Array2};
    use proptest::prelude::*;

    fn is_permutation(p: &[usize]) -> bool {
        let n = p.len();
        let mut seen = vec![false; n];
        for &j in p {
            if j >= n || seen[j] {
                return false;
            }
            seen[j] = true;
        }
        true
    }

    fn brute_force_min(cost: &Array2<f64>) -> f64 {
        fn rec(cost: &Array2<f64>, row: usize, used: &mut Vec<bool>, acc: f64, best: &mut f64) {
            let n = cost.nrows();
            if row == n {
                if acc < *best {
                    *best = acc;
                }
                return;
            }
            for j in 0..n {
                if !used[j] {
                    used[j] = true;
                    rec(cost, row + 1, used, acc + cost[[row, j]], best);
                    used[j] = false;
                }
            }
        }
        let mut best = f64::INFINITY;
        rec(cost, 0, &mut vec![false; cost.nrows()], 0.0, &mut best);
        best
    }

    #[test]
    fn identity_cost_assigns_diagonal() {
        let c = array![[0.0, 1.0, 1.0], [1.0, 0.0, 1.0], [1.0, 1.0, 0.0]];
        let p = min_cost_assignment(&c.view()).unwrap();
        assert_eq!(p, vec![0, 1, 2]);
    }

    #[test]
    fn swapped_2x2() {
        let c = array![[5.0, 1.0], [1.0, 5.0]];
        let p = min_cost_assignment(&c.view()).unwrap();
        assert_eq!(p, vec![1, 0]);
        assert_eq!(assignment_cost(&c.view(), &p).unwrap(), 2.0);
    }

    #[test]
    fn cost_of_an_invalid_permutation_is_an_error() {
        let c = array![[5.0, 1.0], [1.0, 5.0]];
        assert!(matches!(assignment_cost(&c.view(), &[0]), Err(Error::Shape(_))));
        assert!(matches!(assignment_cost(&c.view(), &[0, 2]), Err(Error::Domain(_))));
        assert!(matches!(assignment_cost(&c.view(), &[1, 1]), Err(Error::Domain(_))));
        let r = Array2::<f64>::zeros((2, 3));
        assert!(assignment_cost(&r.view(), &[0, 1]).is_err());
    }

    #[test]
    fn greedy_trap_is_solved_exactly() {
        // Greedy picks (0,0)=1 then (1,1)=100; the optimum is (0,1)+(1,0)=2+2.
        let c = array![[1.0, 2.0], [2.0, 100.0]];
        let p = min_cost_assignment(&c.view()).unwrap();
        assert_eq!(p, vec![1, 0]);
    }

    #[test]
    fn empty_and_non_square() {
        let e = Array2::<f64>::zeros((0, 0));
        assert!(min_cost_assignment(&e.view()).unwrap().is_empty());
        let r = Array2::<f64>::zeros((2, 3));
        assert!(min_cost_assignment(&r.view()).is_err());
        let mut nan = Array2::<f64>::zeros((2, 2));
        nan[[1, 0]] = f64::NAN;
        assert!(min_cost_assignment(&nan.view()).is_err());
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 64,
            .. ProptestConfig::default()
        })]
        #[test]
        fn prop_matches_brute_force(
            n in 1usize..7,
            seed in any::<u64>(),
        ) {
            use rand::{Rng, SeedableRng};
            use rand_chacha::ChaCha8Rng;

            let mut rng = ChaCha8Rng::seed_from_u64(seed);
            let mut c = Array2::<f64>::zeros((n, n));
            for v in c.iter_mut() {
                *v = rng.random_range(0.0..10.0);
            }
            let p = min_cost_assignment(&c.view()).unwrap();
            prop_assert!(is_permutation(&p));
            let got = assignment_cost(&c.view(), &p).unwrap();
            let want = brute_force_min(&c);
            prop_assert!((got - want).abs() <= 1e-9, "got={got} want={want}");
        }
    }
}
