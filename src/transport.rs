//! Optimal transport couplings between a source and a target mini-batch.
//!
//! The problem solved here is the discrete Kantorovich problem with **uniform** marginals:
//!
//! \[
//! \gamma^\star = \arg\min_{\gamma \ge 0} \langle \gamma, C \rangle
//! \quad\text{s.t.}\quad \gamma \mathbf{1} = \tfrac1n \mathbf{1},\;
//! \gamma^\top \mathbf{1} = \tfrac1m \mathbf{1}.
//! \]
//!
//! Two methods are exposed:
//!
//! - [`TransportMethod::Exact`]: replicate each source row `L/n` times and each target column
//!   `L/m` times (`L = lcm(n, m)`), solve the resulting `L×L` assignment exactly, and fold the
//!   matching back with mass `1/L` per matched cell. Integral supplies make this an exact
//!   vertex of the transportation polytope, not an approximation.
//! - [`TransportMethod::Entropic`]: log-domain Sinkhorn from `wass`. Blurrier plans, cheaper
//!   for large batches; the marginal error is bounded by `tol`, not zero.
//!
//! Everything here is host-side `ndarray`. The solver never sees a tensor that carries a
//! gradient tape.

use crate::assignment::min_cost_assignment;
use crate::{Error, Result};
use ndarray::{Array1, Array2, ArrayView2, Axis};
use serde::{Deserialize, Serialize};

/// Largest expanded assignment size the exact solver accepts (`lcm(n, m)`).
///
/// Equal batch sizes give `L = n`, so this only bites for awkward rectangular pairs.
pub const MAX_EXPANDED_SIZE: usize = 1024;

/// How to compute the coupling.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TransportMethod {
    /// Exact network-flow optimum (assignment reduction).
    Exact,
    /// Entropic OT via log-domain Sinkhorn.
    Entropic {
        /// Entropic regularization `ε` (larger = smoother plan).
        reg: f32,
        /// Maximum Sinkhorn iterations.
        max_iter: usize,
        /// Convergence tolerance on the marginal error.
        tol: f32,
    },
}

impl Default for TransportMethod {
    fn default() -> Self {
        Self::Exact
    }
}

/// A transport plan `gamma` (`n_src × n_trg`).
#[derive(Debug, Clone)]
pub struct Coupling {
    plan: Array2<f32>,
}

impl Coupling {
    /// Wrap an existing plan after checking it is finite and nonnegative.
    pub fn from_plan(plan: Array2<f32>) -> Result<Self> {
        if plan.iter().any(|&g| !g.is_finite()) {
            return Err(Error::Numerical("coupling contains NaN/Inf".to_string()));
        }
        if plan.iter().any(|&g| g < 0.0) {
            return Err(Error::Numerical("coupling has negative mass".to_string()));
        }
        Ok(Self { plan })
    }

    pub fn plan(&self) -> &Array2<f32> {
        &self.plan
    }

    pub fn shape(&self) -> (usize, usize) {
        self.plan.dim()
    }

    pub fn row_sums(&self) -> Array1<f32> {
        self.plan.sum_axis(Axis(1))
    }

    pub fn col_sums(&self) -> Array1<f32> {
        self.plan.sum_axis(Axis(0))
    }

    /// Largest absolute deviation of any row/column sum from its uniform target.
    pub fn max_marginal_error(&self) -> f32 {
        let (n, m) = self.plan.dim();
        let a = 1.0 / n as f32;
        let b = 1.0 / m as f32;
        let row_err = self
            .row_sums()
            .iter()
            .fold(0.0f32, |acc, &s| acc.max((s - a).abs()));
        let col_err = self
            .col_sums()
            .iter()
            .fold(0.0f32, |acc, &s| acc.max((s - b).abs()));
        row_err.max(col_err)
    }

    /// \(\langle \gamma, C \rangle\).
    pub fn transport_cost(&self, cost: &ArrayView2<f32>) -> Result<f32> {
        if cost.dim() != self.plan.dim() {
            return Err(Error::Shape("cost and coupling must have the same shape"));
        }
        let mut s = 0.0f64;
        for (g, c) in self.plan.iter().zip(cost.iter()) {
            s += (*g as f64) * (*c as f64);
        }
        Ok(s as f32)
    }
}

/// Solves the uniform-marginal OT problem for one batch pair.
#[derive(Debug, Clone, Copy, Default)]
pub struct TransportSolver {
    pub method: TransportMethod,
}

impl TransportSolver {
    pub fn new(method: TransportMethod) -> Self {
        Self { method }
    }

    /// Compute the coupling for a cost matrix `C` (`n × m`, finite).
    pub fn solve(&self, cost: &ArrayView2<f32>) -> Result<Coupling> {
        let (n, m) = cost.dim();
        if n == 0 || m == 0 {
            return Err(Error::Domain("cost matrix must be non-empty"));
        }
        if cost.iter().any(|c| !c.is_finite()) {
            return Err(Error::Numerical("cost matrix contains NaN/Inf".to_string()));
        }
        match self.method {
            TransportMethod::Exact => exact_uniform_coupling(cost),
            TransportMethod::Entropic { reg, max_iter, tol } => {
                entropic_uniform_coupling(cost, reg, max_iter, tol)
            }
        }
    }
}

fn gcd(mut a: usize, mut b: usize) -> usize {
    while b != 0 {
        let t = a % b;
        a = b;
        b = t;
    }
    a
}

/// Exact coupling via the lcm-expanded assignment problem.
pub fn exact_uniform_coupling(cost: &ArrayView2<f32>) -> Result<Coupling> {
    let (n, m) = cost.dim();
    if n == 0 || m == 0 {
        return Err(Error::Domain("cost matrix must be non-empty"));
    }
    let l = n / gcd(n, m) * m;
    if l > MAX_EXPANDED_SIZE {
        return Err(Error::Config(format!(
            "exact transport between batches of {n} and {m} expands to {l} > {MAX_EXPANDED_SIZE}; \
             use equal batch sizes or the entropic solver"
        )));
    }
    let row_rep = l / n;
    let col_rep = l / m;

    // Row copy r of source i sits at i*row_rep + r; same for columns.
    let mut expanded = Array2::<f64>::zeros((l, l));
    for ((ei, ej), v) in expanded.indexed_iter_mut() {
        *v = cost[[ei / row_rep, ej / col_rep]] as f64;
    }
    let perm = min_cost_assignment(&expanded.view())?;

    let mass = 1.0 / l as f32;
    let mut plan = Array2::<f32>::zeros((n, m));
    for (ei, &ej) in perm.iter().enumerate() {
        plan[[ei / row_rep, ej / col_rep]] += mass;
    }
    Coupling::from_plan(plan)
}

/// Entropic coupling (log-domain Sinkhorn, uniform marginals).
pub fn entropic_uniform_coupling(
    cost: &ArrayView2<f32>,
    reg: f32,
    max_iter: usize,
    tol: f32,
) -> Result<Coupling> {
    let (n, m) = cost.dim();
    if !(reg > 0.0) || !reg.is_finite() {
        return Err(Error::Domain("reg must be positive and finite"));
    }
    if max_iter == 0 {
        return Err(Error::Domain("max_iter must be >= 1"));
    }
    if !(tol > 0.0) || !tol.is_finite() {
        return Err(Error::Domain("tol must be positive and finite"));
    }

    let a = Array1::<f32>::from_elem(n, 1.0 / n as f32);
    let b = Array1::<f32>::from_elem(m, 1.0 / m as f32);
    let cost = cost.to_owned();
    let (plan, _dist, _iters) =
        wass::sinkhorn_log_with_convergence(&a, &b, &cost, reg, max_iter, tol)
            .map_err(|_| Error::Numerical("sinkhorn coupling did not converge".to_string()))?;
    Coupling::from_plan(plan)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::array;
    use proptest::prelude::*;

    fn random_cost(n: usize, m: usize, seed: u64) -> Array2<f32> {
        use rand::{Rng, SeedableRng};
        use rand_chacha::ChaCha8Rng;
        let mut rng = ChaCha8Rng::seed_from_u64(seed);
        let mut c = Array2::<f32>::zeros((n, m));
        for v in c.iter_mut() {
            *v = rng.random_range(0.0..5.0);
        }
        c
    }

    #[test]
    fn hand_computed_2x2_optimum() {
        // Anti-diagonal is cheaper: 1+1 < 0+4.
        let c = array![[0.0f32, 1.0], [1.0, 4.0]];
        let gamma = exact_uniform_coupling(&c.view()).unwrap();
        let p = gamma.plan();
        assert!((p[[0, 1]] - 0.5).abs() < 1e-6);
        assert!((p[[1, 0]] - 0.5).abs() < 1e-6);
        assert!(p[[0, 0]].abs() < 1e-6 && p[[1, 1]].abs() < 1e-6);
        assert!((gamma.transport_cost(&c.view()).unwrap() - 1.0).abs() < 1e-6);
    }

    #[test]
    fn rectangular_split_mass() {
        // Two sources, four targets: each source ships 1/2 split across its two cheap targets.
        let c = array![[0.0f32, 0.0, 9.0, 9.0], [9.0, 9.0, 0.0, 0.0]];
        let gamma = exact_uniform_coupling(&c.view()).unwrap();
        assert!(gamma.max_marginal_error() < 1e-6);
        assert!(gamma.transport_cost(&c.view()).unwrap().abs() < 1e-6);
        for j in 0..4 {
            assert!((gamma.plan().column(j).sum() - 0.25).abs() < 1e-6);
        }
    }

    #[test]
    fn exact_is_deterministic() {
        let c = random_cost(6, 6, 7);
        let g1 = exact_uniform_coupling(&c.view()).unwrap();
        let g2 = exact_uniform_coupling(&c.view()).unwrap();
        assert_eq!(g1.plan(), g2.plan());
    }

    #[test]
    fn rejects_empty_non_finite_and_oversized() {
        let solver = TransportSolver::default();
        let e = Array2::<f32>::zeros((0, 3));
        assert!(solver.solve(&e.view()).is_err());
        let mut c = Array2::<f32>::zeros((2, 2));
        c[[0, 1]] = f32::NAN;
        assert!(matches!(solver.solve(&c.view()), Err(Error::Numerical(_))));
        let big = Array2::<f32>::zeros((37, 41));
        assert!(matches!(solver.solve(&big.view()), Err(Error::Config(_))));
    }

    #[test]
    fn entropic_marginals_within_tolerance() {
        let c = random_cost(5, 5, 11);
        let solver = TransportSolver::new(TransportMethod::Entropic {
            reg: 0.5,
            max_iter: 10_000,
            tol: 1e-4,
        });
        let gamma = solver.solve(&c.view()).unwrap();
        assert!(gamma.max_marginal_error() < 1e-2);
        assert!(gamma.plan().iter().all(|&g| g >= 0.0));
    }

    #[test]
    fn entropic_cost_is_no_better_than_exact() {
        let c = random_cost(6, 6, 3);
        let exact = exact_uniform_coupling(&c.view()).unwrap();
        let ent = entropic_uniform_coupling(&c.view(), 0.5, 20_000, 1e-5).unwrap();
        let ce = exact.transport_cost(&c.view()).unwrap();
        let cs = ent.transport_cost(&c.view()).unwrap();
        assert!(ce <= cs + 1e-3, "exact={ce} entropic={cs}");
    }

    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 64,
            .. ProptestConfig::default()
        })]
        #[test]
        fn prop_exact_marginals_and_nonnegativity(
            n in 1usize..9,
            m in 1usize..9,
            seed in any::<u64>(),
        ) {
            let c = random_cost(n, m, seed);
            let gamma = exact_uniform_coupling(&c.view()).unwrap();
            prop_assert_eq!(gamma.shape(), (n, m));
            prop_assert!(gamma.plan().iter().all(|&g| g >= 0.0));
            prop_assert!(gamma.max_marginal_error() <= 1e-5, "err={}", gamma.max_marginal_error());
            prop_assert!((gamma.plan().sum() - 1.0).abs() <= 1e-5);
        }
    }

    // Optimality spot-check: the exact plan is never beaten by the independent coupling
    // a b^T or by any permutation-induced plan.
    proptest! {
        #![proptest_config(ProptestConfig {
            cases: 64,
            .. ProptestConfig::default()
        })]
        #[test]
        fn prop_exact_beats_feasible_baselines(
            n in 1usize..8,
            seed in any::<u64>(),
            shift in 0usize..8,
        ) {
            let c = random_cost(n, n, seed);
            let gamma = exact_uniform_coupling(&c.view()).unwrap();
            let best = gamma.transport_cost(&c.view()).unwrap();

            let independent = Coupling::from_plan(Array2::from_elem((n, n), 1.0 / (n * n) as f32)).unwrap();
            prop_assert!(best <= independent.transport_cost(&c.view()).unwrap() + 1e-5);

            let mut shifted = Array2::<f32>::zeros((n, n));
            for i in 0..n {
                shifted[[i, (i + shift) % n]] = 1.0 / n as f32;
            }
            let shifted = Coupling::from_plan(shifted).unwrap();
            prop_assert!(best <= shifted.transport_cost(&c.view()).unwrap() + 1e-5);
        }
    }
}
