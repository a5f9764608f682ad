//! Hand-computable DeepJDOT batches: cost, coupling and both losses end to end, without a model.

use burn_core::tensor::{Tensor, TensorData};
use burn_ndarray::NdArray;
use ndarray::{array, Array2};

use pointda::config::JdotWeights;
use pointda::convert::{array2_to_tensor, scalar};
use pointda::cost::{CostMatrixBuilder, LabelCost};
use pointda::loss::{alignment_loss, categorical_transport_loss};
use pointda::transport::{TransportMethod, TransportSolver};

type B = NdArray<f32>;

fn t2(a: &Array2<f32>) -> Tensor<B, 2> {
    array2_to_tensor::<B>(&Default::default(), &a.view())
}

#[test]
fn two_by_two_batch_matches_hand_computation() {
    // Source embeddings and labels.
    let xs = array![[0.0f32, 0.0], [1.0, 0.0]];
    let ys = [0usize, 1];
    // Target embeddings sit "crossed" relative to the source.
    let xt = array![[1.0f32, 0.0], [0.0, 0.5]];
    // Target predictions: t0 looks like class 1, t1 like class 0.
    let pt = array![[0.0f32, 1.0], [1.0, 0.0]];
    let source_logits = array![[1.0f32, 0.0], [0.0, 1.0]];

    // C0 = [[1, 0.25], [0, 1.25]], C1 = [[2, 0], [0, 2]].
    let builder = CostMatrixBuilder::new(1.0, 1.0, LabelCost::SquaredEuclidean, 2);
    let cost = builder.build(&xs.view(), &xt.view(), &ys, &pt.view()).unwrap();
    let want_c = array![[3.0f32, 0.25], [0.0, 3.25]];
    for (c, w) in cost.total.iter().zip(want_c.iter()) {
        assert!((c - w).abs() < 1e-4, "cost {c} vs {w}");
    }

    let gamma = TransportSolver::new(TransportMethod::Exact)
        .solve(&cost.total.view())
        .unwrap();
    let want_g = array![[0.0f32, 0.5], [0.5, 0.0]];
    for (g, w) in gamma.plan().iter().zip(want_g.iter()) {
        assert!((g - w).abs() < 1e-6);
    }
    assert!((gamma.transport_cost(&cost.total.view()).unwrap() - 0.125).abs() < 1e-4);

    let weights = JdotWeights {
        alpha: 1.0,
        source_weight: 1.0,
        target_weight: 1.0,
        train_cl_weight: 1.0,
        train_align_weight: 1.0,
    };
    let g = t2(gamma.plan());

    // 0.5 * (0.25 + 0)
    let align = alignment_loss(t2(&xs), t2(&xt), g.clone(), weights.alpha, weights.train_align_weight)
        .unwrap();
    assert!((scalar(align).unwrap() - 0.125).abs() < 1e-4);

    // Each coupled pair and each source sample costs ln(1 + e^-1).
    let l = (1.0f32 + (-1.0f32).exp()).ln();
    let cat = categorical_transport_loss(t2(&source_logits), t2(&pt), &ys, g, &weights).unwrap();
    assert!((scalar(cat).unwrap() - 2.0 * l).abs() < 1e-4);
}

#[test]
fn rectangular_batches_split_mass() {
    // Three sources, two targets: the third source splits its 1/3 evenly.
    let c = array![[0.0f32, 9.0], [9.0, 0.0], [1.0, 1.0]];
    let gamma = TransportSolver::default().solve(&c.view()).unwrap();
    assert!(gamma.max_marginal_error() < 1e-6);
    assert!((gamma.transport_cost(&c.view()).unwrap() - 1.0 / 3.0).abs() < 1e-5);
    assert!((gamma.plan()[[2, 0]] - 1.0 / 6.0).abs() < 1e-6);
}

#[test]
fn entropic_solver_approaches_the_exact_plan() {
    let c = array![[0.0f32, 4.0], [4.0, 0.0]];
    let exact = TransportSolver::default().solve(&c.view()).unwrap();
    let soft = TransportSolver::new(TransportMethod::Entropic {
        reg: 0.1,
        max_iter: 5_000,
        tol: 1e-6,
    })
    .solve(&c.view())
    .unwrap();
    for (a, b) in exact.plan().iter().zip(soft.plan().iter()) {
        assert!((a - b).abs() < 1e-3);
    }
}

#[test]
fn coupling_enters_the_loss_as_a_constant() {
    // Gradients must reach the embeddings but the coupling tensor is plain data.
    type AD = burn_autodiff::Autodiff<NdArray<f32>>;
    let device = Default::default();
    let xs = Tensor::<AD, 2>::from_data(TensorData::new(vec![0.0f32, 0.0], [1, 2]), &device)
        .require_grad();
    let xt = Tensor::<AD, 2>::from_data(TensorData::new(vec![1.0f32, 2.0], [1, 2]), &device);
    let gamma = Tensor::<AD, 2>::from_data(TensorData::new(vec![1.0f32], [1, 1]), &device);
    let loss = alignment_loss(xs.clone(), xt, gamma.clone(), 1.0, 1.0).unwrap();
    let grads = loss.backward();
    let gx = xs.grad(&grads).unwrap();
    // d/dxs ||xs - xt||^2 = 2 (xs - xt)
    let v = gx.into_data().to_vec::<f32>().unwrap();
    assert!((v[0] + 2.0).abs() < 1e-5 && (v[1] + 4.0).abs() < 1e-5);
    assert!(gamma.grad(&grads).is_none());
}
