use nalgebra::{DMatrix, DVector};
use relational_ram_core::analysis::partition::mean_cov;
use relational_ram_core::compute::RelationalState;
use relational_ram_core::{
    Cell, CellMatrix, Dataset, EngineError, EngineOptions, EvalContext, ModelId, RamModel, Registry, RelationalExpectation,
    UnitId,
};
use rstest::{fixture, rstest};
use std::f64::consts::PI;
use std::sync::Arc;

const Y: [f64; 6] = [0.3, 1.1, -0.5, 0.9, 0.2, -1.3];
const INCOME: [f64; 2] = [1.2, -0.4];

fn registry(with_ages: bool) -> (Registry, ModelId) {
    let mut reg = Registry::new();
    let family = Dataset::new("family")
        .with_key("id", vec![Some(1), Some(2)]).unwrap()
        .with_numeric("income", INCOME.to_vec()).unwrap()
        .with_primary_key("id").unwrap();
    let fam_ds = reg.add_dataset(family);
    let fam = reg
        .add_model(
            RamModel::new("family", fam_ds, &["income"])
                .variance(0, Cell::Free(0))
                .mean(0, Cell::Free(1))
                .manifest(0, 1),
        )
        .unwrap();

    let mut child = Dataset::new("child")
        .with_key("fam", vec![Some(1), Some(1), Some(1), Some(2), Some(2), Some(2)]).unwrap()
        .with_numeric("y", Y.to_vec()).unwrap();
    let mut vars = vec!["y"];
    if with_ages {
        child = child.with_numeric("age", vec![4.0, 7.0, 5.0, 6.0, 4.0, 8.0]).unwrap();
        vars.push("age_effect");
    }
    let child_ds = reg.add_dataset(child);
    let mut model = RamModel::new("child", child_ds, &vars)
        .variance(0, Cell::Free(2))
        .mean(0, Cell::Free(3))
        .manifest(0, 1)
        .join(0, fam, CellMatrix::zeros(vars.len(), 1).with(0, 0, Cell::Free(4)));
    if with_ages {
        model = model.path(0, 1, Cell::Fixed(0.1)).mean(1, Cell::Data(2));
    }
    let home = reg.add_model(model).unwrap();
    (reg, home)
}

#[fixture]
fn family_child() -> (Registry, ModelId) {
    registry(false)
}

#[fixture]
fn params() -> EvalContext {
    EvalContext::new(vec![1.0, 0.5, 0.8, 0.1, 0.6])
}

fn state((reg, home): (Registry, ModelId), options: EngineOptions) -> RelationalState {
    RelationalState::new(Arc::new(reg), home, options).unwrap()
}

fn no_rampart() -> EngineOptions {
    EngineOptions { rampart_cycle_limit: Some(0), ..Default::default() }
}

/// -2 log L of both families evaluated as plain 4-variate normals.
fn brute_force(ctx: &EvalContext) -> f64 {
    let (var_f, mu_f, var_e, mu_y, b) = (ctx.param(0), ctx.param(1), ctx.param(2), ctx.param(3), ctx.param(4));
    let mut cov = DMatrix::zeros(4, 4);
    cov[(0, 0)] = var_f;
    for i in 1..4 {
        cov[(0, i)] = b * var_f;
        cov[(i, 0)] = b * var_f;
        for j in 1..4 {
            cov[(i, j)] = b * b * var_f + if i == j { var_e } else { 0.0 };
        }
    }
    let mu = DVector::from_vec(vec![mu_f, mu_y + b * mu_f, mu_y + b * mu_f, mu_y + b * mu_f]);
    let chol = cov.cholesky().unwrap();
    let log_det: f64 = 2.0 * chol.l().diagonal().iter().map(|d| d.ln()).sum::<f64>();

    (0..2)
        .map(|f| {
            let x = DVector::from_vec(vec![INCOME[f], Y[3 * f], Y[3 * f + 1], Y[3 * f + 2]]);
            let r = x - &mu;
            4.0 * (2.0 * PI).ln() + log_det + r.dot(&chol.solve(&r))
        })
        .sum()
}

#[rstest]
fn test_rampart_collapses_each_family(family_child: (Registry, ModelId)) {
    let st = state(family_child, EngineOptions::default());
    let plan = st.plan();

    let root3 = 3f64.sqrt();
    let scales: Vec<f64> = plan.layout.units.iter().map(|u| u.rampart_scale).collect();
    assert_eq!(scales, vec![1.0, root3, 0.0, 0.0, 1.0, root3, 0.0, 0.0]);
    assert_eq!(plan.rampart_usage, vec![4]);

    assert_eq!(plan.num_groups(), 2);
    let mut shapes: Vec<(usize, usize, Vec<usize>)> = plan
        .groups
        .iter()
        .map(|g| (g.clump_size, g.num_clumps(), g.sufficient_sets.iter().map(|s| s.length).collect()))
        .collect();
    shapes.sort();
    assert_eq!(shapes, vec![(1, 4, vec![4]), (2, 2, vec![2])]);
}

#[rstest]
fn test_two_components_before_rotation(family_child: (Registry, ModelId)) {
    let st = state(family_child, no_rampart());
    let plan = st.plan();
    assert_eq!(plan.component_count, 2);
    assert_eq!(plan.num_groups(), 1);
    assert_eq!((plan.group(0).clump_size, plan.group(0).num_clumps()), (4, 2));
}

#[rstest]
fn test_child_variance_by_hand(family_child: (Registry, ModelId), params: EvalContext) {
    let mut st = state(family_child, no_rampart());
    st.compute_cov(&params).unwrap();
    // 0.6^2 * 1 + 0.8
    let cov = &st.group(0).cov;
    assert!((cov[(1, 1)] - 1.16).abs() < 1e-12);
    assert!((cov[(2, 3)] - 0.36).abs() < 1e-12);
}

#[rstest]
#[case(EngineOptions::default())]
#[case(EngineOptions { optimize_mean: 1, ..Default::default() })]
#[case(EngineOptions { optimize_mean: 2, ..Default::default() })]
#[case(EngineOptions { use_sufficient_sets: false, ..Default::default() })]
#[case(EngineOptions { force_single_group: true, ..Default::default() })]
#[case(EngineOptions { inverse_optimization: false, ..Default::default() })]
#[case(no_rampart())]
fn test_fit_matches_brute_force(#[case] options: EngineOptions, params: EvalContext) {
    let mut ctx = params;
    let mut st = state(registry(false), options);
    let fit = st.fit(&mut ctx).unwrap();
    let expected = brute_force(&ctx);
    assert!((fit - expected).abs() < 1e-9, "{} vs {}", fit, expected);
}

#[rstest]
fn test_heterogeneous_means_fit_is_rotation_invariant(params: EvalContext) {
    let mut rotated_ctx = params.clone();
    let mut plain_ctx = params;
    let rotated = state(registry(true), EngineOptions::default()).fit(&mut rotated_ctx).unwrap();
    let plain = state(registry(true), no_rampart()).fit(&mut plain_ctx).unwrap();
    assert!(rotated.is_finite());
    assert!((rotated - plain).abs() < 1e-9, "{} vs {}", rotated, plain);
}

#[rstest]
fn test_sufficient_set_summary_matches_clumps(family_child: (Registry, ModelId)) {
    let st = state(family_child, EngineOptions::default());
    for gp in &st.plan().groups {
        for ss in &gp.sufficient_sets {
            let p = gp.clump_obs;
            let start = gp.placements[ss.start * gp.clump_size].obs_start;
            let clumps = &gp.data_vec.as_slice()[start..start + ss.length * p];
            let (mean, cov) = mean_cov(clumps, p);
            assert!((mean - &ss.data_mean).abs().max() < 1e-12);
            assert!((cov - &ss.data_cov).abs().max() < 1e-12);
        }
    }
}

#[rstest]
fn test_groups_are_disjoint_and_closed(family_child: (Registry, ModelId)) {
    let st = state(family_child, EngineOptions::default());
    let plan = st.plan();

    let mut seen = vec![0; plan.layout.len()];
    for gp in &plan.groups {
        for &u in &gp.units {
            seen[u.index()] += 1;
        }
    }
    assert!(seen.iter().all(|&n| n == 1));

    // a carried join never crosses a group boundary
    for id in plan.layout.ids() {
        let unit = plan.layout.unit(id);
        if unit.rampart_scale == 0.0 { continue; }
        if let Some(parent) = plan.layout.setup(id).parent1 {
            let group = |u: UnitId| plan.layout.unit(u).membership.map(|m| m.group);
            assert_eq!(group(id), group(parent));
        }
    }
}

#[test]
fn test_self_referencing_rows_are_rejected() {
    let mut reg = Registry::new();
    let people = Dataset::new("people")
        .with_key("id", vec![Some(1), Some(2)]).unwrap()
        .with_key("boss", vec![Some(2), Some(1)]).unwrap()
        .with_numeric("x", vec![0.0, 1.0]).unwrap()
        .with_primary_key("id").unwrap();
    let ds = reg.add_dataset(people);
    let base = reg.add_model(RamModel::new("base", ds, &["x"]).with_means()).unwrap();
    let boss = reg
        .add_model(RamModel::new("boss", ds, &["x"]).with_means().join(1, base, CellMatrix::from_fixed(1, 1, &[0.5])))
        .unwrap();
    let home = reg
        .add_model(RamModel::new("staff", ds, &["x"]).with_means().join(1, boss, CellMatrix::from_fixed(1, 1, &[0.5])))
        .unwrap();

    let err = RelationalState::new(Arc::new(reg), home, EngineOptions::default()).unwrap_err();
    assert!(matches!(err, EngineError::CycleDetected { .. }));
}

#[rstest]
fn test_indefinite_residuals_fail_only_simulation(family_child: (Registry, ModelId), params: EvalContext) {
    let mut ctx = params;
    ctx.set_param(2, -1.0);
    let mut ex = RelationalExpectation::new(Arc::new(family_child.0), family_child.1, EngineOptions::default());

    ex.compute(&mut ctx, relational_ram_core::Component::Covariance).unwrap();
    let err = ex.generate_data(&ctx).unwrap_err();
    assert!(err.is_numerical());
    assert!(matches!(err, EngineError::NonPositiveDefinite { .. }));
}

#[rstest]
fn test_simulated_data_has_implied_moments(params: EvalContext) {
    // many independent families: sample moments approach the implied ones
    let families = 400;
    let mut reg = Registry::new();
    let ids: Vec<Option<i64>> = (0..families).map(|i| Some(i as i64)).collect();
    let fam_ds = reg.add_dataset(
        Dataset::new("family")
            .with_key("id", ids.clone()).unwrap()
            .with_numeric("income", vec![0.0; families]).unwrap()
            .with_primary_key("id").unwrap(),
    );
    let fam = reg
        .add_model(RamModel::new("family", fam_ds, &["income"]).variance(0, Cell::Free(0)).mean(0, Cell::Free(1)).manifest(0, 1))
        .unwrap();
    let keys: Vec<Option<i64>> = ids.iter().flat_map(|&k| [k, k, k]).collect();
    let child_ds = reg.add_dataset(
        Dataset::new("child")
            .with_key("fam", keys).unwrap()
            .with_numeric("y", vec![0.0; 3 * families]).unwrap(),
    );
    let home = reg
        .add_model(
            RamModel::new("child", child_ds, &["y"])
                .variance(0, Cell::Free(2))
                .mean(0, Cell::Free(3))
                .manifest(0, 1)
                .join(0, fam, CellMatrix::zeros(1, 1).with(0, 0, Cell::Free(4))),
        )
        .unwrap();

    let mut ex = RelationalExpectation::new(Arc::new(reg), home, EngineOptions { simulation_seed: 11, ..Default::default() });
    let sim = ex.generate_data(&params).unwrap();
    let y = sim.table("child").unwrap().column("y").unwrap();
    let n = y.len() as f64;
    let mean = y.iter().sum::<f64>() / n;
    let var = y.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    assert!((mean - 0.4).abs() < 0.15, "mean {}", mean);
    assert!((var - 1.16).abs() < 0.25, "var {}", var);
}

#[rstest]
fn test_export_round_trips_through_json(family_child: (Registry, ModelId), params: EvalContext) {
    let mut ctx = params;
    let options = EngineOptions { max_debug_groups: 2, ..Default::default() };
    let mut ex = RelationalExpectation::new(Arc::new(family_child.0), family_child.1, options);
    ex.fit(&mut ctx).unwrap();
    let export = ex.export().unwrap();

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("layout.json");
    export.write_json(&path).unwrap();

    let value: serde_json::Value = serde_json::from_str(&std::fs::read_to_string(&path).unwrap()).unwrap();
    assert_eq!(value["num_groups"], 2);
    assert_eq!(value["units"].as_array().unwrap().len(), 8);
    assert_eq!(value["groups"].as_array().unwrap().len(), 2);
    assert_eq!(value["rampart_usage"][0], 4);
}

#[test]
fn test_options_load_from_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("options.json");
    std::fs::write(&path, r#"{ "rampart_cycle_limit": 0, "max_debug_groups": 3 }"#).unwrap();

    let options = EngineOptions::from_path(&path).unwrap();
    assert_eq!(options.rampart_cycle_limit, Some(0));
    assert_eq!(options.max_debug_groups, 3);
    assert!(options.analyze_def_vars);

    let (reg, home) = registry(false);
    let st = RelationalState::new(Arc::new(reg), home, options).unwrap();
    assert!(st.plan().data_plan.is_empty());
}

#[rstest]
fn test_fresh_contexts_do_not_reuse_a_stale_covariance(family_child: (Registry, ModelId), params: EvalContext) {
    let mut st = state(family_child, EngineOptions::default());
    let mut first = params;
    st.fit(&mut first).unwrap();

    let mut second = EvalContext::new(vec![3.0, 0.5, 2.0, 0.1, 0.2]);
    let reused = st.fit(&mut second).unwrap();

    let mut fresh_ctx = EvalContext::new(vec![3.0, 0.5, 2.0, 0.1, 0.2]);
    let fresh = state(registry(false), EngineOptions::default()).fit(&mut fresh_ctx).unwrap();
    assert!((reused - fresh).abs() < 1e-9, "{} vs {}", reused, fresh);
    assert!((reused - brute_force(&second)).abs() < 1e-9);
}

/// Children joined to a mother (first join) and a father (second join). Rows
/// 0..2 only know their mother, row 3 only its father, row 4 both.
fn two_parents() -> (Registry, ModelId) {
    let mut reg = Registry::new();
    let parent = |reg: &mut Registry, name: &str, ids: Vec<Option<i64>>, height: Vec<f64>| {
        let ds = reg.add_dataset(
            Dataset::new(name)
                .with_key("id", ids).unwrap()
                .with_numeric("height", height).unwrap()
                .with_primary_key("id").unwrap(),
        );
        reg.add_model(RamModel::new(name, ds, &["height"]).variance(0, Cell::Free(0)).mean(0, Cell::Free(1)).manifest(0, 1))
            .unwrap()
    };
    let mother = parent(&mut reg, "mother", vec![Some(1), Some(2)], vec![0.4, -0.2]);
    let father = parent(&mut reg, "father", vec![Some(1)], vec![0.7]);

    let child_ds = reg.add_dataset(
        Dataset::new("child")
            .with_key("mom", vec![Some(1), Some(1), Some(1), None, Some(2)]).unwrap()
            .with_key("dad", vec![None, None, None, Some(1), Some(1)]).unwrap()
            .with_numeric("y", vec![0.3, 1.1, -0.5, 0.9, 0.2]).unwrap(),
    );
    let home = reg
        .add_model(
            RamModel::new("child", child_ds, &["y"])
                .variance(0, Cell::Free(2))
                .mean(0, Cell::Free(3))
                .manifest(0, 2)
                .join(0, mother, CellMatrix::zeros(1, 1).with(0, 0, Cell::Free(4)))
                .join(1, father, CellMatrix::zeros(1, 1).with(0, 0, Cell::Free(4))),
        )
        .unwrap();
    (reg, home)
}

#[rstest]
fn test_second_join_never_makes_a_rampart_sibling(params: EvalContext) {
    let st = state(two_parents(), EngineOptions::default());
    let layout = &st.plan().layout;
    let child = |row: usize| {
        layout.ids().find(|&id| layout.setup(id).parents.len() == 2 && layout.unit(id).row == row).unwrap()
    };

    // only the mother-linked rows rotate
    assert_eq!(st.plan().rampart_usage, vec![2]);
    let mut scales: Vec<f64> = (0..3).map(|r| layout.unit(child(r)).rampart_scale).collect();
    scales.sort_by(f64::total_cmp);
    assert_eq!(scales, vec![0.0, 0.0, 3f64.sqrt()]);
    assert_eq!(layout.setup(child(3)).parent1, None);
    assert_eq!(layout.unit(child(3)).rampart_scale, 1.0);

    let mut rotated_ctx = params.clone();
    let mut plain_ctx = params;
    let rotated = state(two_parents(), EngineOptions::default()).fit(&mut rotated_ctx).unwrap();
    let plain = state(two_parents(), no_rampart()).fit(&mut plain_ctx).unwrap();
    assert!(rotated.is_finite());
    assert!((rotated - plain).abs() < 1e-9, "{} vs {}", rotated, plain);
}

/// Schools, families and children with unequal cluster sizes, a missing
/// family income and a missing child outcome.
fn school_family_child() -> (Registry, ModelId) {
    let mut reg = Registry::new();
    let school_ds = reg.add_dataset(
        Dataset::new("school")
            .with_key("id", vec![Some(1), Some(2)]).unwrap()
            .with_numeric("quality", vec![0.5, -0.3]).unwrap()
            .with_primary_key("id").unwrap(),
    );
    let school = reg
        .add_model(RamModel::new("school", school_ds, &["quality"]).variance(0, Cell::Free(0)).mean(0, Cell::Free(1)).manifest(0, 1))
        .unwrap();

    let family_ds = reg.add_dataset(
        Dataset::new("family")
            .with_key("id", vec![Some(1), Some(2), Some(3), Some(4)]).unwrap()
            .with_key("school", vec![Some(1), Some(1), Some(1), Some(2)]).unwrap()
            .with_numeric("income", vec![1.2, -0.4, f64::NAN, 0.8]).unwrap()
            .with_primary_key("id").unwrap(),
    );
    let family = reg
        .add_model(
            RamModel::new("family", family_ds, &["income"])
                .variance(0, Cell::Free(2))
                .mean(0, Cell::Free(3))
                .manifest(0, 2)
                .join(1, school, CellMatrix::zeros(1, 1).with(0, 0, Cell::Free(4))),
        )
        .unwrap();

    let child_ds = reg.add_dataset(
        Dataset::new("child")
            .with_key("fam", vec![Some(1), Some(1), Some(2), Some(2), Some(3), Some(3), Some(3), Some(4)]).unwrap()
            .with_numeric("y", vec![0.3, 1.1, -0.5, 0.9, 0.2, f64::NAN, -1.3, 0.6]).unwrap(),
    );
    let home = reg
        .add_model(
            RamModel::new("child", child_ds, &["y"])
                .variance(0, Cell::Free(5))
                .mean(0, Cell::Free(6))
                .manifest(0, 1)
                .join(0, family, CellMatrix::zeros(1, 1).with(0, 0, Cell::Free(7))),
        )
        .unwrap();
    (reg, home)
}

#[rstest]
#[case(EngineOptions::default())]
#[case(EngineOptions { use_sufficient_sets: false, ..Default::default() })]
fn test_three_level_fit_is_rotation_invariant(#[case] options: EngineOptions) {
    let params = vec![1.0, 0.2, 0.7, 0.1, 0.5, 0.8, -0.1, 0.6];

    let mut rotated_state = state(school_family_child(), options);
    // children collapse first, then the matching families of school 1
    assert_eq!(rotated_state.plan().rampart_usage, vec![3, 1]);

    let rotated = rotated_state.fit(&mut EvalContext::new(params.clone())).unwrap();
    let plain = state(school_family_child(), no_rampart()).fit(&mut EvalContext::new(params)).unwrap();
    assert!(rotated.is_finite());
    assert!((rotated - plain).abs() < 1e-9, "{} vs {}", rotated, plain);
}

#[rstest]
fn test_nonzero_path_diagonal_aborts_evaluation(params: EvalContext) {
    let mut reg = Registry::new();
    let fam_ds = reg.add_dataset(
        Dataset::new("family")
            .with_key("id", vec![Some(1), Some(2)]).unwrap()
            .with_numeric("income", INCOME.to_vec()).unwrap()
            .with_primary_key("id").unwrap(),
    );
    let fam = reg
        .add_model(RamModel::new("family", fam_ds, &["income"]).variance(0, Cell::Free(0)).mean(0, Cell::Free(1)).manifest(0, 1))
        .unwrap();
    let child_ds = reg.add_dataset(
        Dataset::new("child")
            .with_key("fam", vec![Some(1), Some(1), Some(1), Some(2), Some(2), Some(2)]).unwrap()
            .with_numeric("y", Y.to_vec()).unwrap(),
    );
    let home = reg
        .add_model(
            RamModel::new("child", child_ds, &["y"])
                .path(0, 0, Cell::Fixed(0.2))
                .variance(0, Cell::Free(2))
                .mean(0, Cell::Free(3))
                .manifest(0, 1)
                .join(0, fam, CellMatrix::zeros(1, 1).with(0, 0, Cell::Free(4))),
        )
        .unwrap();

    let mut st = state((reg, home), EngineOptions::default());
    let err = st.compute_cov(&params).unwrap_err();
    assert!(matches!(err, EngineError::NonzeroDiagonal { ref model, .. } if model == "child"));
    assert!(!err.is_numerical());

    let mut ctx = params;
    assert!(matches!(st.fit(&mut ctx), Err(EngineError::NonzeroDiagonal { .. })));
    assert!(ctx.fit().is_none());
}
