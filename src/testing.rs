//! Shared registries for unit tests.
use crate::model::{Cell, CellMatrix, EvalContext, RamModel};
use crate::store::{Dataset, ModelId, Registry};

fn child_rows() -> Vec<Option<i64>> {
    vec![Some(1), Some(1), Some(1), Some(2), Some(2), Some(2)]
}

fn family(reg: &mut Registry) -> ModelId {
    let data = Dataset::new("family")
        .with_key("id", vec![Some(1), Some(2)]).unwrap()
        .with_numeric("income", vec![1.2, -0.4]).unwrap()
        .with_primary_key("id").unwrap();
    let ds = reg.add_dataset(data);
    reg.add_model(
        RamModel::new("family", ds, &["income"])
            .variance(0, Cell::Free(0))
            .mean(0, Cell::Free(1))
            .manifest(0, 1),
    )
    .unwrap()
}

/// Two families of three children each. The child outcome regresses on the
/// family income through the between matrix.
pub fn family_child() -> (Registry, ModelId) {
    let mut reg = Registry::new();
    let fam = family(&mut reg);
    let data = Dataset::new("child")
        .with_key("fam", child_rows()).unwrap()
        .with_numeric("y", vec![0.3, 1.1, -0.5, 0.9, 0.2, -1.3]).unwrap();
    let ds = reg.add_dataset(data);
    let home = reg
        .add_model(
            RamModel::new("child", ds, &["y"])
                .variance(0, Cell::Free(2))
                .mean(0, Cell::Free(3))
                .manifest(0, 1)
                .join(0, fam, CellMatrix::zeros(1, 1).with(0, 0, Cell::Free(4))),
        )
        .unwrap();
    (reg, home)
}

/// As `family_child`, with a child age entering only the child mean through
/// a latent, variance-free covariate.
pub fn family_child_with_ages() -> (Registry, ModelId) {
    let mut reg = Registry::new();
    let fam = family(&mut reg);
    let data = Dataset::new("child")
        .with_key("fam", child_rows()).unwrap()
        .with_numeric("y", vec![0.3, 1.1, -0.5, 0.9, 0.2, -1.3]).unwrap()
        .with_numeric("age", vec![4.0, 7.0, 5.0, 6.0, 4.0, 8.0]).unwrap();
    let ds = reg.add_dataset(data);
    let home = reg
        .add_model(
            RamModel::new("child", ds, &["y", "age_effect"])
                .path(0, 1, Cell::Fixed(0.1))
                .variance(0, Cell::Free(2))
                .mean(0, Cell::Free(3))
                .mean(1, Cell::Data(2))
                .manifest(0, 1)
                .join(0, fam, CellMatrix::zeros(2, 1).with(0, 0, Cell::Free(4))),
        )
        .unwrap();
    (reg, home)
}

/// var(income) = 1, mean(income) = 0.5, var(y residual) = 0.8,
/// mean(y) = 0.1, income -> y = 0.6.
pub fn family_params() -> EvalContext {
    EvalContext::new(vec![1.0, 0.5, 0.8, 0.1, 0.6])
}
