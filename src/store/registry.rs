use super::dataset::Dataset;
use super::types::*;
use crate::error::{EngineError, Result};
use crate::model::ExpectationModel;
use std::collections::HashSet;

/// Arena of datasets and models. Ids are indices into the columnar vectors;
/// every model is validated against its dataset and join targets on insert.
#[derive(Debug, Default)]
pub struct Registry {
    datasets: Vec<Dataset>,
    models: Vec<Box<dyn ExpectationModel>>,

    // Uniqueness check for model names
    used_names: HashSet<String>,
}

impl Registry {
    pub fn new() -> Self { Self::default() }
    pub fn num_datasets(&self) -> usize { self.datasets.len() }
    pub fn num_models(&self) -> usize { self.models.len() }

    pub fn add_dataset(&mut self, dataset: Dataset) -> DatasetId {
        let id = DatasetId::new(self.datasets.len());
        self.datasets.push(dataset);
        id
    }

    /// Registers a model after checking matrix shapes, manifest columns and
    /// join declarations. Parents must be registered before their children.
    pub fn add_model(&mut self, model: impl ExpectationModel + 'static) -> Result<ModelId> {
        self.validate(&model)?;

        // --- Unique Name Enforcement ---
        if !self.used_names.insert(model.name().to_string()) {
            return Err(EngineError::DuplicateModelName { model: model.name().to_string() });
        }

        let id = ModelId::new(self.models.len());
        self.models.push(Box::new(model));
        Ok(id)
    }

    #[inline(always)]
    pub fn dataset(&self, id: DatasetId) -> &Dataset { &self.datasets[id.index()] }

    #[inline(always)]
    pub fn model(&self, id: ModelId) -> &dyn ExpectationModel { self.models[id.index()].as_ref() }

    pub fn data_of(&self, id: ModelId) -> &Dataset { self.dataset(self.model(id).dataset()) }

    pub fn try_model(&self, id: ModelId) -> Result<&dyn ExpectationModel> {
        self.models
            .get(id.index())
            .map(|m| m.as_ref())
            .ok_or(EngineError::UnknownId { what: "model", id: id.index() })
    }

    pub fn model_ids(&self) -> impl Iterator<Item = ModelId> + '_ {
        (0..self.models.len()).map(ModelId::new)
    }

    fn validate(&self, model: &dyn ExpectationModel) -> Result<()> {
        let name = model.name().to_string();
        let data = self
            .datasets
            .get(model.dataset().index())
            .ok_or(EngineError::UnknownId { what: "dataset", id: model.dataset().index() })?;
        let k = model.num_vars();

        // 1. Shapes of the within-unit matrices
        let shape = |m: &nalgebra::DMatrix<bool>| (m.nrows(), m.ncols());
        let checks = [
            ("A", shape(&model.path_pattern())),
            ("S", shape(&model.residual_pattern())),
        ];
        for (matrix, actual) in checks {
            if actual != (k, k) {
                return Err(EngineError::DimensionMismatch { model: name, matrix: matrix.into(), expected: (k, k), actual });
            }
        }
        if let Some(m) = model.mean_pattern() {
            if m.len() != k {
                return Err(EngineError::DimensionMismatch { model: name, matrix: "M".into(), expected: (k, 1), actual: (m.len(), 1) });
            }
        }
        if model.manifest().len() != k || model.var_names().len() != k {
            return Err(EngineError::DimensionMismatch {
                model: name,
                matrix: "F".into(),
                expected: (k, 1),
                actual: (model.manifest().len(), 1),
            });
        }

        // 2. Columns referenced by the manifest filter and definition variables
        let columns = model.data_columns().into_iter().chain(model.def_vars().iter().map(|dv| dv.column));
        for col in columns {
            if col >= data.num_columns() {
                return Err(EngineError::UnknownColumn { dataset: data.name().to_string(), column: format!("#{}", col) });
            }
        }

        // 3. Joins
        for (jx, join) in model.joins().iter().enumerate() {
            let parent = self
                .models
                .get(join.parent.index())
                .ok_or(EngineError::UnknownId { what: "model", id: join.parent.index() })?;
            let parent_data = self.dataset(parent.dataset());

            let expected = (k, parent.num_vars());
            let actual = shape(&model.between_pattern(jx));
            if actual != expected {
                return Err(EngineError::DimensionMismatch {
                    model: name,
                    matrix: format!("between[{}]", jx),
                    expected,
                    actual,
                });
            }
            if !data.is_key_column(join.foreign_key) {
                let column = if join.foreign_key < data.num_columns() {
                    data.column_name(join.foreign_key).to_string()
                } else {
                    format!("#{}", join.foreign_key)
                };
                return Err(EngineError::NonKeyJoinColumn { model: name, dataset: data.name().to_string(), column });
            }
            if !parent_data.has_primary_key() {
                return Err(EngineError::MissingPrimaryKey { model: name, dataset: parent_data.name().to_string() });
            }
        }
        Ok(())
    }
}
