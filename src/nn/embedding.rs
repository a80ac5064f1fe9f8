//! Embedding lookup tables and the generator that embeds the categorical
//! columns of a tabular row.
//!
//! `Embedding` maps integer-coded indices (stored as f32) to dense vectors
//! of fixed width. `EmbeddingGenerator` replaces every categorical column
//! of a `[batch, columns]` input by its embedding and passes numeric
//! columns through, preserving column order:
//!
//! ```ignore
//! use rustytab::nn::{CategoricalColumn, EmbeddingGenerator, Model, Module};
//!
//! let model = Model::with_seed(0);
//! let columns = vec![CategoricalColumn { index: 1, vocab_size: 4, embedding_dim: 2 }];
//! let generator = EmbeddingGenerator::new(&model, 3, columns)?;
//! assert_eq!(generator.output_dim(), 4);
//! ```

use super::model::{Initializer, Model};
use super::module::{check_arity, check_width, Forward, Module, NnError, NnResult};
use crate::tensor::Tensor;

/// Lookup table of shape `[num_embeddings, embedding_dim]`.
#[derive(Debug, Clone)]
pub struct Embedding {
    pub name: String,
    pub num_embeddings: usize,
    pub embedding_dim: usize,
    pub weight: Tensor,
}

impl Embedding {
    pub fn new(model: &Model, num_embeddings: usize, embedding_dim: usize, init: Option<Initializer>) -> NnResult<Self> {
        if num_embeddings == 0 || embedding_dim == 0 {
            return Err(NnError::Config(format!(
                "embedding needs a non-empty table, got {}x{}",
                num_embeddings, embedding_dim
            )));
        }
        let name = model.layer_name("embedding");
        let init = init.unwrap_or_else(|| model.weight_init());
        let weight = model.parameter(&format!("{}.weight", name), &[num_embeddings, embedding_dim], init)?;
        Ok(Self { name, num_embeddings, embedding_dim, weight })
    }

    pub fn weight_name(&self) -> String {
        format!("{}.weight", self.name)
    }
}

impl Module for Embedding {
    /// Indices of any shape `[*]` to vectors `[*, embedding_dim]`.
    fn forward(&self, inputs: &[Tensor]) -> NnResult<Forward> {
        check_arity(&self.name, inputs, 1)?;
        Ok(Forward::new(inputs[0].embedding(&self.weight)))
    }

    fn parameters(&self) -> Vec<Tensor> {
        vec![self.weight.clone()]
    }
}

/// A categorical column: its position in the raw row, the number of
/// distinct codes and the width of its embedding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct CategoricalColumn {
    pub index: usize,
    pub vocab_size: usize,
    pub embedding_dim: usize,
}

#[derive(Debug, Clone)]
pub struct EmbeddingGenerator {
    pub name: String,
    pub input_dim: usize,
    /// One table per categorical column, ordered by column index.
    pub columns: Vec<(CategoricalColumn, Embedding)>,
}

impl EmbeddingGenerator {
    pub fn new(model: &Model, input_dim: usize, mut categorical: Vec<CategoricalColumn>) -> NnResult<Self> {
        if input_dim == 0 {
            return Err(NnError::Config("embedding generator needs at least one column".to_string()));
        }
        categorical.sort_by_key(|c| c.index);
        if let Some(pair) = categorical.windows(2).find(|w| w[0].index == w[1].index) {
            return Err(NnError::Config(format!("column {} is declared categorical twice", pair[0].index)));
        }
        if let Some(c) = categorical.iter().find(|c| c.index >= input_dim) {
            return Err(NnError::Config(format!("categorical column {} is outside {} columns", c.index, input_dim)));
        }

        let name = model.layer_name("embedding_generator");
        let columns = categorical
            .into_iter()
            .map(|c| Ok((c, Embedding::new(model, c.vocab_size, c.embedding_dim, None)?)))
            .collect::<NnResult<Vec<_>>>()?;
        Ok(Self { name, input_dim, columns })
    }

    /// `#numeric + sum(embedding_dim)`.
    pub fn output_dim(&self) -> usize {
        let embedded: usize = self.columns.iter().map(|(c, _)| c.embedding_dim).sum();
        self.input_dim - self.columns.len() + embedded
    }

    pub fn is_identity(&self) -> bool {
        self.columns.is_empty()
    }
}

impl Module for EmbeddingGenerator {
    fn forward(&self, inputs: &[Tensor]) -> NnResult<Forward> {
        check_arity(&self.name, inputs, 1)?;
        let x = &inputs[0];
        check_width(&self.name, x, self.input_dim)?;
        if self.is_identity() {
            return Ok(Forward::new(x.clone()));
        }

        // Runs of numeric columns are sliced out in one piece.
        let mut parts = Vec::with_capacity(2 * self.columns.len() + 1);
        let mut start = 0;
        for (column, table) in &self.columns {
            if column.index > start {
                parts.push(x.slice(1, start, column.index));
            }
            let codes = x.slice(1, column.index, column.index + 1);
            let embedded = table.forward(&[codes])?.output;
            parts.push(embedded.reshape(vec![-1, column.embedding_dim as i64]));
            start = column.index + 1;
        }
        if start < self.input_dim {
            parts.push(x.slice(1, start, self.input_dim));
        }

        let output = Tensor::concat(&parts, 1)
            .ok_or_else(|| NnError::Config(format!("{}: nothing to concatenate", self.name)))?;
        Ok(Forward::new(output))
    }

    fn parameters(&self) -> Vec<Tensor> {
        self.columns.iter().map(|(_, e)| e.weight.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::asg::Value;
    use crate::runtime::backend::RuntimeError;
    use ndarray::{arr2, Array2, ArrayD, IxDyn};
    use std::collections::HashMap;

    #[test]
    fn lookup_returns_table_rows() {
        let model = Model::with_seed(0);
        let embedding = Embedding::new(&model, 5, 3, None).unwrap();
        let table = Array2::from_shape_fn((5, 3), |(i, j)| (i * 3 + j) as f32).into_dyn();
        assert!(model.set_value(&embedding.weight_name(), table));

        let indices = Tensor::new_input_with_shape(model.context(), "indices", &[2]);
        let out = embedding.forward(&[indices]).unwrap().output;
        assert_eq!(out.shape().unwrap(), vec![2, 3]);

        let feeds = HashMap::from([(
            "indices".to_string(),
            Value::Tensor(ArrayD::from_shape_vec(IxDyn(&[2]), vec![0.0, 2.0]).unwrap()),
        )]);
        let values = model.run(&[&out], &feeds).unwrap().remove(0);
        assert_eq!(values, arr2(&[[0.0, 1.0, 2.0], [6.0, 7.0, 8.0]]).into_dyn());
    }

    #[test]
    fn generator_embeds_categorical_columns_in_place() {
        let model = Model::with_seed(0);
        let columns = vec![
            CategoricalColumn { index: 4, vocab_size: 4, embedding_dim: 2 },
            CategoricalColumn { index: 1, vocab_size: 4, embedding_dim: 2 },
        ];
        let generator = EmbeddingGenerator::new(&model, 5, columns).unwrap();
        assert_eq!(generator.output_dim(), 7);
        for (_, table) in &generator.columns {
            let rows = Array2::from_shape_fn((4, 2), |(r, c)| (2 * r + c) as f32).into_dyn();
            assert!(model.set_value(&table.weight_name(), rows));
        }

        let x = Tensor::new_input_with_shape(model.context(), "x", &[1, 5]);
        let out = generator.forward(&[x]).unwrap().output;
        assert_eq!(out.shape().unwrap(), vec![1, 7]);

        let feeds = HashMap::from([("x".to_string(), Value::Tensor(arr2(&[[0.0, 1.0, 2.0, 1.0, 3.0]]).into_dyn()))]);
        let values = model.run(&[&out], &feeds).unwrap().remove(0);
        assert_eq!(values, arr2(&[[0.0, 2.0, 3.0, 2.0, 1.0, 6.0, 7.0]]).into_dyn());
    }

    #[test]
    fn generator_without_categoricals_is_identity() {
        let model = Model::with_seed(0);
        let generator = EmbeddingGenerator::new(&model, 3, Vec::new()).unwrap();
        let x = Tensor::new_input_with_shape(model.context(), "x", &[2, 3]);
        let out = generator.forward(&[x.clone()]).unwrap().output;
        assert_eq!(out.node_id, x.node_id);
        assert!(generator.parameters().is_empty());
    }

    #[test]
    fn out_of_range_codes_fail_the_lookup() {
        let model = Model::with_seed(0);
        let columns = vec![CategoricalColumn { index: 0, vocab_size: 3, embedding_dim: 2 }];
        let generator = EmbeddingGenerator::new(&model, 2, columns).unwrap();
        let x = Tensor::new_input_with_shape(model.context(), "x", &[1, 2]);
        let out = generator.forward(&[x]).unwrap().output;
        let feeds = HashMap::from([("x".to_string(), Value::Tensor(arr2(&[[3.0, 0.5]]).into_dyn()))]);
        assert!(matches!(model.run(&[&out], &feeds), Err(RuntimeError::IndexOutOfRange { .. })));
    }

    #[test]
    fn invalid_columns_are_rejected() {
        let model = Model::with_seed(0);
        let dup = vec![
            CategoricalColumn { index: 1, vocab_size: 2, embedding_dim: 1 },
            CategoricalColumn { index: 1, vocab_size: 3, embedding_dim: 1 },
        ];
        assert!(matches!(EmbeddingGenerator::new(&model, 3, dup), Err(NnError::Config(_))));
        let outside = vec![CategoricalColumn { index: 3, vocab_size: 2, embedding_dim: 1 }];
        assert!(matches!(EmbeddingGenerator::new(&model, 3, outside), Err(NnError::Config(_))));
    }
}
