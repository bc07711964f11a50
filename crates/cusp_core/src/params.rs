//! Named parameter sets.

use crate::error::Result;
use crate::traits::Model;
use crate::{bail_input, ensure_input};
use serde::{Deserialize, Serialize};

/// Ordered mapping from parameter name to value.
///
/// Analysis entry points align a parameter set to the order reported by
/// [`Model::parameter_names`] before any numerics run.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Parameters {
    names: Vec<String>,
    values: Vec<f64>,
}

impl Parameters {
    pub fn new<I, S>(pairs: I) -> Result<Self>
    where
        I: IntoIterator<Item = (S, f64)>,
        S: Into<String>,
    {
        let mut names = Vec::new();
        let mut values = Vec::new();
        for (name, value) in pairs {
            let name = name.into();
            ensure_input!(
                value.is_finite(),
                "parameter '{}' must be finite, got {}",
                name,
                value
            );
            ensure_input!(
                !names.contains(&name),
                "parameter '{}' is defined twice",
                name
            );
            names.push(name);
            values.push(value);
        }
        Ok(Self { names, values })
    }

    /// Builds a set from positional values in the model's parameter order.
    pub fn from_model<M: Model + ?Sized>(model: &M, values: &[f64]) -> Result<Self> {
        let names = model.parameter_names();
        ensure_input!(
            names.len() == values.len(),
            "model expects {} parameters, got {}",
            names.len(),
            values.len()
        );
        Self::new(names.into_iter().zip(values.iter().copied()))
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.names.iter().position(|n| n == name)
    }

    pub fn get(&self, name: &str) -> Option<f64> {
        self.index_of(name).map(|idx| self.values[idx])
    }

    pub fn set(&mut self, name: &str, value: f64) -> Result<()> {
        ensure_input!(
            value.is_finite(),
            "parameter '{}' must be finite, got {}",
            name,
            value
        );
        match self.index_of(name) {
            Some(idx) => {
                self.values[idx] = value;
                Ok(())
            }
            None => bail_input!("unknown parameter '{}'", name),
        }
    }

    /// Copy of this set with the value at `index` replaced.
    pub fn with_value(&self, index: usize, value: f64) -> Self {
        let mut copy = self.clone();
        copy.values[index] = value;
        copy
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> + '_ {
        self.names
            .iter()
            .map(String::as_str)
            .zip(self.values.iter().copied())
    }

    /// Reorders this set to match the model's parameter order.
    ///
    /// Fails when a model parameter is missing or the set names a parameter
    /// the model does not have.
    pub fn aligned_to<M: Model + ?Sized>(&self, model: &M) -> Result<Self> {
        let expected = model.parameter_names();
        for name in &self.names {
            ensure_input!(
                expected.contains(name),
                "model has no parameter named '{}'",
                name
            );
        }
        let mut values = Vec::with_capacity(expected.len());
        for name in &expected {
            match self.get(name) {
                Some(value) => values.push(value),
                None => bail_input!("missing value for parameter '{}'", name),
            }
        }
        Ok(Self {
            names: expected,
            values,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::traits::FnModel;

    fn two_param_model() -> FnModel {
        FnModel::new(1, &["a", "b"], |_t, x, p, out| out[0] = p[0] * x[0] + p[1])
    }

    #[test]
    fn aligned_to_reorders_by_model_names() {
        let params = Parameters::new([("b", 2.0), ("a", 1.0)]).expect("params");
        let aligned = params.aligned_to(&two_param_model()).expect("aligned");
        assert_eq!(aligned.names(), &["a".to_string(), "b".to_string()]);
        assert_eq!(aligned.values(), &[1.0, 2.0]);
    }

    #[test]
    fn aligned_to_rejects_missing_and_unknown() {
        let model = two_param_model();
        let missing = Parameters::new([("a", 1.0)]).expect("params");
        let err = missing.aligned_to(&model).expect_err("missing b");
        assert!(format!("{err}").contains("missing value for parameter 'b'"));

        let unknown = Parameters::new([("a", 1.0), ("b", 2.0), ("c", 3.0)]).expect("params");
        let err = unknown.aligned_to(&model).expect_err("unknown c");
        assert!(format!("{err}").contains("no parameter named 'c'"));
    }

    #[test]
    fn new_rejects_duplicates_and_non_finite() {
        assert!(Parameters::new([("a", 1.0), ("a", 2.0)]).is_err());
        assert!(Parameters::new([("a", f64::NAN)]).is_err());
    }

    #[test]
    fn set_and_with_value() {
        let mut params = Parameters::from_model(&two_param_model(), &[1.0, 2.0]).expect("params");
        params.set("b", 5.0).expect("set b");
        assert_eq!(params.get("b"), Some(5.0));
        assert!(params.set("z", 1.0).is_err());

        let copy = params.with_value(0, -3.0);
        assert_eq!(copy.get("a"), Some(-3.0));
        assert_eq!(params.get("a"), Some(1.0));
    }
}
