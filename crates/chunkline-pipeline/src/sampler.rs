//! Choosing the next token from the last chunk's logits.

use std::sync::Arc;

use chunkline_core::{DType, FeatureMap, Model, ZeroCopyTensor};

use crate::error::{PipelineError, Result};
use crate::names;
use crate::TokenId;

/// Picks a token from the logits at one window position.
///
/// `logits` are the named parts of the vocabulary in order, as returned by
/// [`collect_logits`]: one part unless the last chunk splits its output into
/// `logits_{i}`, each shaped `[..., query_length, part_size]`.
pub trait Sampler: Send + Sync {
    fn sample(&self, logits: &[(String, ZeroCopyTensor)], position: usize) -> Result<TokenId>;
}

/// Logits outputs of the last chunk, in part order.
pub fn collect_logits(outputs: &FeatureMap) -> Result<Vec<(String, ZeroCopyTensor)>> {
    let mut parts: Vec<(usize, String, ZeroCopyTensor)> = outputs
        .iter()
        .filter_map(|(name, t)| Some((names::logits_part(name)?, name.to_string(), t.clone())))
        .collect();
    if parts.is_empty() {
        return Err(PipelineError::UnsupportedInferenceConfiguration(format!(
            "last chunk produced no '{}' output",
            names::LOGITS
        )));
    }
    parts.sort_by_key(|(index, _, _)| *index);
    Ok(parts.into_iter().map(|(_, name, t)| (name, t)).collect())
}

/// Full-vocabulary logits at `position`, concatenating split parts.
pub fn logits_at(parts: &[(String, ZeroCopyTensor)], position: usize) -> Result<Vec<f32>> {
    let mut row = Vec::new();
    for (_, part) in parts {
        row.extend(part.row_f32(position)?);
    }
    Ok(row)
}

/// Greedy decoding, computed on the host.
#[derive(Debug, Default, Clone, Copy)]
pub struct ArgmaxSampler;

impl Sampler for ArgmaxSampler {
    fn sample(&self, logits: &[(String, ZeroCopyTensor)], position: usize) -> Result<TokenId> {
        let row = logits_at(logits, position)?;
        let mut best: Option<(usize, f32)> = None;
        for (i, &v) in row.iter().enumerate() {
            if best.map_or(true, |(_, b)| v > b) {
                best = Some((i, v));
            }
        }
        let (index, _) = best.ok_or_else(|| {
            PipelineError::UnsupportedInferenceConfiguration("logits are empty".into())
        })?;
        Ok(index as TokenId)
    }
}

/// Greedy decoding with a sampling model that takes the logits parts by name
/// and produces an `argmax` per window position.
pub struct ModelSampler {
    model: Arc<dyn Model>,
    inputs: Vec<String>,
}

impl ModelSampler {
    pub fn new(model: Arc<dyn Model>) -> Result<Self> {
        let desc = model.description();
        if desc.output(names::ARGMAX).is_none() {
            return Err(PipelineError::UnsupportedInferenceConfiguration(format!(
                "sampling model declares no '{}' output",
                names::ARGMAX
            )));
        }
        let inputs: Vec<String> = desc.inputs.iter().map(|d| d.name.clone()).collect();
        if let Some(bad) = inputs.iter().find(|n| names::logits_part(n).is_none()) {
            return Err(PipelineError::UnsupportedInferenceConfiguration(format!(
                "sampling model input '{bad}' is not a logits part"
            )));
        }
        Ok(Self { model, inputs })
    }
}

impl Sampler for ModelSampler {
    fn sample(&self, logits: &[(String, ZeroCopyTensor)], position: usize) -> Result<TokenId> {
        let mut inputs = FeatureMap::new();
        for name in &self.inputs {
            let (_, tensor) = logits.iter().find(|(n, _)| n == name).ok_or_else(|| {
                PipelineError::UnsupportedInferenceConfiguration(format!(
                    "sampling model wants '{name}', which the last chunk does not produce"
                ))
            })?;
            inputs.insert(name.clone(), tensor.clone());
        }
        let outputs = self.model.predict(&inputs, &FeatureMap::new())?;
        read_argmax(outputs.require(names::ARGMAX)?, position)
    }
}

fn read_argmax(argmax: &ZeroCopyTensor, position: usize) -> Result<TokenId> {
    let values: Vec<TokenId> = match argmax.dtype() {
        DType::I32 => argmax.to_i32_vec()?,
        _ => argmax.to_f32_vec().into_iter().map(|v| v as TokenId).collect(),
    };
    let index = if values.len() == 1 { 0 } else { position };
    values.get(index).copied().ok_or_else(|| {
        PipelineError::UnsupportedInferenceConfiguration(format!(
            "'{}' has {} entries, no position {position}",
            names::ARGMAX,
            values.len()
        ))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ArgmaxModel;

    fn logits(rows: &[&[f32]]) -> ZeroCopyTensor {
        let width = rows[0].len();
        let flat: Vec<f32> = rows.iter().flat_map(|r| r.iter().copied()).collect();
        ZeroCopyTensor::from_f32(DType::F16, [1, rows.len(), width], &flat).unwrap()
    }

    fn named(parts: &[(&str, &ZeroCopyTensor)]) -> Vec<(String, ZeroCopyTensor)> {
        parts.iter().map(|(n, t)| (n.to_string(), (*t).clone())).collect()
    }

    #[test]
    fn test_argmax_at_position() {
        let t = logits(&[&[0.0, 5.0, 1.0], &[3.0, 0.0, 1.0]]);
        let parts = named(&[("logits", &t)]);
        assert_eq!(ArgmaxSampler.sample(&parts, 0).unwrap(), 1);
        assert_eq!(ArgmaxSampler.sample(&parts, 1).unwrap(), 0);
    }

    #[test]
    fn test_argmax_ties_pick_lowest() {
        let t = logits(&[&[2.0, 2.0, 1.0]]);
        assert_eq!(ArgmaxSampler.sample(&named(&[("logits", &t)]), 0).unwrap(), 0);
    }

    #[test]
    fn test_split_parts_are_concatenated() {
        let a = logits(&[&[0.0, 1.0], &[0.0, 0.0]]);
        let b = logits(&[&[0.0, 0.0], &[0.0, 9.0]]);
        let parts = named(&[("logits_0", &a), ("logits_1", &b)]);
        assert_eq!(ArgmaxSampler.sample(&parts, 0).unwrap(), 1);
        assert_eq!(ArgmaxSampler.sample(&parts, 1).unwrap(), 3);
    }

    #[test]
    fn test_collect_logits_orders_parts() {
        let mut outputs = FeatureMap::new();
        outputs.insert("logits_1", logits(&[&[0.0]]));
        outputs.insert("logits_0", logits(&[&[0.0]]));
        outputs.insert("new_x", logits(&[&[0.0]]));
        let parts = collect_logits(&outputs).unwrap();
        let names: Vec<&str> = parts.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(names, vec!["logits_0", "logits_1"]);
        assert!(collect_logits(&FeatureMap::new()).is_err());
    }

    #[test]
    fn test_model_sampler() {
        let a = logits(&[&[0.0, 1.0], &[0.0, 0.0]]);
        let b = logits(&[&[0.0, 0.0], &[0.0, 9.0]]);
        let model = Arc::new(ArgmaxModel::new(&["logits_0", "logits_1"], 2));
        let sampler = ModelSampler::new(model).unwrap();
        let parts = named(&[("logits_0", &a), ("logits_1", &b)]);
        assert_eq!(sampler.sample(&parts, 1).unwrap(), 3);
        assert_eq!(sampler.sample(&parts, 0).unwrap(), 1);
    }

    #[test]
    fn test_model_sampler_uses_part_names_from_one() {
        let a = logits(&[&[0.0, 7.0]]);
        let b = logits(&[&[0.0, 0.0]]);
        let mut outputs = FeatureMap::new();
        outputs.insert("logits_1", a);
        outputs.insert("logits_2", b);
        let parts = collect_logits(&outputs).unwrap();

        let model = Arc::new(ArgmaxModel::new(&["logits_1", "logits_2"], 1));
        let sampler = ModelSampler::new(model).unwrap();
        assert_eq!(sampler.sample(&parts, 0).unwrap(), 1);
        assert_eq!(ArgmaxSampler.sample(&parts, 0).unwrap(), 1);
    }

    #[test]
    fn test_model_sampler_reports_missing_part() {
        let model = Arc::new(ArgmaxModel::new(&["logits_0", "logits_1"], 1));
        let sampler = ModelSampler::new(model).unwrap();
        let only = logits(&[&[1.0]]);
        let err = sampler.sample(&named(&[("logits_0", &only)]), 0).unwrap_err();
        assert!(matches!(err, PipelineError::UnsupportedInferenceConfiguration(_)));
    }

    #[test]
    fn test_model_sampler_rejects_bad_interface() {
        let model = Arc::new(ArgmaxModel::new(&["hidden"], 2));
        assert!(ModelSampler::new(model).is_err());
    }
}
