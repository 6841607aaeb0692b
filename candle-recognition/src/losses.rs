//! Named loss bundles and their reduction to a training loss plus loggable scalars.

use crate::dist::ProcessGroup;
use crate::{Error, Result};
use candle::{DType, Tensor};
use std::fmt;

/// One entry of a [`LossBundle`].
#[derive(Clone, Debug)]
pub enum LossValue {
    Tensor(Tensor),
    List(Vec<Tensor>),
}

impl From<Tensor> for LossValue {
    fn from(t: Tensor) -> Self {
        Self::Tensor(t)
    }
}

impl From<Vec<Tensor>> for LossValue {
    fn from(ts: Vec<Tensor>) -> Self {
        Self::List(ts)
    }
}

/// Raw losses and metrics produced by a forward pass, in insertion order.
#[derive(Clone, Debug, Default)]
pub struct LossBundle {
    entries: Vec<(String, LossValue)>,
}

impl LossBundle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts `value` under `name`. An existing entry keeps its position.
    pub fn insert(&mut self, name: impl Into<String>, value: impl Into<LossValue>) {
        let name = name.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(key, _)| *key == name) {
            Some((_, slot)) => *slot = value,
            None => self.entries.push((name, value)),
        }
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<LossValue>) -> Self {
        self.insert(name, value);
        self
    }

    pub fn get(&self, name: &str) -> Option<&LossValue> {
        self.entries
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &LossValue)> {
        self.entries.iter().map(|(key, value)| (key.as_str(), value))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<K: Into<String>, V: Into<LossValue>> FromIterator<(K, V)> for LossBundle {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut bundle = Self::new();
        for (key, value) in iter {
            bundle.insert(key, value);
        }
        bundle
    }
}

/// Plain scalars ready for a logger, in insertion order.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct LogVars {
    entries: Vec<(String, f64)>,
}

impl LogVars {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, name: impl Into<String>, value: f64) {
        let name = name.into();
        match self.entries.iter_mut().find(|(key, _)| *key == name) {
            Some((_, slot)) => *slot = value,
            None => self.entries.push((name, value)),
        }
    }

    pub fn get(&self, name: &str) -> Option<f64> {
        self.entries
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| *value)
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(key, _)| key.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f64)> {
        self.entries.iter().map(|(key, value)| (key.as_str(), *value))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl fmt::Display for LogVars {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, (key, value)) in self.entries.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{key}: {value:.4}")?;
        }
        Ok(())
    }
}

fn float_mean(name: &str, t: &Tensor) -> Result<Tensor> {
    if !t.dtype().is_float() {
        return Err(Error::TypeMismatch(name.to_string()));
    }
    Ok(t.mean_all()?)
}

fn reduce_entry(name: &str, value: &LossValue) -> Result<Tensor> {
    match value {
        LossValue::Tensor(t) => float_mean(name, t),
        LossValue::List(ts) => {
            let (first, rest) = ts
                .split_first()
                .ok_or_else(|| Error::TypeMismatch(name.to_string()))?;
            let mut sum = float_mean(name, first)?;
            for t in rest {
                sum = sum.add(&float_mean(name, t)?)?;
            }
            Ok(sum)
        }
    }
}

/// Reduces a loss bundle to the loss used for back-propagation and the values to log.
///
/// Every entry is reduced to a scalar mean (lists sum the means of their members). The
/// returned loss is the sum of the entries whose name contains `"loss"` and it is also
/// logged under `"loss"`, and a bundle without any such entry is rejected. When `group` spans several workers each logged value is averaged
/// over the group first, so that all workers log the same numbers.
pub fn parse_losses(losses: &LossBundle, group: &dyn ProcessGroup) -> Result<(Tensor, LogVars)> {
    if losses.is_empty() {
        return Err(Error::InvalidArgument("loss bundle is empty".to_string()));
    }

    let mut reduced = Vec::with_capacity(losses.len() + 1);
    for (name, value) in losses.iter() {
        reduced.push((name.to_string(), reduce_entry(name, value)?));
    }

    let mut total: Option<Tensor> = None;
    for (name, value) in reduced.iter() {
        if name.contains("loss") {
            total = Some(match total {
                None => value.clone(),
                Some(acc) => acc.add(value)?,
            });
        }
    }
    let Some(total) = total else {
        let names: Vec<&str> = reduced.iter().map(|(name, _)| name.as_str()).collect();
        return Err(Error::InvalidArgument(format!(
            "loss bundle has no entry named like a loss: {names:?}"
        )));
    };

    match reduced.iter_mut().find(|(name, _)| name == "loss") {
        Some((_, slot)) => *slot = total.clone(),
        None => reduced.push(("loss".to_string(), total.clone())),
    }

    let mut log_vars = LogVars::new();
    for (name, value) in reduced {
        let mut value = value.detach();
        if group.is_distributed() {
            value = group.all_reduce_mean(&value)?;
        }
        log_vars.insert(name, value.to_dtype(DType::F64)?.to_scalar::<f64>()?);
    }
    Ok((total, log_vars))
}
