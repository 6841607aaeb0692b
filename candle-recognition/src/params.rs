//! Trainable parameters with an initialisation recipe.
//!
//! Components allocate their weights through a [`ParamStore`] at construction time and
//! only fill them when `init_weights` runs, so a model built with
//! [`RecognizerBase::new`](crate::RecognizerBase::new) is initialised exactly once.
//!
//! Buffers such as batch-norm running statistics live in the same [`VarMap`], so they are
//! saved and restored with the weights, but [`trainable_vars`] leaves them out.

use crate::{Error, Result};
use candle::{DType, Device, Shape, Tensor, Var};
use candle_nn::{Init, VarMap};

#[derive(Clone, Debug)]
pub struct Param {
    var: Var,
    init: Init,
}

impl Param {
    pub fn tensor(&self) -> &Tensor {
        self.var.as_tensor()
    }

    pub fn var(&self) -> &Var {
        &self.var
    }

    pub fn init(&self) -> Init {
        self.init
    }

    /// Replaces the recipe used by the next [`reset`](Self::reset).
    pub fn set_init(&mut self, init: Init) {
        self.init = init;
    }

    /// Fills the parameter in place from its recipe. Tensors cloned from
    /// [`tensor`](Self::tensor) observe the new values.
    pub fn reset(&self) -> Result<()> {
        let fresh = self
            .init
            .var(self.var.shape().clone(), self.var.dtype(), self.var.device())?;
        self.var.set(fresh.as_tensor())?;
        Ok(())
    }
}

/// Trailing key segments of non-trainable buffers.
const BUFFER_NAMES: &[&str] = &["running_mean", "running_var"];

fn is_buffer(key: &str) -> bool {
    let name = key.rsplit('.').next().unwrap_or(key);
    BUFFER_NAMES.contains(&name)
}

/// Every variable of `varmap` except buffers, for an optimizer.
pub fn trainable_vars(varmap: &VarMap) -> Vec<Var> {
    let data = varmap.data().lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    data.iter()
        .filter(|(key, _)| !is_buffer(key))
        .map(|(_, var)| var.clone())
        .collect()
}

/// A prefixed view of a [`VarMap`], in the spirit of `VarBuilder::pp`.
#[derive(Clone)]
pub struct ParamStore {
    varmap: VarMap,
    path: Vec<String>,
    dtype: DType,
    device: Device,
}

impl ParamStore {
    pub fn new(varmap: &VarMap, dtype: DType, device: &Device) -> Self {
        Self {
            varmap: varmap.clone(),
            path: Vec::new(),
            dtype,
            device: device.clone(),
        }
    }

    pub fn pp(&self, s: impl ToString) -> Self {
        let mut path = self.path.clone();
        path.push(s.to_string());
        Self {
            varmap: self.varmap.clone(),
            path,
            dtype: self.dtype,
            device: self.device.clone(),
        }
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    fn key(&self, name: &str) -> String {
        if self.path.is_empty() {
            name.to_string()
        } else {
            format!("{}.{name}", self.path.join("."))
        }
    }

    fn register(&self, key: String, var: &Var) -> Result<()> {
        let mut data = self
            .varmap
            .data()
            .lock()
            .map_err(|_| Error::Config("parameter map is poisoned".to_string()))?;
        if data.contains_key(&key) {
            return Err(Error::Config(format!("duplicate parameter \"{key}\"")));
        }
        data.insert(key, var.clone());
        Ok(())
    }

    /// Allocates a zeroed parameter and registers it in the var map.
    pub fn param(&self, name: &str, shape: impl Into<Shape>, init: Init) -> Result<Param> {
        let var = Var::zeros(shape, self.dtype, &self.device)?;
        self.register(self.key(name), &var)?;
        Ok(Param { var, init })
    }

    /// Allocates a buffer filled from `init` right away. `name` must be one of the buffer
    /// names so that [`trainable_vars`] skips it.
    pub fn buffer(&self, name: &str, shape: impl Into<Shape>, init: Init) -> Result<Var> {
        if !BUFFER_NAMES.contains(&name) {
            return Err(Error::Config(format!("\"{name}\" is not a buffer name")));
        }
        let var = init.var(shape, self.dtype, &self.device)?;
        self.register(self.key(name), &var)?;
        Ok(var)
    }
}
