//! Adam optimizer with exportable moment estimates, so the optimizer state
//! can travel with a checkpoint.

use anyhow::Result;
use candle_core::{DType, Tensor, Var};
use candle_core::backprop::GradStore;
use std::collections::HashMap;

pub struct Adam {
    learning_rate: f64,
    beta1: f64,
    beta2: f64,
    eps: f64,
    weight_decay: f64,

    m: HashMap<String, Tensor>,
    v: HashMap<String, Tensor>,

    // Step counter
    step: usize,
}

impl Adam {
    pub fn new(learning_rate: f64) -> Self {
        Self::with_params(learning_rate, 0.9, 0.999, 1e-8, 0.0)
    }

    pub fn with_params(
        learning_rate: f64,
        beta1: f64,
        beta2: f64,
        eps: f64,
        weight_decay: f64,
    ) -> Self {
        Self {
            learning_rate,
            beta1,
            beta2,
            eps,
            weight_decay,
            m: HashMap::new(),
            v: HashMap::new(),
            step: 0,
        }
    }

    pub fn get_step(&self) -> usize {
        self.step
    }

    /// One optimization step over every named parameter that received a
    /// gradient.
    pub fn step(&mut self, params: &[(String, Var)], grads: &GradStore) -> Result<()> {
        self.step += 1;
        for (name, param) in params {
            if let Some(grad) = grads.get(param.as_tensor()) {
                self.update(name, param, grad)?;
            }
        }
        Ok(())
    }

    fn update(&mut self, name: &str, param: &Var, grad: &Tensor) -> Result<()> {
        let grad = grad.to_dtype(DType::F32)?;
        let grad = if self.weight_decay > 0.0 {
            let param_f32 = param.as_tensor().to_dtype(DType::F32)?;
            (grad + (param_f32 * self.weight_decay)?)?
        } else {
            grad
        };

        let m = match self.m.get(name) {
            Some(m) => m.clone(),
            None => Tensor::zeros_like(&grad)?,
        };
        let v = match self.v.get(name) {
            Some(v) => v.clone(),
            None => Tensor::zeros_like(&grad)?,
        };

        // Biased first and second raw moment estimates
        let m_new = ((m * self.beta1)? + (&grad * (1.0 - self.beta1))?)?;
        let v_new = ((v * self.beta2)? + (grad.sqr()? * (1.0 - self.beta2))?)?;

        let step = self.step.max(1) as i32;
        let m_hat = (&m_new / (1.0 - self.beta1.powi(step)))?;
        let v_hat = (&v_new / (1.0 - self.beta2.powi(step)))?;

        let update = (m_hat / (v_hat.sqrt()? + self.eps)?)?;
        let update = update.to_dtype(param.dtype())?;
        let new_value = (param.as_tensor() - (update * self.learning_rate)?)?;
        param.set(&new_value)?;

        self.m.insert(name.to_string(), m_new);
        self.v.insert(name.to_string(), v_new);
        Ok(())
    }

    /// Moments flattened into `{name}.m` / `{name}.v` entries.
    pub fn state_tensors(&self) -> Vec<(String, Tensor)> {
        let mut out = Vec::with_capacity(self.m.len() * 2);
        for (name, m) in &self.m {
            out.push((format!("{}.m", name), m.clone()));
            if let Some(v) = self.v.get(name) {
                out.push((format!("{}.v", name), v.clone()));
            }
        }
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    pub fn load_state_tensors(&mut self, state: HashMap<String, Tensor>, step: usize) {
        self.m.clear();
        self.v.clear();
        for (key, tensor) in state {
            if let Some(name) = key.strip_suffix(".m") {
                self.m.insert(name.to_string(), tensor);
            } else if let Some(name) = key.strip_suffix(".v") {
                self.v.insert(name.to_string(), tensor);
            }
        }
        self.step = step;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn test_adam_moves_against_gradient() -> Result<()> {
        let device = Device::Cpu;
        let w = Var::new(&[1f32, -1.0], &device)?;
        let params = vec![("w".to_string(), w.clone())];
        let mut adam = Adam::new(0.1);

        // loss = sum(w^2) has gradient 2w
        let loss = w.as_tensor().sqr()?.sum_all()?;
        let grads = loss.backward()?;
        adam.step(&params, &grads)?;

        let values = w.as_tensor().to_vec1::<f32>()?;
        // First Adam step moves each coordinate by ~lr in the sign of -grad
        assert!((values[0] - 0.9).abs() < 1e-4);
        assert!((values[1] + 0.9).abs() < 1e-4);
        assert_eq!(adam.get_step(), 1);
        Ok(())
    }

    #[test]
    fn test_state_round_trips_through_names() -> Result<()> {
        let device = Device::Cpu;
        let w = Var::new(&[0.5f32], &device)?;
        let params = vec![("layer.weight".to_string(), w.clone())];
        let mut adam = Adam::new(0.01);
        let grads = w.as_tensor().sum_all()?.backward()?;
        adam.step(&params, &grads)?;

        let state = adam.state_tensors();
        let keys: Vec<&str> = state.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["layer.weight.m", "layer.weight.v"]);

        let mut restored = Adam::new(0.01);
        restored.load_state_tensors(state.into_iter().collect(), adam.get_step());
        assert_eq!(restored.get_step(), 1);
        assert_eq!(restored.state_tensors().len(), 2);
        Ok(())
    }
}
