//! Gradient-based update strategies for a single mutable tensor.
//!
//! The only trainable quantity in this crate is an image, so strategies keep
//! their state for one tensor instead of a parameter table. Minimization
//! semantics: callers maximizing an objective negate its gradient.

use ndarray::{Array, Dimension};

/// An optimization strategy to be used with [`Optimizer`].
pub trait Strategy<D: Dimension> {
    fn update(&mut self, grad: &Array<f32, D>, rate: f32, step: usize) -> Array<f32, D>;
}

/// Generic optimizer that allows for several optimization [strategies](Strategy) to be used.
#[derive(Debug)]
pub struct Optimizer<D: Dimension, S: Strategy<D>> {
    strategy: S,
    pub learning_rate: f32,
    step: usize,
    _dim: std::marker::PhantomData<D>,
}

impl<D: Dimension, S: Strategy<D>> Optimizer<D, S> {
    pub fn new(learning_rate: f32, strategy: S) -> Self {
        Self {
            strategy,
            learning_rate,
            step: 1,
            _dim: std::marker::PhantomData,
        }
    }

    /// Applies one update step in the direction that decreases the objective.
    pub fn minimize(&mut self, tensor: &mut Array<f32, D>, grad: &Array<f32, D>) {
        let change = self.strategy.update(grad, self.learning_rate, self.step);
        *tensor += &change;
        self.step += 1;
    }

    pub fn step(&self) -> usize {
        self.step
    }
}

/// Plain gradient descent.
#[derive(Debug, Clone, Default)]
pub struct Sgd;

impl<D: Dimension> Strategy<D> for Sgd {
    fn update(&mut self, grad: &Array<f32, D>, rate: f32, _step: usize) -> Array<f32, D> {
        grad * -rate
    }
}

/// Adaptive Movement Estimation strategy (ADAM)
#[derive(Debug, Clone)]
pub struct Adam<D: Dimension> {
    pub beta1: f32,
    pub beta2: f32,
    pub epsilon: f32,
    m: Option<Array<f32, D>>,
    v: Option<Array<f32, D>>,
}

impl<D: Dimension> Adam<D> {
    pub fn new(beta1: f32, beta2: f32) -> Self {
        Self {
            beta1,
            beta2,
            epsilon: 1e-8,
            m: None,
            v: None,
        }
    }
}

impl<D: Dimension> Default for Adam<D> {
    fn default() -> Self {
        Self::new(0.9, 0.999)
    }
}

impl<D: Dimension> Strategy<D> for Adam<D> {
    fn update(&mut self, grad: &Array<f32, D>, rate: f32, step: usize) -> Array<f32, D> {
        let m = self
            .m
            .get_or_insert_with(|| Array::zeros(grad.raw_dim()));
        let v = self
            .v
            .get_or_insert_with(|| Array::zeros(grad.raw_dim()));

        *m = &*m * self.beta1 + grad * (1.0 - self.beta1);
        *v = &*v * self.beta2 + grad.mapv(|g| g * g) * (1.0 - self.beta2);

        let step = step as i32;
        let mt = &*m / (1.0 - self.beta1.powi(step));
        let vt = &*v / (1.0 - self.beta2.powi(step));
        mt * -rate / (vt.mapv(f32::sqrt) + self.epsilon)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::{arr1, Array1, Ix1};

    fn quadratic_grad(x: &Array1<f32>, target: &Array1<f32>) -> Array1<f32> {
        (x - target) * 2.0
    }

    #[test]
    fn sgd_descends_a_quadratic() {
        let target = arr1(&[1.0_f32, -2.0, 0.5]);
        let mut x = arr1(&[0.0_f32, 0.0, 0.0]);
        let mut optimizer = Optimizer::new(0.1, Sgd);

        for _ in 0..100 {
            let grad = quadratic_grad(&x, &target);
            optimizer.minimize(&mut x, &grad);
        }
        for (a, b) in x.iter().zip(target.iter()) {
            assert!((a - b).abs() < 1e-3);
        }
    }

    #[test]
    fn adam_descends_a_quadratic() {
        let target = arr1(&[3.0_f32, -1.0]);
        let mut x = arr1(&[0.0_f32, 0.0]);
        let mut optimizer: Optimizer<Ix1, _> = Optimizer::new(0.2, Adam::default());

        for _ in 0..400 {
            let grad = quadratic_grad(&x, &target);
            optimizer.minimize(&mut x, &grad);
        }
        for (a, b) in x.iter().zip(target.iter()) {
            assert!((a - b).abs() < 1e-2);
        }
    }

    #[test]
    fn learning_rate_can_change_between_steps() {
        let mut x = arr1(&[10.0_f32]);
        let mut optimizer = Optimizer::new(1.0, Sgd);
        optimizer.minimize(&mut x.clone(), &arr1(&[1.0]));

        optimizer.learning_rate = 0.5;
        let before = x[0];
        optimizer.minimize(&mut x, &arr1(&[1.0]));
        assert!((before - x[0] - 0.5).abs() < 1e-6);
    }
}
