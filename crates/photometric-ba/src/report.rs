/// Outcome of [`crate::Window::optimize`].
#[derive(Clone, Debug, PartialEq)]
pub struct OptimizationReport {
    pub iterations: usize,
    pub accepted_steps: usize,
    pub rejected_steps: usize,
    /// Energy of the first accumulation pass.
    pub initial_energy: f64,
    /// Energy at the state the frontend holds on return.
    pub final_energy: f64,
    pub final_lambda: f64,
    /// The last accepted step fell below the convergence threshold.
    pub converged: bool,
}

impl OptimizationReport {
    pub(crate) fn started(energy: f64, lambda: f64) -> Self {
        Self {
            iterations: 0,
            accepted_steps: 0,
            rejected_steps: 0,
            initial_energy: energy,
            final_energy: energy,
            final_lambda: lambda,
            converged: false,
        }
    }

    pub fn energy_reduction(&self) -> f64 {
        self.initial_energy - self.final_energy
    }
}
