/// Inverse square-root schedule with linear warmup.
///
/// Formula: lr = embed_dim^-0.5 * min(step^-0.5, step * warmup^-1.5)
///
/// `step` counts optimizer steps from 1. The peak is reached at
/// `step == warmup_steps`.
#[derive(Debug, Clone, Copy)]
pub struct WarmupDecaySchedule {
    embed_dim: f64,
    warmup_steps: f64,
}

impl WarmupDecaySchedule {
    pub fn new(embed_dim: i64, warmup_steps: usize) -> Self {
        Self {
            embed_dim: embed_dim.max(1) as f64,
            warmup_steps: warmup_steps.max(1) as f64,
        }
    }

    pub fn lr(&self, step: u64) -> f64 {
        let step = step.max(1) as f64;
        let decay = step.powf(-0.5);
        let warmup = step * self.warmup_steps.powf(-1.5);
        self.embed_dim.powf(-0.5) * decay.min(warmup)
    }

    pub fn peak_lr(&self) -> f64 {
        self.lr(self.warmup_steps as u64)
    }
}
