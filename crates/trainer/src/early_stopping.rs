/// Outcome of one early-stopping check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopDecision {
    /// The monitored value improved; the caller should snapshot the weights.
    Improved,
    NoImprovement,
    /// Patience exhausted.
    Stop,
}

/// Stops training once the monitored loss has not improved for `patience`
/// consecutive epochs.
#[derive(Debug, Clone)]
pub struct EarlyStopping {
    patience: usize,
    min_delta: f64,
    best: f64,
    best_epoch: Option<usize>,
    pub(crate) epochs_without_improvement: usize,
    restore_best: bool,
}

impl EarlyStopping {
    pub fn new(patience: usize, min_delta: f64) -> Self {
        Self {
            patience,
            min_delta,
            best: f64::INFINITY,
            best_epoch: None,
            epochs_without_improvement: 0,
            restore_best: false,
        }
    }

    /// Restore the best weights when training ends.
    pub fn with_restore_best(mut self) -> Self {
        self.restore_best = true;
        self
    }

    pub fn restore_best(&self) -> bool {
        self.restore_best
    }

    pub fn best(&self) -> f64 {
        self.best
    }

    pub fn best_epoch(&self) -> Option<usize> {
        self.best_epoch
    }

    pub fn update(&mut self, epoch: usize, value: f64) -> StopDecision {
        if value < self.best - self.min_delta {
            self.best = value;
            self.best_epoch = Some(epoch);
            self.epochs_without_improvement = 0;
            return StopDecision::Improved;
        }

        self.epochs_without_improvement += 1;
        if self.epochs_without_improvement >= self.patience {
            log::info!(
                "Early stopping: no improvement for {} epochs (best loss: {:.4} at epoch {:?})",
                self.patience,
                self.best,
                self.best_epoch.map(|e| e + 1)
            );
            StopDecision::Stop
        } else {
            StopDecision::NoImprovement
        }
    }
}
