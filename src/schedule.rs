use burn::{config::Config, lr_scheduler::LrScheduler, tensor::backend::Backend, LearningRate};

/// The configuration for creating a [one-cycle learning rate scheduler](OneCycleLrScheduler).
///
/// The learning rate warms up from `max_lr / div_factor` to `max_lr` over the first
/// `pct_start` of the `total_steps` iterations, then anneals down to
/// `max_lr / (div_factor * final_div_factor)`. Both phases follow a half cosine.
#[derive(Config)]
pub struct OneCycleLrSchedulerConfig {
    /// The peak learning rate.
    max_lr: LearningRate,
    /// The number of iterations in the cycle.
    total_steps: usize,
    /// The fraction of the cycle spent increasing the learning rate.
    #[config(default = 0.125)]
    pct_start: f64,
    /// `max_lr` divided by the initial learning rate.
    #[config(default = 100.0)]
    div_factor: f64,
    /// The initial learning rate divided by the final one.
    #[config(default = 1e4)]
    final_div_factor: f64,
}

impl OneCycleLrSchedulerConfig {
    /// Initializes a [one-cycle learning rate scheduler](OneCycleLrScheduler).
    ///
    /// # Errors
    ///
    /// An error is returned when a parameter is outside its valid range.
    pub fn init(&self) -> Result<OneCycleLrScheduler, String> {
        if self.max_lr <= 0. {
            return Err("Maximum learning rate must be greater than 0".into());
        }
        if self.total_steps == 0 {
            return Err("Total steps must be at least 1".into());
        }
        if !(self.pct_start > 0. && self.pct_start < 1.) {
            return Err("Warmup fraction must be strictly between 0 and 1".into());
        }
        if self.div_factor <= 0. || self.final_div_factor <= 0. {
            return Err("Division factors must be greater than 0".into());
        }

        let initial_lr = self.max_lr / self.div_factor;

        Ok(OneCycleLrScheduler {
            initial_lr,
            max_lr: self.max_lr,
            min_lr: initial_lr / self.final_div_factor,
            warmup_end: self.pct_start * self.total_steps as f64 - 1.,
            last_step: self.total_steps - 1,
            current_step: 0,
        })
    }
}

/// A one-cycle learning rate scheduler with cosine annealing.
///
/// See [OneCycleLrSchedulerConfig] for more information.
#[derive(Clone, Copy, Debug)]
pub struct OneCycleLrScheduler {
    initial_lr: LearningRate,
    max_lr: LearningRate,
    min_lr: LearningRate,
    // Step at which the peak is reached; fractional like the cycle it derives from.
    warmup_end: f64,
    last_step: usize,
    current_step: usize,
}

impl OneCycleLrScheduler {
    fn lr_at(&self, step: usize) -> LearningRate {
        let step = step.min(self.last_step) as f64;

        if self.warmup_end > 0. && step <= self.warmup_end {
            return cosine_annealing(self.initial_lr, self.max_lr, step / self.warmup_end);
        }

        let start = self.warmup_end.max(0.);
        let span = self.last_step as f64 - start;
        let pct = if span > 0. { (step - start) / span } else { 1. };

        cosine_annealing(self.max_lr, self.min_lr, pct)
    }
}

fn cosine_annealing(start: LearningRate, end: LearningRate, pct: f64) -> LearningRate {
    end + (start - end) / 2. * ((std::f64::consts::PI * pct).cos() + 1.)
}

impl LrScheduler for OneCycleLrScheduler {
    type Record<B: Backend> = usize;

    fn step(&mut self) -> LearningRate {
        let lr = self.lr_at(self.current_step);
        self.current_step += 1;
        lr
    }

    fn to_record<B: Backend>(&self) -> Self::Record<B> {
        self.current_step
    }

    fn load_record<B: Backend>(mut self, record: Self::Record<B>) -> Self {
        self.current_step = record;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::TestBackend;

    const EPSILON: f64 = 1e-10;

    fn assert_lr(lr: LearningRate, expected: LearningRate) {
        assert!(
            (lr - expected).abs() < EPSILON,
            "Scheduled learning rate {lr} is not approximately equal to {expected}"
        );
    }

    #[test]
    fn starts_low_peaks_then_anneals() {
        let mut scheduler = OneCycleLrSchedulerConfig::new(1e-3, 41)
            .with_pct_start(0.25)
            .init()
            .unwrap();

        let lrs: Vec<_> = (0..41).map(|_| scheduler.step()).collect();

        assert_lr(lrs[0], 1e-5);
        // Warmup ends at 0.25 * 41 - 1 = 9.25, so the peak falls between steps 9 and 10.
        assert!(lrs[9] < 1e-3 && lrs[10] < 1e-3);
        assert!(lrs[..10].windows(2).all(|pair| pair[0] < pair[1]));
        assert!(lrs[10..].windows(2).all(|pair| pair[0] > pair[1]));
        assert_lr(lrs[40], 1e-9);
    }

    #[test]
    fn holds_the_final_rate_past_the_cycle() {
        let mut scheduler = OneCycleLrSchedulerConfig::new(1e-2, 10).init().unwrap();

        let last = (0..10).map(|_| scheduler.step()).last().unwrap();

        assert_lr(scheduler.step(), last);
        assert_lr(scheduler.step(), last);
    }

    #[test]
    fn midpoint_of_warmup_is_the_average() {
        let mut scheduler = OneCycleLrSchedulerConfig::new(1.0, 9)
            .with_pct_start(5. / 9.)
            .with_div_factor(10.)
            .init()
            .unwrap();

        // Warmup spans steps 0..=4; step 2 is halfway.
        let lrs: Vec<_> = (0..5).map(|_| scheduler.step()).collect();

        assert_lr(lrs[2], (0.1 + 1.0) / 2.);
        assert_lr(lrs[4], 1.0);
    }

    #[test]
    fn invalid_configs_are_rejected() {
        assert!(OneCycleLrSchedulerConfig::new(0., 10).init().is_err());
        assert!(OneCycleLrSchedulerConfig::new(1e-3, 0).init().is_err());
        assert!(OneCycleLrSchedulerConfig::new(1e-3, 10)
            .with_pct_start(1.)
            .init()
            .is_err());
    }

    #[test]
    fn resumes_from_record() {
        let mut scheduler = OneCycleLrSchedulerConfig::new(1e-3, 100).init().unwrap();
        let mut truth = scheduler;

        (0..30).for_each(|_| {
            scheduler.step();
            truth.step();
        });
        let record = scheduler.to_record::<TestBackend>();
        let mut restored = OneCycleLrSchedulerConfig::new(1e-3, 100)
            .init()
            .unwrap()
            .load_record::<TestBackend>(record);

        (0..30).for_each(|_| assert_lr(restored.step(), truth.step()));
    }
}
