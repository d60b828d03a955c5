use rand::Rng;
use tch::{Kind, Tensor};

/// Random image augmentation applied per sample while batching.
#[derive(Debug, Clone, Copy)]
pub struct Augmentation {
    pub flip_probability: f64,
    /// Contrast factor is drawn from `[1 - contrast, 1 + contrast]`.
    pub contrast: f64,
}

impl Default for Augmentation {
    fn default() -> Self {
        Self {
            flip_probability: 0.5,
            contrast: 0.3,
        }
    }
}

impl Augmentation {
    /// image: [3, H, W] with values in [0, 1]
    pub fn apply<R: Rng>(&self, image: &Tensor, rng: &mut R) -> Tensor {
        let mut out = if rng.gen_bool(self.flip_probability.clamp(0.0, 1.0)) {
            image.flip([2])
        } else {
            image.shallow_clone()
        };

        if self.contrast > 0.0 {
            let factor = rng.gen_range(1.0 - self.contrast..=1.0 + self.contrast);
            let mean = out.mean_dim(Some(&[1, 2][..]), true, Kind::Float);
            out = ((&out - &mean) * factor + &mean).clamp(0.0, 1.0);
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use tch::Device;

    fn gradient_image() -> Tensor {
        Tensor::arange(12, (Kind::Float, Device::Cpu))
            .view([1, 3, 4])
            .repeat([3, 1, 1])
            / 11.0
    }

    #[test]
    fn always_flip_mirrors_width() {
        let aug = Augmentation {
            flip_probability: 1.0,
            contrast: 0.0,
        };
        let image = gradient_image();
        let out = aug.apply(&image, &mut StdRng::seed_from_u64(0));
        assert_eq!(out.size(), vec![3, 3, 4]);
        let diff = (out - image.flip([2])).abs().max().double_value(&[]);
        assert!(diff < 1e-6);
    }

    #[test]
    fn contrast_keeps_range_and_mean() {
        let aug = Augmentation {
            flip_probability: 0.0,
            contrast: 0.3,
        };
        let image = Tensor::full([3, 8, 8], 0.5, (Kind::Float, Device::Cpu));
        let mut rng = StdRng::seed_from_u64(3);
        for _ in 0..10 {
            let out = aug.apply(&image, &mut rng);
            assert!(out.min().double_value(&[]) >= 0.0);
            assert!(out.max().double_value(&[]) <= 1.0);
            assert!((out.mean(Kind::Float).double_value(&[]) - 0.5).abs() < 1e-6);
        }
    }

    #[test]
    fn disabled_augmentation_is_identity() {
        let aug = Augmentation {
            flip_probability: 0.0,
            contrast: 0.0,
        };
        let image = gradient_image();
        let out = aug.apply(&image, &mut StdRng::seed_from_u64(1));
        assert!((out - image).abs().max().double_value(&[]) < 1e-9);
    }
}
