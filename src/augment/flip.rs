use ndarray::{s, Array3};
use rand::Rng;

use crate::sample::Sample;

fn flip_left_right(array: &Array3<f32>) -> Array3<f32> {
    array.slice(s![.., ..;-1, ..]).to_owned()
}

fn flip_up_down(array: &Array3<f32>) -> Array3<f32> {
    array.slice(s![..;-1, .., ..]).to_owned()
}

/// Flips left-right and up-down, each with probability 0.5, identically on
/// image and mask.
pub fn random_flip<R: Rng + ?Sized>(mut sample: Sample, rng: &mut R) -> Sample {
    if rng.random_bool(0.5) {
        sample.image = flip_left_right(&sample.image);
        sample.mask = flip_left_right(&sample.mask);
    }
    if rng.random_bool(0.5) {
        sample.image = flip_up_down(&sample.image);
        sample.mask = flip_up_down(&sample.mask);
    }
    sample
}
