//! The default randomness source for `random_get`.

use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};

pub fn random_ctx() -> Box<dyn RngCore + Send> {
    Box::new(StdRng::from_entropy())
}
