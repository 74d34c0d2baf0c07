use comms::{PartyRole, Transport};
use log::{debug, info};
use ndarray::{ArrayD, IxDyn};
use rand::{Rng, SeedableRng, rngs::StdRng};
use rand_distr::StandardNormal;

use crate::OpErr;

/// Standard deviation of the masks used to split values into shares.
const MASK_SCALE: f32 = 1.0;

/// Everything a role needs to run secret-share operators: who it is, the link to its peers
/// and the randomness its masks are drawn from.
#[derive(Debug)]
pub struct ExecutionContext<T> {
    role: PartyRole,
    link: T,
    rng: StdRng,
}

impl<T: Transport> ExecutionContext<T> {
    /// Creates a new `ExecutionContext` whose masks come from the operating system.
    ///
    /// # Arguments
    /// * `link` - A connected transport to the other roles.
    ///
    /// # Returns
    /// A new `ExecutionContext` instance.
    pub fn new(link: T) -> Self {
        Self::with_rng(link, StdRng::from_os_rng())
    }

    /// Creates a new `ExecutionContext` with reproducible masks.
    pub fn seeded(link: T, seed: u64) -> Self {
        Self::with_rng(link, StdRng::seed_from_u64(seed))
    }

    fn with_rng(link: T, rng: StdRng) -> Self {
        Self {
            role: link.role(),
            link,
            rng,
        }
    }

    /// Announces the context, must be called once before the first batch.
    pub fn init(&self) {
        info!(role = self.role.id(); "execution context ready as {}", self.role);
    }

    pub fn role(&self) -> PartyRole {
        self.role
    }

    pub fn link(&mut self) -> &mut T {
        &mut self.link
    }

    /// Draws a fresh random mask.
    pub(crate) fn mask(&mut self, dim: IxDyn) -> ArrayD<f32> {
        ArrayD::from_shape_fn(dim, |_| self.rng.sample::<f32, _>(StandardNormal) * MASK_SCALE)
    }

    /// Tells the peers this role leaves and hands the link back.
    ///
    /// # Returns
    /// The transport or an error if the goodbye could not be sent.
    pub async fn teardown(mut self) -> Result<T, OpErr> {
        debug!(role = self.role.id(); "tearing down the execution context");
        self.link.shutdown().await?;
        Ok(self.link)
    }
}
