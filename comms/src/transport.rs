use crate::{PartyRole, Result};

/// Point-to-point share exchange between the three parties plus a batch barrier.
///
/// Every role calls the same sequence of methods in the same order; the layer index
/// carried by each share lets the receiver detect a role that skipped or reordered a
/// layer.
#[allow(unused)]
#[trait_variant::make(Transport: Send)]
pub trait TransportTemplate {
    /// The role of this process.
    fn role(&self) -> PartyRole;

    /// Sends this role's share of `layer` to `to`.
    ///
    /// # Arguments
    /// * `to` - The receiving role.
    /// * `layer` - The position of the layer in the pipeline.
    /// * `values` - The flattened share.
    async fn send_share(&mut self, to: PartyRole, layer: u32, values: &[f32]) -> Result<()>;

    /// Waits for the share of `layer` sent by `from`.
    ///
    /// # Arguments
    /// * `from` - The sending role.
    /// * `layer` - The position of the layer the share must belong to.
    ///
    /// # Returns
    /// The flattened share or an error if the peer failed, timed out or desynchronized.
    async fn recv_share(&mut self, from: PartyRole, layer: u32) -> Result<Vec<f32>>;

    /// Rendezvous of every role before executing a batch.
    ///
    /// The wait is bounded: if some role never arrives, every role returns an error
    /// instead of hanging.
    ///
    /// # Arguments
    /// * `epoch` - The current epoch.
    /// * `batch` - The batch counter within the epoch.
    async fn barrier(&mut self, epoch: usize, batch: usize) -> Result<()>;

    /// Tells every peer this role is leaving. Peers that already left are not an error.
    async fn shutdown(&mut self) -> Result<()>;
}
