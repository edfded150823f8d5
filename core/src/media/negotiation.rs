//! Offer/answer handshake and ordered ICE candidate application

use crate::error::Result;
use crate::media::device::LocalAudio;
use crate::media::peer::{IceCandidate, PeerConnection, SessionDescription};
use log::{debug, warn};
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::Mutex;

/// Drives one peer connection through negotiation.
///
/// Remote candidates that arrive before the remote description is applied
/// are held in a FIFO and applied in receipt order right after it. The
/// queue lock is held across the description/drain step, so a candidate
/// arriving mid-drain waits and lands after the queued ones.
pub struct Negotiator {
    peer: Arc<dyn PeerConnection>,
    ice: Mutex<IceQueue>,
}

struct IceQueue {
    remote_set: bool,
    pending: VecDeque<IceCandidate>,
}

impl Negotiator {
    /// `early` holds candidates received before the connection existed.
    pub fn new(peer: Arc<dyn PeerConnection>, early: VecDeque<IceCandidate>) -> Self {
        Self {
            peer,
            ice: Mutex::new(IceQueue {
                remote_set: false,
                pending: early,
            }),
        }
    }

    pub fn peer(&self) -> &Arc<dyn PeerConnection> {
        &self.peer
    }

    pub async fn create_offer(&self, local: &LocalAudio) -> Result<SessionDescription> {
        self.peer.add_local_audio(local).await?;
        self.peer.create_offer().await
    }

    pub async fn create_answer(
        &self,
        local: &LocalAudio,
        remote_offer: SessionDescription,
    ) -> Result<SessionDescription> {
        self.peer.add_local_audio(local).await?;
        self.apply_remote(remote_offer).await?;
        self.peer.create_answer().await
    }

    pub async fn apply_answer(&self, remote_answer: SessionDescription) -> Result<()> {
        self.apply_remote(remote_answer).await
    }

    /// Applies the candidate now if the remote description is set,
    /// otherwise queues it.
    pub async fn submit_remote_candidate(&self, candidate: IceCandidate) -> Result<()> {
        let mut ice = self.ice.lock().await;
        if ice.remote_set {
            self.peer.add_ice_candidate(candidate).await
        } else {
            debug!("Queueing ICE candidate until remote description is set");
            ice.pending.push_back(candidate);
            Ok(())
        }
    }

    pub async fn pending_candidates(&self) -> usize {
        self.ice.lock().await.pending.len()
    }

    async fn apply_remote(&self, desc: SessionDescription) -> Result<()> {
        let mut ice = self.ice.lock().await;
        self.peer.set_remote_description(desc).await?;
        ice.remote_set = true;

        let queued = ice.pending.len();
        while let Some(candidate) = ice.pending.pop_front() {
            if let Err(e) = self.peer.add_ice_candidate(candidate).await {
                warn!("Failed to apply queued ICE candidate: {}", e);
            }
        }
        if queued > 0 {
            debug!("Applied {} queued ICE candidates", queued);
        }
        Ok(())
    }
}
