//! Relay media tracks
//!
//! A remote track received from a publisher cannot be attached to another
//! peer connection directly. The relay copies its RTP packets into a local
//! static track; that local track is what gets cloned onto every viewer
//! session, so one publisher track fans out to any number of viewers.

use log::{debug, info};
use std::sync::{Arc, Weak};
use std::time::Duration;
use webrtc::api::media_engine::{MIME_TYPE_OPUS, MIME_TYPE_VP8};
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtcp::payload_feedbacks::picture_loss_indication::PictureLossIndication;
use webrtc::rtp_transceiver::rtp_codec::{RTCRtpCodecCapability, RTPCodecType};
use webrtc::track::track_local::track_local_static_rtp::TrackLocalStaticRTP;
use webrtc::track::track_local::{TrackLocal, TrackLocalWriter};
use webrtc::track::track_remote::TrackRemote;

/// Track that can be attached to any number of viewer sessions
#[derive(Clone)]
pub struct MediaTrack {
    local: Arc<TrackLocalStaticRTP>,
}

impl MediaTrack {
    pub fn new(
        capability: RTCRtpCodecCapability,
        id: impl Into<String>,
        stream_id: impl Into<String>,
    ) -> Self {
        Self {
            local: Arc::new(TrackLocalStaticRTP::new(capability, id.into(), stream_id.into())),
        }
    }

    /// VP8 video track
    pub fn video(id: impl Into<String>, stream_id: impl Into<String>) -> Self {
        Self::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_VP8.to_string(),
                clock_rate: 90000,
                ..Default::default()
            },
            id,
            stream_id,
        )
    }

    /// Opus audio track
    pub fn audio(id: impl Into<String>, stream_id: impl Into<String>) -> Self {
        Self::new(
            RTCRtpCodecCapability {
                mime_type: MIME_TYPE_OPUS.to_string(),
                clock_rate: 48000,
                channels: 2,
                ..Default::default()
            },
            id,
            stream_id,
        )
    }

    pub fn id(&self) -> &str {
        self.local.id()
    }

    pub fn stream_id(&self) -> &str {
        self.local.stream_id()
    }

    pub fn kind(&self) -> RTPCodecType {
        self.local.kind()
    }

    /// Local track handle for `RTCPeerConnection::add_track`
    pub fn as_track_local(&self) -> Arc<dyn TrackLocal + Send + Sync> {
        self.local.clone()
    }
}

/// Start relaying a publisher's remote track and return the relay track
///
/// Packets are copied until the remote track ends. For video, a picture loss
/// indication is sent to the publisher every `keyframe_interval` so viewers
/// that join late get a keyframe quickly; a zero interval disables it.
pub fn relay_remote_track(
    remote: Arc<TrackRemote>,
    peer_connection: Weak<RTCPeerConnection>,
    keyframe_interval: Duration,
) -> MediaTrack {
    let codec = remote.codec();
    let track = MediaTrack::new(codec.capability.clone(), remote.id(), remote.stream_id());
    let track_id = track.id().to_string();
    let local = track.local.clone();
    let media_ssrc = remote.ssrc();

    info!(
        "Relaying {} track {} (ssrc={}, codec={})",
        remote.kind(),
        track_id,
        media_ssrc,
        codec.capability.mime_type
    );

    if remote.kind() == RTPCodecType::Video && !keyframe_interval.is_zero() {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(keyframe_interval);
            loop {
                ticker.tick().await;
                let Some(pc) = peer_connection.upgrade() else {
                    break;
                };
                let pli = PictureLossIndication {
                    sender_ssrc: 0,
                    media_ssrc,
                };
                if pc.write_rtcp(&[Box::new(pli)]).await.is_err() {
                    break;
                }
            }
        });
    }

    tokio::spawn(async move {
        let mut forwarded: u64 = 0;
        loop {
            match remote.read_rtp().await {
                Ok((packet, _)) => {
                    // ErrClosedPipe only means no viewer is bound yet
                    if let Err(e) = local.write_rtp(&packet).await {
                        if e != webrtc::Error::ErrClosedPipe {
                            debug!("Track {} write error after {} packets: {}", track_id, forwarded, e);
                            break;
                        }
                    }
                    forwarded += 1;
                }
                Err(e) => {
                    debug!("Track {} relay stopped after {} packets: {}", track_id, forwarded, e);
                    break;
                }
            }
        }
    });

    track
}
