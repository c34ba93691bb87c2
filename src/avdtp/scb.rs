//! Stream control block
//!
//! One block per local stream endpoint. Stream lifecycle is driven by
//! the dispatch layer; the block itself holds the endpoint identity,
//! its capabilities and the negotiated configuration.

use super::types::{ErrorCode, MediaType, SepConfig, SepInfo, SepType};

#[derive(Debug, Clone, Copy, PartialEq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub(crate) enum StreamState {
    Idle,
    Configured,
    Open,
    Streaming,
}

pub(crate) struct Scb {
    pub seid: u8,
    pub media_type: MediaType,
    pub sep_type: SepType,
    pub in_use: bool,
    pub capabilities: SepConfig,
    pub configuration: Option<SepConfig>,
    /// Peer endpoint bound by Set Configuration.
    pub peer_seid: u8,
    /// Owning signaling channel, an index into the channel pool. An ID
    /// reference, never a borrow.
    pub ccb: Option<u8>,
    pub state: StreamState,
}

impl Scb {
    pub(crate) fn new(seid: u8, media_type: MediaType, sep_type: SepType, capabilities: SepConfig) -> Self {
        Self {
            seid,
            media_type,
            sep_type,
            in_use: false,
            capabilities,
            configuration: None,
            peer_seid: 0,
            ccb: None,
            state: StreamState::Idle,
        }
    }

    pub(crate) fn sep_info(&self) -> SepInfo {
        SepInfo {
            seid: self.seid,
            in_use: self.in_use,
            media_type: self.media_type,
            sep_type: self.sep_type,
        }
    }

    /// Apply a Set Configuration request.
    pub(crate) fn configure(&mut self, ccb: u8, int_seid: u8, config: &SepConfig) -> Result<(), ErrorCode> {
        if self.in_use {
            return Err(ErrorCode::SepInUse);
        }
        if self.state != StreamState::Idle {
            return Err(ErrorCode::BadState);
        }
        self.configuration = Some(config.clone());
        self.peer_seid = int_seid;
        self.ccb = Some(ccb);
        self.in_use = true;
        self.state = StreamState::Configured;
        Ok(())
    }

    /// Apply a Reconfigure request: codec and content protection only,
    /// legal while open but not streaming.
    pub(crate) fn reconfigure(&mut self, config: &SepConfig) -> Result<(), ErrorCode> {
        if self.state != StreamState::Open {
            return Err(ErrorCode::BadState);
        }
        if let Some(active) = self.configuration.as_mut() {
            if !config.codec.is_empty() {
                active.codec = config.codec.clone();
            }
            if !config.protect.is_empty() {
                active.protect = config.protect.clone();
            }
            Ok(())
        } else {
            Err(ErrorCode::BadState)
        }
    }

    pub(crate) fn open(&mut self) -> Result<(), ErrorCode> {
        if self.state != StreamState::Configured {
            return Err(ErrorCode::BadState);
        }
        self.state = StreamState::Open;
        Ok(())
    }

    pub(crate) fn start(&mut self) -> Result<(), ErrorCode> {
        if self.state != StreamState::Open {
            return Err(ErrorCode::BadState);
        }
        self.state = StreamState::Streaming;
        Ok(())
    }

    pub(crate) fn suspend(&mut self) -> Result<(), ErrorCode> {
        if self.state != StreamState::Streaming {
            return Err(ErrorCode::BadState);
        }
        self.state = StreamState::Open;
        Ok(())
    }

    pub(crate) fn close(&mut self) -> Result<(), ErrorCode> {
        if !matches!(self.state, StreamState::Open | StreamState::Streaming) {
            return Err(ErrorCode::BadState);
        }
        self.release();
        Ok(())
    }

    /// Tear the stream down unconditionally (abort, disconnect).
    pub(crate) fn release(&mut self) {
        self.configuration = None;
        self.peer_seid = 0;
        self.ccb = None;
        self.in_use = false;
        self.state = StreamState::Idle;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scb() -> Scb {
        let mut capabilities = SepConfig {
            psc_mask: crate::avdtp::types::PSC_MEDIA_TRANSPORT,
            ..Default::default()
        };
        capabilities.codec.extend_from_slice(&[0x00, 0x00, 0x21]).unwrap();
        Scb::new(1, MediaType::Audio, SepType::Sink, capabilities)
    }

    #[test]
    fn stream_lifecycle() {
        let mut scb = scb();
        let config = SepConfig {
            psc_mask: crate::avdtp::types::PSC_MEDIA_TRANSPORT,
            ..Default::default()
        };

        scb.configure(0, 2, &config).unwrap();
        assert!(scb.in_use);
        assert_eq!(scb.state, StreamState::Configured);
        assert_eq!(scb.configure(0, 2, &config), Err(ErrorCode::SepInUse));

        scb.open().unwrap();
        assert_eq!(scb.open(), Err(ErrorCode::BadState));
        scb.start().unwrap();
        assert_eq!(scb.start(), Err(ErrorCode::BadState));
        assert_eq!(scb.reconfigure(&config), Err(ErrorCode::BadState));
        scb.suspend().unwrap();
        scb.reconfigure(&config).unwrap();
        scb.close().unwrap();
        assert!(!scb.in_use);
        assert_eq!(scb.state, StreamState::Idle);
    }

    #[test]
    fn abort_releases_from_any_state() {
        let mut scb = scb();
        let config = SepConfig::default();
        scb.configure(1, 3, &config).unwrap();
        scb.release();
        assert_eq!(scb.state, StreamState::Idle);
        assert!(!scb.in_use);
        assert!(scb.configuration.is_none());
        assert!(scb.ccb.is_none());
    }
}
