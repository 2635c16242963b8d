//! Call Engine Module - peer connection side of a call
//!
//! This module provides:
//! - The peer connection contract the session drives
//! - A WebRTC implementation of that contract

mod adapter;
mod engine;

#[cfg(test)]
pub(crate) use adapter::mock;
pub use adapter::{
    AdapterEvent, AdapterFactory, IceCandidate, MediaError, PeerConnectionAdapter,
    PeerConnectionLifecycle, SdpType, SessionDescription,
};
pub use engine::{WebRtcAdapter, WebRtcAdapterFactory, SAMPLE_RATE};
