//! `Warbler` API Functions
//!
//! This module provides the public API functions for interacting with the
//! monitor processor task. They use the static channels to communicate with
//! the task and can be called from any async context once the processor is
//! running.
//!
//! Requests are answered strictly in order, one response per request.
//! Long-running operations (codec switching) are accepted immediately and
//! complete through a [`Notification`] instead of blocking the caller.
//!
//! # Usage
//!
//! ```rust,no_run
//! use warbler::api;
//!
//! # async fn example() -> Result<(), warbler::MonitorError> {
//! let devices = api::get_devices().await?;
//! if let Some(device) = devices.first() {
//!     api::ensure_media_codec(device.path.clone(), None).await?;
//! }
//! # Ok(())
//! # }
//! ```

use crate::bus::StreamHandle;
use crate::constants::MAX_DEVICES;
use crate::media::CodecId;
use crate::path::ObjectPath;
use crate::transport::VolumeChannel;
use crate::{
    DeviceInfo, MonitorError, NOTIFICATION_CHANNEL, Notification, REQUEST_CHANNEL,
    RESPONSE_CHANNEL, Request, Response,
};

/// Get the list of tracked Bluetooth devices.
///
/// # Errors
///
/// Returns an error if communication fails or the response is unexpected.
pub async fn get_devices() -> Result<heapless::Vec<DeviceInfo, MAX_DEVICES>, MonitorError> {
    REQUEST_CHANNEL.send(Request::GetDevices).await;
    match RESPONSE_CHANNEL.receive().await {
        Response::Devices(devices) => Ok(devices),
        Response::Error(e) => Err(e),
        _ => Err(MonitorError::InvalidState),
    }
}

/// Negotiate a media codec for a device.
///
/// With `codec` set, only that codec is tried; otherwise every enabled
/// codec is tried in priority order. The call returns as soon as the
/// request is accepted; the outcome arrives as a
/// [`Notification::CodecSwitched`].
///
/// # Errors
///
/// Returns an error if codec switching is not supported for the device,
/// the codec is unknown or disabled, or the device does not exist.
pub async fn ensure_media_codec(
    device: ObjectPath,
    codec: Option<CodecId>,
) -> Result<(), MonitorError> {
    REQUEST_CHANNEL
        .send(Request::EnsureMediaCodec { device, codec })
        .await;
    match RESPONSE_CHANNEL.receive().await {
        Response::Accepted => Ok(()),
        Response::Error(e) => Err(e),
        _ => Err(MonitorError::InvalidState),
    }
}

/// Acquire the kernel stream resource behind a transport.
///
/// Acquisition is reference counted: the first call opens the resource,
/// subsequent calls only bump the count. With `optional` set, an
/// unavailable transport fails instead of forcing the stream active.
///
/// # Errors
///
/// Returns an error if the transport is unknown, its device has no
/// adapter, or the daemon refuses the acquisition.
pub async fn acquire_transport(
    transport: ObjectPath,
    optional: bool,
) -> Result<StreamHandle, MonitorError> {
    REQUEST_CHANNEL
        .send(Request::AcquireTransport {
            transport,
            optional,
        })
        .await;
    match RESPONSE_CHANNEL.receive().await {
        Response::Stream(stream) => Ok(stream),
        Response::Error(e) => Err(e),
        _ => Err(MonitorError::InvalidState),
    }
}

/// Release the kernel stream resource behind a transport.
///
/// Releases are balanced against acquires; the real teardown happens at
/// count zero, deferred by a grace window for SCO transports and held off
/// entirely while keepalive is set.
///
/// # Errors
///
/// Returns an error if the transport is unknown.
pub async fn release_transport(transport: ObjectPath) -> Result<(), MonitorError> {
    REQUEST_CHANNEL
        .send(Request::ReleaseTransport { transport })
        .await;
    match RESPONSE_CHANNEL.receive().await {
        Response::Done => Ok(()),
        Response::Error(e) => Err(e),
        _ => Err(MonitorError::InvalidState),
    }
}

/// Toggle the keepalive hold on a transport.
///
/// While set, the stream resource stays open after the last release;
/// clearing it releases immediately (or after the SCO grace window).
///
/// # Errors
///
/// Returns an error if the transport is unknown.
pub async fn set_transport_keepalive(
    transport: ObjectPath,
    keepalive: bool,
) -> Result<(), MonitorError> {
    REQUEST_CHANNEL
        .send(Request::SetTransportKeepalive {
            transport,
            keepalive,
        })
        .await;
    match RESPONSE_CHANNEL.receive().await {
        Response::Done => Ok(()),
        Response::Error(e) => Err(e),
        _ => Err(MonitorError::InvalidState),
    }
}

/// Set the hardware volume of a transport channel.
///
/// The value is clamped to the profile's hardware volume range and only
/// written to the peer when the device's profile allows hardware volume.
///
/// # Errors
///
/// Returns an error if the transport is unknown.
pub async fn set_transport_volume(
    transport: ObjectPath,
    channel: VolumeChannel,
    volume: u16,
) -> Result<(), MonitorError> {
    REQUEST_CHANNEL
        .send(Request::SetTransportVolume {
            transport,
            channel,
            volume,
        })
        .await;
    match RESPONSE_CHANNEL.receive().await {
        Response::Done => Ok(()),
        Response::Error(e) => Err(e),
        _ => Err(MonitorError::InvalidState),
    }
}

/// Wait for the next lifecycle notification from the monitor.
pub async fn next_notification() -> Notification {
    NOTIFICATION_CHANNEL.receive().await
}
