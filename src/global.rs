//! Process-wide default bridge.
//!
//! Generated stubs that do not take a bridge argument go through
//! [`bridge()`]. The instance is set once, by [`install`] or [`init`], and
//! lives for the rest of the process.

use once_cell::sync::OnceCell;
use tracing::info;

use crate::dispatcher::Bridge;
use crate::error::{BridgeError, Result};

static BRIDGE: OnceCell<Bridge> = OnceCell::new();

/// Install `bridge` as the process-wide default without connecting.
///
/// # Errors
///
/// `AlreadyInitialized` if a bridge was installed before.
pub fn install(bridge: Bridge) -> Result<&'static Bridge> {
    BRIDGE
        .set(bridge)
        .map_err(|_| BridgeError::AlreadyInitialized)?;
    info!("default bridge installed");
    BRIDGE.get().ok_or(BridgeError::NotInitialized)
}

/// Install `bridge` and open its connection.
///
/// The bridge stays installed when connecting fails, so a later
/// `bridge()?.connect()` can retry.
pub async fn init(bridge: Bridge) -> Result<&'static Bridge> {
    let bridge = install(bridge)?;
    bridge.connect().await?;
    Ok(bridge)
}

/// The process-wide default bridge.
///
/// # Errors
///
/// `NotInitialized` before [`install`] or [`init`].
pub fn bridge() -> Result<&'static Bridge> {
    BRIDGE.get().ok_or(BridgeError::NotInitialized)
}
