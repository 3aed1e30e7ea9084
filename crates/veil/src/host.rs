//! Desktop host platform
//!
//! A desktop process needs no system permission or installation step:
//! the tunnel is exposed as local SOCKS and DNS listeners only.

use async_trait::async_trait;
use tracing::debug;
use veil_vpn::{HostError, HostPlatform, HostState};

pub struct DesktopHost;

#[async_trait]
impl HostPlatform for DesktopHost {
    async fn state(&self) -> HostState {
        HostState::Ready
    }

    async fn enable(&self) -> bool {
        debug!("Desktop host is always enabled");
        true
    }

    async fn install(&self) -> Result<(), HostError> {
        Ok(())
    }
}
