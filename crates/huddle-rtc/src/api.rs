use std::sync::Arc;
use std::time::Duration;

use huddle_core::ConnectionError;
use tokio::sync::Mutex as AsyncMutex;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::setting_engine::SettingEngine;
use webrtc::api::{API, APIBuilder};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::util::vnet::net::{Net, NetConfig};
use webrtc::util::vnet::router::{Router, RouterConfig};

use crate::convert::backend_error;

pub const DEFAULT_STUN_SERVER: &str = "stun:stun.l.google.com:19302";

/// Peer connection settings shared by every connection a factory opens.
#[derive(Debug, Clone)]
pub struct RtcConfig {
    pub ice_servers: Vec<String>,
    pub disconnected_timeout: Duration,
    pub failed_timeout: Duration,
    pub keepalive_interval: Duration,
}

impl Default for RtcConfig {
    fn default() -> Self {
        Self {
            ice_servers: vec![DEFAULT_STUN_SERVER.to_owned()],
            disconnected_timeout: Duration::from_secs(5),
            failed_timeout: Duration::from_secs(25),
            keepalive_interval: Duration::from_secs(2),
        }
    }
}

impl RtcConfig {
    /// No ICE servers; host candidates only.
    pub fn host_only() -> Self {
        Self {
            ice_servers: Vec::new(),
            ..Self::default()
        }
    }

    pub fn setting_engine(&self) -> SettingEngine {
        let mut setting = SettingEngine::default();
        setting.set_ice_timeouts(
            Some(self.disconnected_timeout),
            Some(self.failed_timeout),
            Some(self.keepalive_interval),
        );
        setting
    }

    pub(crate) fn rtc_configuration(&self) -> RTCConfiguration {
        let ice_servers = if self.ice_servers.is_empty() {
            Vec::new()
        } else {
            vec![RTCIceServer {
                urls: self.ice_servers.clone(),
                ..Default::default()
            }]
        };
        RTCConfiguration {
            ice_servers,
            ..Default::default()
        }
    }
}

pub(crate) fn build_api(setting: SettingEngine) -> Result<API, ConnectionError> {
    let mut media_engine = MediaEngine::default();
    media_engine
        .register_default_codecs()
        .map_err(backend_error)?;

    let mut registry = Registry::new();
    registry = register_default_interceptors(registry, &mut media_engine).map_err(backend_error)?;

    Ok(APIBuilder::new()
        .with_setting_engine(setting)
        .with_media_engine(media_engine)
        .with_interceptor_registry(registry)
        .build())
}

/// Builds one setting engine per address, all attached to a single started
/// virtual router on 10.0.0.0/24. Lets peers connect without OS networking.
pub async fn virtual_lan(
    config: &RtcConfig,
    addresses: &[&str],
) -> Result<Vec<SettingEngine>, ConnectionError> {
    let wan = Arc::new(AsyncMutex::new(
        Router::new(RouterConfig {
            cidr: "10.0.0.0/24".to_owned(),
            ..Default::default()
        })
        .map_err(backend_error)?,
    ));

    let mut settings = Vec::with_capacity(addresses.len());
    for address in addresses {
        let vnet = Arc::new(Net::new(Some(NetConfig {
            static_ips: vec![(*address).to_owned()],
            ..Default::default()
        })));
        attach_vnet_to_router(&vnet, &wan).await?;
        let mut setting = config.setting_engine();
        setting.set_vnet(Some(vnet));
        settings.push(setting);
    }

    {
        let mut router = wan.lock().await;
        router.start().await.map_err(backend_error)?;
    }
    Ok(settings)
}

async fn attach_vnet_to_router(
    vnet: &Arc<Net>,
    router: &Arc<AsyncMutex<Router>>,
) -> Result<(), ConnectionError> {
    let nic = vnet.get_nic().map_err(backend_error)?;
    {
        let nic_clone = Arc::clone(&nic);
        let mut router_guard = router.lock().await;
        router_guard.add_net(nic_clone).await.map_err(backend_error)?;
    }
    {
        let nic_guard = nic.lock().await;
        nic_guard
            .set_router(Arc::clone(router))
            .await
            .map_err(backend_error)?;
    }
    Ok(())
}
