//! Push interface to the extension-host mirror.

use atrium_proto::tabs::{TabGroupDto, TabOperation};
use atrium_proto::{to_value, ProxyId};
use atrium_rpc::{Proxy, RpcConnection, RpcError};

/// Method names accepted by the `tabs_ext` handler on the extension side.
pub mod methods {
    pub const ACCEPT_TAB_MODEL: &str = "accept_tab_model";
    pub const ACCEPT_TAB_GROUP_UPDATE: &str = "accept_tab_group_update";
    pub const ACCEPT_TAB_OPERATION: &str = "accept_tab_operation";
}

/// The remote side of the mirror: the full-model push and the two delta
/// channels. Production code talks RPC ([`RemoteTabsProxy`]); tests record.
#[async_trait::async_trait]
pub trait TabsRemote: Send + Sync {
    async fn accept_tab_model(&self, groups: Vec<TabGroupDto>) -> Result<(), RpcError>;
    async fn accept_tab_group_update(&self, group: TabGroupDto) -> Result<(), RpcError>;
    async fn accept_tab_operation(&self, operation: TabOperation) -> Result<(), RpcError>;
}

/// [`TabsRemote`] over an RPC proxy. Pushes are one-way notifications: the
/// extension-side mirror has nothing to answer, and the per-target FIFO of
/// the engine keeps deltas ordered.
pub struct RemoteTabsProxy {
    proxy: Proxy,
}

impl RemoteTabsProxy {
    pub fn new(conn: &RpcConnection) -> Self {
        Self {
            proxy: conn.proxy(ProxyId::TabsExt),
        }
    }
}

#[async_trait::async_trait]
impl TabsRemote for RemoteTabsProxy {
    async fn accept_tab_model(&self, groups: Vec<TabGroupDto>) -> Result<(), RpcError> {
        let value = to_value(&groups).map_err(atrium_rpc::TransportError::Codec)?;
        self.proxy
            .notify(methods::ACCEPT_TAB_MODEL, vec![value])
            .await?;
        Ok(())
    }

    async fn accept_tab_group_update(&self, group: TabGroupDto) -> Result<(), RpcError> {
        let value = to_value(&group).map_err(atrium_rpc::TransportError::Codec)?;
        self.proxy
            .notify(methods::ACCEPT_TAB_GROUP_UPDATE, vec![value])
            .await?;
        Ok(())
    }

    async fn accept_tab_operation(&self, operation: TabOperation) -> Result<(), RpcError> {
        let value = to_value(&operation).map_err(atrium_rpc::TransportError::Codec)?;
        self.proxy
            .notify(methods::ACCEPT_TAB_OPERATION, vec![value])
            .await?;
        Ok(())
    }
}
