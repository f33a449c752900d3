//! Handler for mutation requests arriving from the extension side.

use std::sync::Arc;

use atrium_proto::{from_value, ProxyId, RemoteError, Value};
use atrium_rpc::{BoxFuture, RequestContext, ServiceHandler};
use tracing::debug;

use crate::mirror::TabsMirror;
use crate::TabHost;

/// Method names accepted by the `tabs_main` handler.
pub mod methods {
    pub const MOVE_TAB: &str = "move_tab";
    pub const CLOSE_TABS: &str = "close_tabs";
    pub const CLOSE_GROUPS: &str = "close_groups";
}

/// Services `tabs_main` requests. Ids are resolved against the mirrored
/// model; the actual mutation is validated and applied by the [`TabHost`],
/// which owns the UI state. Unknown ids answer `false`, they are not errors:
/// the extension side may race a close the user already performed.
pub struct TabsMainHandler {
    mirror: Arc<TabsMirror>,
    host: Arc<dyn TabHost>,
}

impl TabsMainHandler {
    pub fn new(mirror: Arc<TabsMirror>, host: Arc<dyn TabHost>) -> Self {
        Self { mirror, host }
    }
}

fn arg<T: serde::de::DeserializeOwned>(args: &[Value], index: usize) -> Result<T, RemoteError> {
    let value = args
        .get(index)
        .cloned()
        .ok_or_else(|| RemoteError::invalid_args(format!("missing argument {index}")))?;
    from_value(value).map_err(|err| RemoteError::invalid_args(format!("argument {index}: {err}")))
}

impl ServiceHandler for TabsMainHandler {
    fn invoke(
        &self,
        _ctx: RequestContext,
        method: &str,
        args: Vec<Value>,
    ) -> BoxFuture<Result<Value, RemoteError>> {
        let mirror = self.mirror.clone();
        let host = self.host.clone();
        let method = method.to_string();
        Box::pin(async move {
            let ok = match method.as_str() {
                methods::MOVE_TAB => {
                    let tab_id: String = arg(&args, 0)?;
                    let to_index: u32 = arg(&args, 1)?;
                    let group_id: u32 = arg(&args, 2)?;
                    match (mirror.find_tab(&tab_id).await, mirror.find_group(group_id).await) {
                        (Some((tab_bar, widget)), Some(group_bar)) if tab_bar == group_bar => {
                            host.move_widget(group_bar, widget, to_index).await
                        }
                        _ => {
                            debug!(tab_id, group_id, "move_tab target not in model");
                            false
                        }
                    }
                }
                methods::CLOSE_TABS => {
                    let ids: Vec<String> = arg(&args, 0)?;
                    let mut widgets = Vec::new();
                    for id in &ids {
                        if let Some(found) = mirror.find_tab(id).await {
                            widgets.push(found);
                        } else {
                            debug!(tab_id = %id, "close_tabs id not in model");
                        }
                    }
                    if widgets.is_empty() {
                        false
                    } else {
                        host.close_widgets(widgets).await
                    }
                }
                methods::CLOSE_GROUPS => {
                    let ids: Vec<u32> = arg(&args, 0)?;
                    let mut ok = !ids.is_empty();
                    for group_id in ids {
                        match mirror.find_group(group_id).await {
                            Some(bar) => ok &= host.close_bar(bar).await,
                            None => {
                                debug!(group_id, "close_groups id not in model");
                                ok = false;
                            }
                        }
                    }
                    ok
                }
                other => {
                    return Err(RemoteError::unknown_method(ProxyId::TabsMain, other));
                }
            };
            Ok(Value::Bool(ok))
        })
    }
}
