use std::sync::{Arc, Mutex};

use atrium_proto::tabs::TabGroupDto;
use atrium_proto::{to_value, RemoteError, RemoteErrorCode, Value};
use atrium_rpc::{RequestContext, RpcError, ServiceHandler};
use atrium_tabs::handler::{methods, TabsMainHandler};
use atrium_tabs::mirror::TabsMirror;
use atrium_tabs::remote::TabsRemote;
use atrium_tabs::{
    BarId, BarSnapshot, SurfaceKind, TabBarSource, TabHost, WidgetId, WidgetSnapshot,
};

#[derive(Clone, Debug, PartialEq)]
enum HostCall {
    CloseWidgets(Vec<(BarId, WidgetId)>),
    CloseBar(BarId),
    MoveWidget(BarId, WidgetId, u32),
}

#[derive(Default)]
struct FakeHost {
    calls: Mutex<Vec<HostCall>>,
    refuse: std::sync::atomic::AtomicBool,
}

impl FakeHost {
    fn take(&self) -> Vec<HostCall> {
        std::mem::take(&mut self.calls.lock().unwrap())
    }

    fn answer(&self) -> bool {
        !self.refuse.load(std::sync::atomic::Ordering::Relaxed)
    }
}

#[async_trait::async_trait]
impl TabHost for FakeHost {
    async fn close_widgets(&self, widgets: Vec<(BarId, WidgetId)>) -> bool {
        self.calls.lock().unwrap().push(HostCall::CloseWidgets(widgets));
        self.answer()
    }

    async fn close_bar(&self, bar: BarId) -> bool {
        self.calls.lock().unwrap().push(HostCall::CloseBar(bar));
        self.answer()
    }

    async fn move_widget(&self, bar: BarId, widget: WidgetId, to_index: u32) -> bool {
        self.calls
            .lock()
            .unwrap()
            .push(HostCall::MoveWidget(bar, widget, to_index));
        self.answer()
    }
}

struct NullRemote;

#[async_trait::async_trait]
impl TabsRemote for NullRemote {
    async fn accept_tab_model(&self, _groups: Vec<TabGroupDto>) -> Result<(), RpcError> {
        Ok(())
    }

    async fn accept_tab_group_update(&self, _group: TabGroupDto) -> Result<(), RpcError> {
        Ok(())
    }

    async fn accept_tab_operation(
        &self,
        _operation: atrium_proto::tabs::TabOperation,
    ) -> Result<(), RpcError> {
        Ok(())
    }
}

struct FixedBars(Vec<BarSnapshot>);

impl TabBarSource for FixedBars {
    fn bars(&self) -> Vec<BarSnapshot> {
        self.0.clone()
    }
}

fn widget(uri: &str) -> WidgetSnapshot {
    WidgetSnapshot {
        widget: WidgetId(uri.to_string()),
        label: uri.to_string(),
        surface: SurfaceKind::Editor { uri: uri.to_string() },
        is_dirty: false,
        is_pinned: false,
        is_preview: false,
    }
}

/// Mirror built over two bars: bar 1 (group 0) with a and b, bar 2 (group 1)
/// with c.
async fn setup() -> (TabsMainHandler, Arc<FakeHost>) {
    let source = Arc::new(FixedBars(vec![
        BarSnapshot {
            bar: BarId(1),
            is_current: true,
            view_column: 1,
            widgets: vec![widget("file:///a"), widget("file:///b")],
            active_widget: Some(WidgetId("file:///a".into())),
        },
        BarSnapshot {
            bar: BarId(2),
            is_current: false,
            view_column: 2,
            widgets: vec![widget("file:///c")],
            active_widget: None,
        },
    ]));
    let mirror = Arc::new(TabsMirror::new(source, Arc::new(NullRemote)));
    mirror.build().await;

    let host = Arc::new(FakeHost::default());
    (TabsMainHandler::new(mirror, host.clone()), host)
}

async fn invoke(
    handler: &TabsMainHandler,
    method: &str,
    args: Vec<Value>,
) -> Result<Value, RemoteError> {
    handler.invoke(RequestContext::detached(), method, args).await
}

fn arg<T: serde::Serialize>(value: &T) -> Value {
    to_value(value).unwrap()
}

#[tokio::test]
async fn move_tab_resolves_the_id_and_forwards_to_the_host() {
    let (handler, host) = setup().await;

    let result = invoke(
        &handler,
        methods::MOVE_TAB,
        vec![arg(&"0~file:///a"), arg(&1u32), arg(&0u32)],
    )
    .await
    .unwrap();

    assert_eq!(result, Value::Bool(true));
    assert_eq!(
        host.take(),
        vec![HostCall::MoveWidget(
            BarId(1),
            WidgetId("file:///a".into()),
            1
        )]
    );
}

#[tokio::test]
async fn move_tab_across_groups_is_refused_without_touching_the_host() {
    let (handler, host) = setup().await;

    // Target group 1 belongs to a different bar than the tab.
    let result = invoke(
        &handler,
        methods::MOVE_TAB,
        vec![arg(&"0~file:///a"), arg(&0u32), arg(&1u32)],
    )
    .await
    .unwrap();

    assert_eq!(result, Value::Bool(false));
    assert_eq!(host.take(), vec![]);
}

#[tokio::test]
async fn close_tabs_resolves_known_ids_and_skips_stale_ones() {
    let (handler, host) = setup().await;

    let result = invoke(
        &handler,
        methods::CLOSE_TABS,
        vec![arg(&vec!["0~file:///b", "0~file:///gone"])],
    )
    .await
    .unwrap();

    assert_eq!(result, Value::Bool(true));
    assert_eq!(
        host.take(),
        vec![HostCall::CloseWidgets(vec![(
            BarId(1),
            WidgetId("file:///b".into())
        )])]
    );
}

#[tokio::test]
async fn close_tabs_with_only_stale_ids_answers_false() {
    let (handler, host) = setup().await;

    let result = invoke(
        &handler,
        methods::CLOSE_TABS,
        vec![arg(&vec!["9~file:///nowhere"])],
    )
    .await
    .unwrap();

    assert_eq!(result, Value::Bool(false));
    assert_eq!(host.take(), vec![]);
}

#[tokio::test]
async fn close_groups_ands_the_per_group_results() {
    let (handler, host) = setup().await;

    let result = invoke(&handler, methods::CLOSE_GROUPS, vec![arg(&vec![0u32, 1u32])])
        .await
        .unwrap();
    assert_eq!(result, Value::Bool(true));
    assert_eq!(
        host.take(),
        vec![HostCall::CloseBar(BarId(1)), HostCall::CloseBar(BarId(2))]
    );

    // One unknown group id drags the aggregate down to false.
    let result = invoke(&handler, methods::CLOSE_GROUPS, vec![arg(&vec![0u32, 7u32])])
        .await
        .unwrap();
    assert_eq!(result, Value::Bool(false));
    assert_eq!(host.take(), vec![HostCall::CloseBar(BarId(1))]);
}

#[tokio::test]
async fn host_refusal_propagates_as_false() {
    let (handler, host) = setup().await;
    host.refuse.store(true, std::sync::atomic::Ordering::Relaxed);

    let result = invoke(
        &handler,
        methods::MOVE_TAB,
        vec![arg(&"0~file:///a"), arg(&0u32), arg(&0u32)],
    )
    .await
    .unwrap();
    assert_eq!(result, Value::Bool(false));
}

#[tokio::test]
async fn missing_and_malformed_arguments_are_invalid_args() {
    let (handler, _) = setup().await;

    let err = invoke(&handler, methods::MOVE_TAB, vec![arg(&"0~file:///a")])
        .await
        .unwrap_err();
    assert_eq!(err.code, RemoteErrorCode::InvalidArgs);

    let err = invoke(
        &handler,
        methods::MOVE_TAB,
        vec![arg(&"0~file:///a"), arg(&"not-an-index"), arg(&0u32)],
    )
    .await
    .unwrap_err();
    assert_eq!(err.code, RemoteErrorCode::InvalidArgs);
}

#[tokio::test]
async fn unknown_method_is_a_typed_rejection() {
    let (handler, _) = setup().await;
    let err = invoke(&handler, "paint_tab", vec![]).await.unwrap_err();
    assert_eq!(err.code, RemoteErrorCode::UnknownMethod);
}
