//! Authoritative tab/group model and delta computation.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use atrium_proto::tabs::{TabDto, TabGroupDto, TabOperation, TabOperationKind};
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, warn};

use crate::remote::TabsRemote;
use crate::{classify_surface, BarId, TabBarSource, WidgetId, WidgetSnapshot};

/// Outcome of [`TabsMirror::wait_for_widget`]. A timed-out wait means the
/// widget never made it into the model; callers can now tell, instead of
/// mistaking the bound for success.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Incorporation {
    Incorporated,
    TimedOut,
}

#[derive(Clone, Debug)]
pub struct MirrorConfig {
    /// Hard bound on event-driven waits, so a dropped event cannot block a
    /// caller indefinitely.
    pub wait_timeout: Duration,
}

impl Default for MirrorConfig {
    fn default() -> Self {
        Self {
            wait_timeout: Duration::from_secs(2),
        }
    }
}

struct TabState {
    widget: WidgetId,
    dto: TabDto,
}

struct GroupState {
    bar: BarId,
    group_id: u32,
    view_column: u32,
    is_active: bool,
    tabs: Vec<TabState>,
}

impl GroupState {
    fn dto(&self) -> TabGroupDto {
        TabGroupDto {
            group_id: self.group_id,
            is_active: self.is_active,
            view_column: self.view_column,
            tabs: self.tabs.iter().map(|t| t.dto.clone()).collect(),
        }
    }

    fn position_of(&self, widget: &WidgetId) -> Option<usize> {
        self.tabs.iter().position(|t| &t.widget == widget)
    }
}

struct MirrorState {
    groups: Vec<GroupState>,
    /// Bar -> group id, stable for as long as the process sees the same bar,
    /// including across full rebuilds.
    bar_groups: HashMap<BarId, u32>,
    next_group_id: u32,
    /// Set by bar add/remove observations; forces the next operation to
    /// rebuild instead of patching around unknown group state.
    group_set_changed: bool,
    built: bool,
    waiters: HashMap<WidgetId, Vec<oneshot::Sender<()>>>,
}

impl MirrorState {
    fn group_of_bar_mut(&mut self, bar: BarId) -> Option<&mut GroupState> {
        self.groups.iter_mut().find(|g| g.bar == bar)
    }

    fn group_id_for_bar(&mut self, bar: BarId) -> u32 {
        if let Some(id) = self.bar_groups.get(&bar) {
            return *id;
        }
        let id = self.next_group_id;
        self.next_group_id += 1;
        self.bar_groups.insert(bar, id);
        id
    }

    fn contains_widget(&self, widget: &WidgetId) -> bool {
        self.groups
            .iter()
            .any(|g| g.tabs.iter().any(|t| &t.widget == widget))
    }

    fn resolve_waiters(&mut self) {
        let mut done = Vec::new();
        for widget in self.waiters.keys() {
            if self
                .groups
                .iter()
                .any(|g| g.tabs.iter().any(|t| &t.widget == widget))
            {
                done.push(widget.clone());
            }
        }
        for widget in done {
            if let Some(senders) = self.waiters.remove(&widget) {
                for tx in senders {
                    let _ = tx.send(());
                }
            }
        }
    }
}

fn tab_id(group_id: u32, widget: &WidgetId) -> String {
    format!("{group_id}~{}", widget.as_str())
}

fn tab_dto(group_id: u32, snapshot: &WidgetSnapshot, is_active: bool) -> TabDto {
    TabDto {
        id: tab_id(group_id, &snapshot.widget),
        label: snapshot.label.clone(),
        input: classify_surface(&snapshot.surface),
        is_active,
        is_pinned: snapshot.is_pinned,
        is_preview: snapshot.is_preview,
        is_dirty: snapshot.is_dirty,
    }
}

enum Outbound {
    Model(Vec<TabGroupDto>),
    Group(TabGroupDto),
    Op(TabOperation),
    Flush(oneshot::Sender<()>),
}

/// Owns the mirrored model and publishes deltas.
///
/// All event methods serialize on one internal lock. Deltas are enqueued in
/// model-mutation order while the lock is held and pushed by a dedicated
/// task, so transport backpressure never blocks event intake or the inbound
/// handler's lookups.
pub struct TabsMirror {
    source: Arc<dyn TabBarSource>,
    config: MirrorConfig,
    state: Mutex<MirrorState>,
    outbound: mpsc::UnboundedSender<Outbound>,
}

impl TabsMirror {
    pub fn new(source: Arc<dyn TabBarSource>, remote: Arc<dyn TabsRemote>) -> Self {
        Self::with_config(source, remote, MirrorConfig::default())
    }

    pub fn with_config(
        source: Arc<dyn TabBarSource>,
        remote: Arc<dyn TabsRemote>,
        config: MirrorConfig,
    ) -> Self {
        let (outbound, rx) = mpsc::unbounded_channel();
        tokio::spawn(drain_outbound(remote, rx));
        Self {
            source,
            config,
            state: Mutex::new(MirrorState {
                groups: Vec::new(),
                bar_groups: HashMap::new(),
                next_group_id: 0,
                group_set_changed: false,
                built: false,
                waiters: HashMap::new(),
            }),
            outbound,
        }
    }

    /// Resolves once every previously enqueued push has been handed to the
    /// remote side.
    pub async fn flush(&self) {
        let (tx, rx) = oneshot::channel();
        if self.outbound.send(Outbound::Flush(tx)).is_ok() {
            let _ = rx.await;
        }
    }

    /// Initial build: enumerate all current bars and push the complete model
    /// in one shot.
    pub async fn build(&self) {
        let mut state = self.state.lock().await;
        self.rebuild_locked(&mut state);
    }

    /// New tab observed at `index`. One OPEN delta, unless bookkeeping is
    /// inconsistent.
    pub async fn on_widget_added(&self, bar: BarId, snapshot: WidgetSnapshot, index: usize) {
        let mut state = self.state.lock().await;
        if self.needs_rebuild(&state) {
            self.rebuild_locked(&mut state);
            return;
        }
        let Some(group) = state.group_of_bar_mut(bar) else {
            warn!(%bar, "open for untracked bar, rebuilding");
            self.rebuild_locked(&mut state);
            return;
        };

        let group_id = group.group_id;
        let dto = tab_dto(group_id, &snapshot, true);
        for tab in &mut group.tabs {
            tab.dto.is_active = false;
        }
        let index = index.min(group.tabs.len());
        group.tabs.insert(
            index,
            TabState {
                widget: snapshot.widget.clone(),
                dto: dto.clone(),
            },
        );

        self.push_operation(TabOperation {
            kind: TabOperationKind::Open,
            group_id,
            index: index as u32,
            tab: dto,
            old_index: None,
        });
        state.resolve_waiters();
    }

    /// Tab removed. One CLOSE delta; subsequent tabs' indices follow their
    /// new positions implicitly.
    pub async fn on_widget_removed(&self, bar: BarId, widget: &WidgetId) {
        let mut state = self.state.lock().await;
        if self.needs_rebuild(&state) {
            self.rebuild_locked(&mut state);
            return;
        }
        let removed = state.group_of_bar_mut(bar).and_then(|group| {
            let index = group.position_of(widget)?;
            let tab = group.tabs.remove(index);
            Some((group.group_id, index, tab.dto))
        });
        let Some((group_id, index, dto)) = removed else {
            warn!(%bar, %widget, "close for untracked tab, rebuilding");
            self.rebuild_locked(&mut state);
            return;
        };

        self.push_operation(TabOperation {
            kind: TabOperationKind::Close,
            group_id,
            index: index as u32,
            tab: dto,
            old_index: None,
        });
    }

    /// Tab relocated within its group. One MOVE delta.
    pub async fn on_widget_moved(&self, bar: BarId, widget: &WidgetId, from: usize, to: usize) {
        let mut state = self.state.lock().await;
        if self.needs_rebuild(&state) {
            self.rebuild_locked(&mut state);
            return;
        }
        let moved = state.group_of_bar_mut(bar).and_then(|group| {
            let index = group.position_of(widget)?;
            if index != from {
                return None;
            }
            let tab = group.tabs.remove(from);
            let to = to.min(group.tabs.len());
            let dto = tab.dto.clone();
            group.tabs.insert(to, tab);
            Some((group.group_id, to, dto))
        });
        let Some((group_id, to, dto)) = moved else {
            warn!(%bar, %widget, from, to, "move for untracked tab, rebuilding");
            self.rebuild_locked(&mut state);
            return;
        };

        self.push_operation(TabOperation {
            kind: TabOperationKind::Move,
            group_id,
            index: to as u32,
            tab: dto,
            old_index: Some(from as u32),
        });
    }

    /// Observable tab property change (label/dirty/pinned/preview). At most
    /// one UPDATE delta; none if nothing observable changed.
    pub async fn on_widget_changed(&self, bar: BarId, snapshot: WidgetSnapshot) {
        let mut state = self.state.lock().await;
        if self.needs_rebuild(&state) {
            self.rebuild_locked(&mut state);
            return;
        }
        let updated = state.group_of_bar_mut(bar).and_then(|group| {
            let index = group.position_of(&snapshot.widget)?;
            let tab = &mut group.tabs[index];
            let next = tab_dto(group.group_id, &snapshot, tab.dto.is_active);
            if next.observably_eq(&tab.dto) {
                return Some(None);
            }
            tab.dto = next.clone();
            Some(Some((group.group_id, index, next)))
        });
        match updated {
            Some(None) => {}
            Some(Some((group_id, index, dto))) => {
                self.push_operation(TabOperation {
                    kind: TabOperationKind::Update,
                    group_id,
                    index: index as u32,
                    tab: dto,
                    old_index: None,
                });
            }
            None => {
                warn!(%bar, widget = %snapshot.widget, "update for untracked tab, rebuilding");
                self.rebuild_locked(&mut state);
            }
        }
    }

    /// The current bar and/or its current widget changed. Group-activation
    /// updates precede the tab updates, and the previously active group is
    /// deactivated first.
    pub async fn on_current_changed(&self, bar: BarId, widget: Option<WidgetId>) {
        let mut state = self.state.lock().await;
        if self.needs_rebuild(&state) {
            self.rebuild_locked(&mut state);
            return;
        }
        if state.group_of_bar_mut(bar).is_none() {
            warn!(%bar, "current-changed for untracked bar, rebuilding");
            self.rebuild_locked(&mut state);
            return;
        }

        // Group activation transition.
        let mut group_updates = Vec::new();
        let activating = state
            .groups
            .iter()
            .find(|g| g.bar == bar)
            .map(|g| !g.is_active)
            .unwrap_or(false);
        if activating {
            for group in &mut state.groups {
                if group.is_active {
                    group.is_active = false;
                    group_updates.push(group.dto());
                }
            }
            let group = state.group_of_bar_mut(bar).expect("bar tracked above");
            group.is_active = true;
            group_updates.push(group.dto());
        }
        for update in group_updates {
            self.push_group_update(update);
        }

        // Tab activation within the group.
        let mut tab_updates = Vec::new();
        let mut missing_widget = false;
        {
            let group = state.group_of_bar_mut(bar).expect("bar tracked above");
            let group_id = group.group_id;
            let target = widget.as_ref().and_then(|w| group.position_of(w));
            if widget.is_some() && target.is_none() {
                missing_widget = true;
            } else {
                for (index, tab) in group.tabs.iter_mut().enumerate() {
                    let should_be_active = Some(index) == target;
                    if tab.dto.is_active != should_be_active {
                        tab.dto.is_active = should_be_active;
                        tab_updates.push(TabOperation {
                            kind: TabOperationKind::Update,
                            group_id,
                            index: index as u32,
                            tab: tab.dto.clone(),
                            old_index: None,
                        });
                    }
                }
                // Deactivations first, activation last.
                tab_updates.sort_by_key(|op| op.tab.is_active);
            }
        }
        if missing_widget {
            warn!(%bar, "current widget untracked, rebuilding");
            self.rebuild_locked(&mut state);
            return;
        }
        for update in tab_updates {
            self.push_operation(update);
        }
    }

    /// Bar added: only records that the group set churned. The next
    /// operation prefers a full rebuild over an incremental patch.
    pub async fn on_bar_added(&self, bar: BarId) {
        let mut state = self.state.lock().await;
        debug!(%bar, "bar added, marking group set changed");
        state.group_set_changed = true;
    }

    pub async fn on_bar_removed(&self, bar: BarId) {
        let mut state = self.state.lock().await;
        debug!(%bar, "bar removed, marking group set changed");
        state.group_set_changed = true;
    }

    /// Resolves once `widget` has been incorporated into the built model, or
    /// after the configured timeout, whichever comes first.
    pub async fn wait_for_widget(&self, widget: &WidgetId) -> Incorporation {
        let rx = {
            let mut state = self.state.lock().await;
            if state.built && state.contains_widget(widget) {
                return Incorporation::Incorporated;
            }
            let (tx, rx) = oneshot::channel();
            state.waiters.entry(widget.clone()).or_default().push(tx);
            rx
        };
        match tokio::time::timeout(self.config.wait_timeout, rx).await {
            Ok(Ok(())) => Incorporation::Incorporated,
            _ => Incorporation::TimedOut,
        }
    }

    /// Full copy of the mirrored model, for the inbound handler and tests.
    pub async fn model(&self) -> Vec<TabGroupDto> {
        let state = self.state.lock().await;
        state.groups.iter().map(|g| g.dto()).collect()
    }

    /// Resolves a mirrored tab id back to its bar and widget.
    pub async fn find_tab(&self, id: &str) -> Option<(BarId, WidgetId)> {
        let state = self.state.lock().await;
        for group in &state.groups {
            for tab in &group.tabs {
                if tab.dto.id == id {
                    return Some((group.bar, tab.widget.clone()));
                }
            }
        }
        None
    }

    /// Resolves a mirrored group id back to its bar.
    pub async fn find_group(&self, group_id: u32) -> Option<BarId> {
        let state = self.state.lock().await;
        state
            .groups
            .iter()
            .find(|g| g.group_id == group_id)
            .map(|g| g.bar)
    }

    fn needs_rebuild(&self, state: &MirrorState) -> bool {
        !state.built || state.group_set_changed
    }

    /// Discards the model and rebuilds it from the source, then pushes the
    /// complete model in one shot. Desync is an expected transient condition,
    /// not an error.
    fn rebuild_locked(&self, state: &mut MirrorState) {
        let bars = self.source.bars();

        // Exactly one group is active: the current bar, or the first bar when
        // none reports current. With zero bars the model is empty and the
        // synthetic "no current bar" state never crosses the boundary.
        let current = bars
            .iter()
            .position(|b| b.is_current)
            .or(if bars.is_empty() { None } else { Some(0) });

        let mut groups = Vec::with_capacity(bars.len());
        for (bar_index, bar) in bars.iter().enumerate() {
            let group_id = state.group_id_for_bar(bar.bar);
            let tabs = bar
                .widgets
                .iter()
                .map(|snapshot| TabState {
                    widget: snapshot.widget.clone(),
                    dto: tab_dto(
                        group_id,
                        snapshot,
                        bar.active_widget.as_ref() == Some(&snapshot.widget),
                    ),
                })
                .collect();
            groups.push(GroupState {
                bar: bar.bar,
                group_id,
                view_column: bar.view_column,
                is_active: Some(bar_index) == current,
                tabs,
            });
        }

        state.groups = groups;
        state.group_set_changed = false;
        state.built = true;
        state.resolve_waiters();

        let model: Vec<TabGroupDto> = state.groups.iter().map(|g| g.dto()).collect();
        debug!(groups = model.len(), "pushing full tab model");
        let _ = self.outbound.send(Outbound::Model(model));
    }

    fn push_operation(&self, operation: TabOperation) {
        debug!(
            kind = ?operation.kind,
            group = operation.group_id,
            index = operation.index,
            tab = %operation.tab.id,
            "pushing tab delta"
        );
        let _ = self.outbound.send(Outbound::Op(operation));
    }

    fn push_group_update(&self, group: TabGroupDto) {
        debug!(group = group.group_id, active = group.is_active, "pushing group update");
        let _ = self.outbound.send(Outbound::Group(group));
    }
}

/// Serially hands enqueued pushes to the remote side; push failures are
/// logged, not surfaced, since the remote mirror recovers from the next full
/// model anyway.
async fn drain_outbound(remote: Arc<dyn TabsRemote>, mut rx: mpsc::UnboundedReceiver<Outbound>) {
    while let Some(item) = rx.recv().await {
        match item {
            Outbound::Model(model) => {
                if let Err(error) = remote.accept_tab_model(model).await {
                    warn!(%error, "full tab model push failed");
                }
            }
            Outbound::Group(group) => {
                if let Err(error) = remote.accept_tab_group_update(group).await {
                    warn!(%error, "group update push failed");
                }
            }
            Outbound::Op(operation) => {
                if let Err(error) = remote.accept_tab_operation(operation).await {
                    warn!(%error, "tab delta push failed");
                }
            }
            Outbound::Flush(done) => {
                let _ = done.send(());
            }
        }
    }
}
